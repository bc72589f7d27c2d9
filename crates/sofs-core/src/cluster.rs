//! File-cluster indexing.
//!
//! Maps a per-inode logical cluster index to a physical cluster through the
//! direct, single-indirect and double-indirect reference chains, creating
//! intermediate indirection clusters on demand and collapsing them when they
//! empty out.

use crate::inode::InodeStatus;
use crate::volume::Volume;
use sofs_block::{ByteDevice, Cluster};
use sofs_error::{Inconsistency, Result, SofsError};
use sofs_ondisk::{Inode, RefCluster};
use sofs_types::{
    CLUSTER_SIZE, MAX_FILE_CLUSTERS, N_DIRECT, NULL_CLUSTER, RPC, cluster_to_block,
};

/// Operation applied to one file data cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
    /// Report the logical number of the referenced data cluster.
    Get,
    /// Allocate a data cluster and insert it into the chain.
    Alloc,
    /// Free the referenced data cluster, keeping the reference (dirty).
    Free,
    /// Free the referenced data cluster and dissociate it from the inode.
    FreeClean,
    /// Dissociate the referenced data cluster without freeing it.
    Clean,
}

/// Operation applied to a whole range of file data clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    Free,
    FreeClean,
    Clean,
}

impl BulkOp {
    fn per_cluster(self) -> ClusterOp {
        match self {
            Self::Free => ClusterOp::Free,
            Self::FreeClean => ClusterOp::FreeClean,
            Self::Clean => ClusterOp::Clean,
        }
    }

    fn status(self) -> InodeStatus {
        match self {
            Self::Clean => InodeStatus::FreeDirty,
            _ => InodeStatus::InUse,
        }
    }
}

const SINGLE_START: u32 = N_DIRECT as u32;
const DOUBLE_START: u32 = N_DIRECT as u32 + RPC;

impl<D: ByteDevice> Volume<D> {
    /// Handle one data cluster of a file.
    ///
    /// Returns the logical cluster number for `Get` (or `NULL_CLUSTER` when
    /// the slot is unallocated) and `Alloc`; the freeing operations return
    /// `NULL_CLUSTER`. The inode must be in use for everything but `Clean`,
    /// which operates on a free-dirty inode.
    pub fn handle_file_cluster(
        &mut self,
        n_inode: u32,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<u32> {
        let itotal = self.sb()?.itotal;
        if n_inode >= itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        if clust_ind >= MAX_FILE_CLUSTERS {
            return Err(SofsError::Invalid("file cluster index out of range"));
        }

        let status = if op == ClusterOp::Clean {
            InodeStatus::FreeDirty
        } else {
            InodeStatus::InUse
        };
        let mut inode = self.read_inode(n_inode, status)?;

        let out = if clust_ind < SINGLE_START {
            self.handle_direct(n_inode, &mut inode, clust_ind, op)?
        } else if clust_ind < DOUBLE_START {
            self.handle_single_indirect(n_inode, &mut inode, clust_ind, op)?
        } else {
            self.handle_double_indirect(n_inode, &mut inode, clust_ind, op)?
        };

        if op != ClusterOp::Get {
            self.write_inode(n_inode, &inode, status)?;
        }
        self.store_superblock()?;
        Ok(out)
    }

    fn handle_direct(
        &mut self,
        n_inode: u32,
        inode: &mut Inode,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<u32> {
        let slot = clust_ind as usize;
        match op {
            ClusterOp::Get => Ok(inode.direct[slot]),
            ClusterOp::Alloc => {
                if inode.direct[slot] != NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterAlreadyInList));
                }
                let n_clust = self.alloc_data_cluster()?;
                inode.direct[slot] = n_clust;
                inode.clucount += 1;
                self.map_cluster(n_inode, n_clust)?;
                Ok(n_clust)
            }
            ClusterOp::Free => {
                let n_clust = inode.direct[slot];
                if n_clust == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }
                self.free_data_cluster(n_clust)?;
                Ok(NULL_CLUSTER)
            }
            ClusterOp::FreeClean | ClusterOp::Clean => {
                let n_clust = inode.direct[slot];
                if n_clust == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }
                if op == ClusterOp::FreeClean {
                    self.free_data_cluster(n_clust)?;
                }
                self.unmap_cluster(n_inode, n_clust)?;
                inode.direct[slot] = NULL_CLUSTER;
                inode.clucount -= 1;
                Ok(NULL_CLUSTER)
            }
        }
    }

    fn handle_single_indirect(
        &mut self,
        n_inode: u32,
        inode: &mut Inode,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<u32> {
        let dzone_start = self.sb()?.dzone_start;
        let slot = (clust_ind - SINGLE_START) as usize;

        match op {
            ClusterOp::Get => {
                if inode.i1 == NULL_CLUSTER {
                    return Ok(NULL_CLUSTER);
                }
                self.load_dref_cluster(cluster_to_block(dzone_start, inode.i1))?;
                Ok(self.dref_cluster()?.refs[slot])
            }
            ClusterOp::Alloc => {
                let phys = if inode.i1 == NULL_CLUSTER {
                    let i1 = self.alloc_data_cluster()?;
                    inode.i1 = i1;
                    inode.clucount += 1;
                    self.map_cluster(n_inode, i1)?;
                    let phys = cluster_to_block(dzone_start, i1);
                    self.install_dref_cluster(phys, RefCluster::all_null())?;
                    phys
                } else {
                    let phys = cluster_to_block(dzone_start, inode.i1);
                    self.load_dref_cluster(phys)?;
                    phys
                };
                if self.dref_cluster()?.refs[slot] != NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterAlreadyInList));
                }
                // Allocation may pull a dirty cluster whose cleanup evicts
                // this slot; persist first and reload after.
                self.store_dref_cluster()?;
                let n_clust = self.alloc_data_cluster()?;
                self.load_dref_cluster(phys)?;
                self.dref_cluster()?.refs[slot] = n_clust;
                inode.clucount += 1;
                self.map_cluster(n_inode, n_clust)?;
                self.store_dref_cluster()?;
                Ok(n_clust)
            }
            ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                if inode.i1 == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }
                let phys = cluster_to_block(dzone_start, inode.i1);
                self.load_dref_cluster(phys)?;
                let n_clust = self.dref_cluster()?.refs[slot];
                if n_clust == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }
                if op != ClusterOp::Clean {
                    self.free_data_cluster(n_clust)?;
                }
                if op != ClusterOp::Free {
                    self.unmap_cluster(n_inode, n_clust)?;
                    self.load_dref_cluster(phys)?;
                    self.dref_cluster()?.refs[slot] = NULL_CLUSTER;
                    inode.clucount -= 1;
                    self.store_dref_cluster()?;
                    if self.dref_cluster()?.is_all_null() {
                        let i1 = inode.i1;
                        self.unmap_cluster(n_inode, i1)?;
                        self.free_data_cluster(i1)?;
                        inode.i1 = NULL_CLUSTER;
                        inode.clucount -= 1;
                    }
                }
                Ok(NULL_CLUSTER)
            }
        }
    }

    fn handle_double_indirect(
        &mut self,
        n_inode: u32,
        inode: &mut Inode,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<u32> {
        let dzone_start = self.sb()?.dzone_start;
        let k_si = ((clust_ind - DOUBLE_START) / RPC) as usize;
        let k_d = ((clust_ind - SINGLE_START) % RPC) as usize;

        match op {
            ClusterOp::Get => {
                if inode.i2 == NULL_CLUSTER {
                    return Ok(NULL_CLUSTER);
                }
                self.load_sind_cluster(cluster_to_block(dzone_start, inode.i2))?;
                let sub = self.sind_cluster()?.refs[k_si];
                if sub == NULL_CLUSTER {
                    return Ok(NULL_CLUSTER);
                }
                self.load_dref_cluster(cluster_to_block(dzone_start, sub))?;
                Ok(self.dref_cluster()?.refs[k_d])
            }
            ClusterOp::Alloc => {
                let i2_phys = if inode.i2 == NULL_CLUSTER {
                    let i2 = self.alloc_data_cluster()?;
                    inode.i2 = i2;
                    inode.clucount += 1;
                    self.map_cluster(n_inode, i2)?;
                    let phys = cluster_to_block(dzone_start, i2);
                    self.install_sind_cluster(phys, RefCluster::all_null())?;
                    self.store_sind_cluster()?;
                    phys
                } else {
                    let phys = cluster_to_block(dzone_start, inode.i2);
                    self.load_sind_cluster(phys)?;
                    phys
                };

                let mut sub = self.sind_cluster()?.refs[k_si];
                let fresh_sub = sub == NULL_CLUSTER;
                if fresh_sub {
                    self.store_sind_cluster()?;
                    let n_sub = self.alloc_data_cluster()?;
                    self.load_sind_cluster(i2_phys)?;
                    self.sind_cluster()?.refs[k_si] = n_sub;
                    inode.clucount += 1;
                    self.store_sind_cluster()?;
                    self.map_cluster(n_inode, n_sub)?;
                    sub = n_sub;
                }

                let sub_phys = cluster_to_block(dzone_start, sub);
                if fresh_sub {
                    self.install_dref_cluster(sub_phys, RefCluster::all_null())?;
                } else {
                    self.load_dref_cluster(sub_phys)?;
                }
                if self.dref_cluster()?.refs[k_d] != NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterAlreadyInList));
                }
                self.store_dref_cluster()?;
                let n_clust = self.alloc_data_cluster()?;
                self.load_dref_cluster(sub_phys)?;
                self.dref_cluster()?.refs[k_d] = n_clust;
                inode.clucount += 1;
                self.store_dref_cluster()?;
                self.map_cluster(n_inode, n_clust)?;
                Ok(n_clust)
            }
            ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                if inode.i2 == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }
                let i2_phys = cluster_to_block(dzone_start, inode.i2);
                self.load_sind_cluster(i2_phys)?;
                let sub = self.sind_cluster()?.refs[k_si];
                if sub == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }
                let sub_phys = cluster_to_block(dzone_start, sub);
                self.load_dref_cluster(sub_phys)?;
                let n_clust = self.dref_cluster()?.refs[k_d];
                if n_clust == NULL_CLUSTER {
                    return Err(SofsError::Inconsistent(Inconsistency::ClusterNotInList));
                }

                if op != ClusterOp::Clean {
                    self.free_data_cluster(n_clust)?;
                }
                if op != ClusterOp::Free {
                    self.unmap_cluster(n_inode, n_clust)?;
                    self.load_dref_cluster(sub_phys)?;
                    self.dref_cluster()?.refs[k_d] = NULL_CLUSTER;
                    inode.clucount -= 1;
                    self.store_dref_cluster()?;

                    if self.dref_cluster()?.is_all_null() {
                        self.unmap_cluster(n_inode, sub)?;
                        self.free_data_cluster(sub)?;
                        self.load_sind_cluster(i2_phys)?;
                        self.sind_cluster()?.refs[k_si] = NULL_CLUSTER;
                        inode.clucount -= 1;
                        self.store_sind_cluster()?;
                    }

                    self.load_sind_cluster(i2_phys)?;
                    if self.sind_cluster()?.is_all_null() {
                        let i2 = inode.i2;
                        self.unmap_cluster(n_inode, i2)?;
                        self.free_data_cluster(i2)?;
                        inode.i2 = NULL_CLUSTER;
                        inode.clucount -= 1;
                    }
                }
                Ok(NULL_CLUSTER)
            }
        }
    }

    /// Apply `op` to every allocated data cluster of the file from
    /// `clust_ind_in` upwards: the double-indirect range first, then the
    /// single-indirect range, then the direct list.
    pub fn handle_file_clusters(
        &mut self,
        n_inode: u32,
        clust_ind_in: u32,
        op: BulkOp,
    ) -> Result<()> {
        let itotal = self.sb()?.itotal;
        if n_inode >= itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        if clust_ind_in >= MAX_FILE_CLUSTERS {
            return Err(SofsError::Invalid("file cluster index out of range"));
        }
        let status = op.status();
        let per_op = op.per_cluster();
        let dzone_start = self.sb()?.dzone_start;

        // Double-indirect range.
        let inode = self.read_inode(n_inode, status)?;
        if inode.i2 != NULL_CLUSTER {
            self.load_sind_cluster(cluster_to_block(dzone_start, inode.i2))?;
            let subs = self.sind_cluster()?.refs;
            let (k_start, d_start) = if clust_ind_in >= DOUBLE_START {
                (
                    (clust_ind_in - DOUBLE_START) / RPC,
                    (clust_ind_in - DOUBLE_START) % RPC,
                )
            } else {
                (0, 0)
            };
            for k in k_start..RPC {
                let sub = subs[k as usize];
                if sub == NULL_CLUSTER {
                    continue;
                }
                self.load_dref_cluster(cluster_to_block(dzone_start, sub))?;
                let refs = self.dref_cluster()?.refs;
                let first = if k == k_start { d_start } else { 0 };
                for j in first..RPC {
                    if refs[j as usize] != NULL_CLUSTER {
                        self.handle_file_cluster(n_inode, DOUBLE_START + k * RPC + j, per_op)?;
                    }
                }
            }
        }

        // Single-indirect range.
        if clust_ind_in < DOUBLE_START {
            let inode = self.read_inode(n_inode, status)?;
            if inode.i1 != NULL_CLUSTER {
                self.load_dref_cluster(cluster_to_block(dzone_start, inode.i1))?;
                let refs = self.dref_cluster()?.refs;
                let first = clust_ind_in.saturating_sub(SINGLE_START);
                for j in first..RPC {
                    if refs[j as usize] != NULL_CLUSTER {
                        self.handle_file_cluster(n_inode, SINGLE_START + j, per_op)?;
                    }
                }
            }
        }

        // Direct list.
        if clust_ind_in < SINGLE_START {
            let inode = self.read_inode(n_inode, status)?;
            for j in clust_ind_in..SINGLE_START {
                if inode.direct[j as usize] != NULL_CLUSTER {
                    self.handle_file_cluster(n_inode, j, per_op)?;
                }
            }
        }

        Ok(())
    }

    /// Read one data cluster of a file. An unallocated cluster reads as
    /// zeros.
    pub fn read_file_cluster(
        &mut self,
        n_inode: u32,
        clust_ind: u32,
        buf: &mut Cluster,
    ) -> Result<()> {
        let n_clust = self.handle_file_cluster(n_inode, clust_ind, ClusterOp::Get)?;
        if n_clust == NULL_CLUSTER {
            *buf = [0_u8; CLUSTER_SIZE];
        } else {
            let phys = self.cluster_phys(n_clust)?;
            *buf = self.io.read_cluster(phys)?;
        }
        Ok(())
    }

    /// Write one data cluster of a file, allocating it first if needed.
    pub fn write_file_cluster(
        &mut self,
        n_inode: u32,
        clust_ind: u32,
        buf: &Cluster,
    ) -> Result<()> {
        let mut n_clust = self.handle_file_cluster(n_inode, clust_ind, ClusterOp::Get)?;
        if n_clust == NULL_CLUSTER {
            n_clust = self.handle_file_cluster(n_inode, clust_ind, ClusterOp::Alloc)?;
        }
        let phys = self.cluster_phys(n_clust)?;
        self.io.write_cluster(phys, buf)?;
        self.store_superblock()
    }
}
