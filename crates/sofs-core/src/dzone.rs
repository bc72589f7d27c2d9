//! Data-cluster allocation.
//!
//! The two in-superblock caches act as a bounded producer/consumer buffer
//! over the free-cluster bitmap: `replenish` refills the retrieval cache by
//! scanning the bitmap circularly from `fctable_pos`, `deplete` drains the
//! insertion cache back into the bitmap. A cluster popped while its
//! cluster-to-inode map entry still names an owner is dirty and is cleaned
//! out of that owner's reference lists before reuse.

use crate::volume::Volume;
use sofs_block::ByteDevice;
use sofs_error::{Inconsistency, Result, SofsError};
use sofs_types::{
    BlockNumber, DZONE_CACHE_SIZE, NULL_CLUSTER, NULL_INODE, bitmap_locus, bitmap_mask,
    cluster_to_block, map_locus,
};
use tracing::trace;

impl<D: ByteDevice> Volume<D> {
    /// Physical number of the first block of a data cluster.
    pub(crate) fn cluster_phys(&mut self, n_clust: u32) -> Result<BlockNumber> {
        let sb = self.sb()?;
        if n_clust >= sb.dzone_total {
            return Err(SofsError::Invalid("data cluster number out of range"));
        }
        Ok(cluster_to_block(sb.dzone_start, n_clust))
    }

    /// The cluster-to-inode map entry for a data cluster.
    pub(crate) fn map_entry(&mut self, n_clust: u32) -> Result<u32> {
        let total = self.sb()?.dzone_total;
        let (n_blk, slot) =
            map_locus(n_clust, total).ok_or(SofsError::Invalid("data cluster number out of range"))?;
        self.load_map_block(n_blk)?;
        Ok(self.map_block()?.refs[slot as usize])
    }

    /// Associate a data cluster with the inode that owns it.
    pub(crate) fn map_cluster(&mut self, n_inode: u32, n_clust: u32) -> Result<()> {
        let (itotal, total) = {
            let sb = self.sb()?;
            (sb.itotal, sb.dzone_total)
        };
        if n_clust == 0 || n_inode >= itotal {
            return Err(SofsError::Invalid("cluster mapping out of range"));
        }
        let (n_blk, slot) =
            map_locus(n_clust, total).ok_or(SofsError::Invalid("data cluster number out of range"))?;
        self.load_map_block(n_blk)?;
        self.map_block()?.refs[slot as usize] = n_inode;
        self.store_map_block()
    }

    /// Dissociate a data cluster from the inode it is mapped to.
    pub(crate) fn unmap_cluster(&mut self, n_inode: u32, n_clust: u32) -> Result<()> {
        let (itotal, total) = {
            let sb = self.sb()?;
            (sb.itotal, sb.dzone_total)
        };
        if n_clust == 0 || n_inode >= itotal {
            return Err(SofsError::Invalid("cluster mapping out of range"));
        }
        let (n_blk, slot) =
            map_locus(n_clust, total).ok_or(SofsError::Invalid("data cluster number out of range"))?;
        self.load_map_block(n_blk)?;
        let entry = &mut self.map_block()?.refs[slot as usize];
        if *entry != n_inode {
            return Err(SofsError::Inconsistent(Inconsistency::ClusterInodeMismatch));
        }
        *entry = NULL_INODE;
        self.store_map_block()
    }

    /// Whether a data cluster is currently free: its bitmap bit is set, or
    /// its reference sits in one of the two superblock caches.
    pub(crate) fn data_cluster_is_free(&mut self, n_clust: u32) -> Result<bool> {
        let (total, cached) = {
            let sb = self.sb()?;
            let cached = sb
                .dzone_retriev
                .retrieval_entries()
                .iter()
                .chain(sb.dzone_insert.insertion_entries())
                .any(|r| *r == n_clust);
            (sb.dzone_total, cached)
        };
        if cached {
            return Ok(true);
        }
        let (n_blk, byte, bit) =
            bitmap_locus(n_clust, total).ok_or(SofsError::Invalid("data cluster number out of range"))?;
        self.load_bitmap_block(n_blk)?;
        Ok(self.bitmap_block()?[byte as usize] & bitmap_mask(bit) != 0)
    }

    /// Allocate a free data cluster.
    ///
    /// Pops the retrieval cache, replenishing it from the bitmap first if it
    /// is empty. A popped cluster whose map entry still names an owner is in
    /// the dirty state and is cleaned before being handed out.
    pub fn alloc_data_cluster(&mut self) -> Result<u32> {
        if self.sb()?.dzone_free == 0 {
            return Err(SofsError::NoSpace);
        }
        self.sb()?.quick_check()?;

        if self.sb()?.dzone_retriev.idx == DZONE_CACHE_SIZE as u32 {
            self.replenish()?;
        }

        let (idx, n_clust) = {
            let cache = &self.sb()?.dzone_retriev;
            (cache.idx as usize, cache.cache[cache.idx as usize])
        };
        if n_clust == NULL_CLUSTER {
            return Err(SofsError::Inconsistent(Inconsistency::ClusterCaches));
        }

        let owner = self.map_entry(n_clust)?;
        if owner != NULL_INODE {
            self.clean_data_cluster(n_clust, owner)?;
        }

        {
            let sb = self.sb()?;
            sb.dzone_retriev.cache[idx] = NULL_CLUSTER;
            sb.dzone_retriev.idx += 1;
            sb.dzone_free -= 1;
        }
        self.store_superblock()?;
        trace!(target: "sofs::alloc", event = "alloc_data_cluster", n_clust);
        Ok(n_clust)
    }

    /// Free an allocated data cluster.
    ///
    /// The reference goes into the insertion cache (draining it first when
    /// full); the cluster-to-inode map entry is left in place, keeping the
    /// cluster recoverable until it is cleaned. Cluster 0 (the root
    /// directory) can never be freed.
    pub fn free_data_cluster(&mut self, n_clust: u32) -> Result<()> {
        self.sb()?.quick_check()?;
        let total = self.sb()?.dzone_total;
        if n_clust == 0 || n_clust >= total {
            return Err(SofsError::Invalid("data cluster number out of range"));
        }
        if self.data_cluster_is_free(n_clust)? {
            return Err(SofsError::Inconsistent(Inconsistency::ClusterNotAllocated));
        }

        if self.sb()?.dzone_insert.idx == DZONE_CACHE_SIZE as u32 {
            self.deplete()?;
        }

        {
            let sb = self.sb()?;
            let idx = sb.dzone_insert.idx as usize;
            sb.dzone_insert.cache[idx] = n_clust;
            sb.dzone_insert.idx += 1;
            sb.dzone_free += 1;
        }
        self.store_superblock()?;
        trace!(target: "sofs::alloc", event = "free_data_cluster", n_clust);
        Ok(())
    }

    /// Refill the retrieval cache from the bitmap.
    ///
    /// Scans circularly from `fctable_pos`, capturing up to
    /// `min(dzone_free, DZONE_CACHE_SIZE)` set bits and clearing each as it
    /// is taken. If a full revolution comes up short while `dzone_free`
    /// promises more, the insertion cache is drained back into the bitmap
    /// and the scan resumes; a second dry revolution means the free total is
    /// inconsistent.
    fn replenish(&mut self) -> Result<()> {
        let (total, free, start_pos) = {
            let sb = self.sb()?;
            (sb.dzone_total, sb.dzone_free, sb.fctable_pos)
        };
        let want = free.min(DZONE_CACHE_SIZE as u32) as usize;
        let mut captured: Vec<u32> = Vec::with_capacity(want);

        let mut pos = start_pos;
        pos = self.scan_bitmap(pos, pos, total, want, &mut captured)?;

        if captured.len() < want {
            self.deplete()?;
            let resume = pos;
            pos = self.scan_bitmap(pos, resume, total, want, &mut captured)?;
            if captured.len() < want {
                return Err(SofsError::Inconsistent(Inconsistency::FreeClusterTotal));
            }
        }

        let sb = self.sb()?;
        let base = DZONE_CACHE_SIZE - want;
        for (i, reference) in captured.iter().enumerate() {
            sb.dzone_retriev.cache[base + i] = *reference;
        }
        sb.dzone_retriev.idx = base as u32;
        sb.fctable_pos = pos;
        trace!(target: "sofs::alloc", event = "replenish", captured = want);
        Ok(())
    }

    /// One revolution of the bitmap at most, from `pos` back around to
    /// `stop`. Returns the position one past the last scanned bit.
    fn scan_bitmap(
        &mut self,
        mut pos: u32,
        stop: u32,
        total: u32,
        want: usize,
        captured: &mut Vec<u32>,
    ) -> Result<u32> {
        loop {
            if captured.len() == want {
                return Ok(pos);
            }
            let (n_blk, byte, bit) = bitmap_locus(pos, total)
                .ok_or(SofsError::Inconsistent(Inconsistency::DataZone))?;
            self.load_bitmap_block(n_blk)?;
            let mask = bitmap_mask(bit);
            let block = self.bitmap_block()?;
            if block[byte as usize] & mask != 0 {
                block[byte as usize] &= !mask;
                self.store_bitmap_block()?;
                captured.push(pos);
            }
            pos = (pos + 1) % total;
            if pos == stop {
                return Ok(pos);
            }
        }
    }

    /// Drain the insertion cache: set the bitmap bit of every held reference
    /// and reset the cache to empty.
    fn deplete(&mut self) -> Result<()> {
        let (total, entries) = {
            let sb = self.sb()?;
            (sb.dzone_total, sb.dzone_insert.insertion_entries().to_vec())
        };
        for reference in &entries {
            let (n_blk, byte, bit) = bitmap_locus(*reference, total)
                .ok_or(SofsError::Inconsistent(Inconsistency::ClusterCaches))?;
            self.load_bitmap_block(n_blk)?;
            let mask = bitmap_mask(bit);
            self.bitmap_block()?[byte as usize] |= mask;
            self.store_bitmap_block()?;
        }
        {
            let sb = self.sb()?;
            for slot in 0..entries.len() {
                sb.dzone_insert.cache[slot] = NULL_CLUSTER;
            }
            sb.dzone_insert.idx = 0;
        }
        self.store_superblock()?;
        trace!(target: "sofs::alloc", event = "deplete", drained = entries.len());
        Ok(())
    }

    /// Clean a dirty data cluster: locate its reference in the former
    /// owner's lists, null it, and dissociate the cluster from the owner.
    pub(crate) fn clean_data_cluster(&mut self, n_clust: u32, owner: u32) -> Result<()> {
        let (itotal, dzone_start) = {
            let sb = self.sb()?;
            (sb.itotal, sb.dzone_start)
        };
        if owner >= itotal {
            return Err(SofsError::Inconsistent(Inconsistency::ClusterMap));
        }
        let mut inode = self.get_inode_raw(owner)?;

        // Direct list.
        for i in 0..inode.direct.len() {
            if inode.direct[i] == n_clust {
                inode.direct[i] = NULL_CLUSTER;
                inode.clucount -= 1;
                self.put_inode_raw(owner, &inode)?;
                return self.unmap_cluster(owner, n_clust);
            }
        }

        // Contents of the single-indirect cluster.
        if inode.i1 != NULL_CLUSTER {
            self.load_dref_cluster(cluster_to_block(dzone_start, inode.i1))?;
            let found = self
                .dref_cluster()?
                .refs
                .iter()
                .position(|r| *r == n_clust);
            if let Some(slot) = found {
                self.dref_cluster()?.refs[slot] = NULL_CLUSTER;
                self.store_dref_cluster()?;
                inode.clucount -= 1;
                self.put_inode_raw(owner, &inode)?;
                return self.unmap_cluster(owner, n_clust);
            }
        }

        // Contents of every allocated sub-cluster under the double-indirect.
        if inode.i2 != NULL_CLUSTER {
            self.load_sind_cluster(cluster_to_block(dzone_start, inode.i2))?;
            let subs = self.sind_cluster()?.refs;
            for sub in subs {
                if sub == NULL_CLUSTER {
                    continue;
                }
                self.load_dref_cluster(cluster_to_block(dzone_start, sub))?;
                let found = self
                    .dref_cluster()?
                    .refs
                    .iter()
                    .position(|r| *r == n_clust);
                if let Some(slot) = found {
                    self.dref_cluster()?.refs[slot] = NULL_CLUSTER;
                    self.store_dref_cluster()?;
                    inode.clucount -= 1;
                    self.put_inode_raw(owner, &inode)?;
                    return self.unmap_cluster(owner, n_clust);
                }
            }
        }

        Err(SofsError::Inconsistent(Inconsistency::ClusterInodeMismatch))
    }
}
