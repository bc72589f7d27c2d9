//! Full-volume consistency checks.
//!
//! Verifies the cross-structure invariants the quick checks cannot see: the
//! free-inode list against the free bits, the data-zone accounting across
//! bitmap, caches and cluster-to-inode map, chain-versus-map ownership with
//! cluster counts, and directory shape. Problems are reported as findings,
//! not panics; the formatter refuses to finish on any finding.

use crate::volume::Volume;
use sofs_block::ByteDevice;
use sofs_error::{Inconsistency, Result, SofsError};
use sofs_ondisk::{DirCluster, DirEntryState, Inode, InodeKind, Superblock};
use sofs_types::{
    BSLPC, CLUSTER_SIZE, DPC, NULL_CLUSTER, NULL_INODE, bitmap_locus, bitmap_mask,
    cluster_to_block,
};
use std::fmt;

/// One problem uncovered by the consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: Inconsistency,
    pub detail: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

fn finding(kind: Inconsistency, detail: impl Into<String>) -> Finding {
    Finding {
        kind,
        detail: detail.into(),
    }
}

impl<D: ByteDevice> Volume<D> {
    /// Run every consistency check; I/O failures abort, structural problems
    /// accumulate as findings.
    pub fn check(&mut self) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        let sb = self.sb()?.clone();

        if let Err(err) = sb.quick_check() {
            let kind = match err {
                SofsError::Inconsistent(kind) => kind,
                _ => Inconsistency::Superblock,
            };
            findings.push(finding(kind, "superblock quick check failed"));
            // The remaining checks trust the superblock geometry.
            return Ok(findings);
        }

        let inodes = self.all_inodes(&sb)?;
        check_free_inode_list(&sb, &inodes, &mut findings);
        self.check_data_zone(&sb, &mut findings)?;
        self.check_ownership(&sb, &inodes, &mut findings)?;
        self.check_directories(&sb, &inodes, &mut findings)?;
        Ok(findings)
    }

    fn all_inodes(&mut self, sb: &Superblock) -> Result<Vec<Inode>> {
        let mut inodes = Vec::with_capacity(sb.itotal as usize);
        for blk in 0..sb.itable_size {
            self.load_itable_block(blk)?;
            inodes.extend(self.itable_block()?.inodes.iter().cloned());
        }
        Ok(inodes)
    }

    fn bitmap_bit(&mut self, n_clust: u32, total: u32) -> Result<bool> {
        let (n_blk, byte, bit) = bitmap_locus(n_clust, total)
            .ok_or(SofsError::Inconsistent(Inconsistency::DataZone))?;
        self.load_bitmap_block(n_blk)?;
        Ok(self.bitmap_block()?[byte as usize] & bitmap_mask(bit) != 0)
    }

    /// Invariant: every data cluster is in exactly one of the three free
    /// sets or mapped to an owner, the free sets are pairwise disjoint, and
    /// their union has `dzone_free` members.
    fn check_data_zone(&mut self, sb: &Superblock, findings: &mut Vec<Finding>) -> Result<()> {
        let retriev: Vec<u32> = sb.dzone_retriev.retrieval_entries().to_vec();
        let insert: Vec<u32> = sb.dzone_insert.insertion_entries().to_vec();
        for reference in &retriev {
            if insert.contains(reference) {
                findings.push(finding(
                    Inconsistency::ClusterCaches,
                    format!("cluster {reference} sits in both caches"),
                ));
            }
        }

        let mut free_total = 0_u32;
        for n_clust in 0..sb.dzone_total {
            let bit = self.bitmap_bit(n_clust, sb.dzone_total)?;
            let in_retriev = retriev.contains(&n_clust);
            let in_insert = insert.contains(&n_clust);
            let owner = self.map_entry(n_clust)?;
            let mapped = owner != NULL_INODE;

            if owner != NULL_INODE && owner >= sb.itotal {
                findings.push(finding(
                    Inconsistency::ClusterMap,
                    format!("cluster {n_clust} mapped to nonexistent inode {owner}"),
                ));
            }

            let free_ways = u32::from(bit) + u32::from(in_retriev) + u32::from(in_insert);
            if free_ways > 1 {
                findings.push(finding(
                    Inconsistency::ClusterCaches,
                    format!("cluster {n_clust} is free through {free_ways} channels"),
                ));
            }
            free_total += u32::from(free_ways > 0);

            if free_ways > 0 && mapped {
                findings.push(finding(
                    Inconsistency::ClusterMap,
                    format!("cluster {n_clust} is both free and mapped to inode {owner}"),
                ));
            }
            if free_ways == 0 && !mapped {
                findings.push(finding(
                    Inconsistency::ClusterMap,
                    format!("cluster {n_clust} is neither free nor mapped"),
                ));
            }
        }

        if free_total != sb.dzone_free {
            findings.push(finding(
                Inconsistency::FreeClusterTotal,
                format!("{free_total} free clusters found, superblock says {}", sb.dzone_free),
            ));
        }

        if self.map_entry(0)? != 0 {
            findings.push(finding(
                Inconsistency::ClusterMap,
                "cluster 0 is not mapped to the root inode",
            ));
        }
        if self.bitmap_bit(0, sb.dzone_total)? {
            findings.push(finding(
                Inconsistency::DataZone,
                "cluster 0 is marked free in the bitmap",
            ));
        }
        Ok(())
    }

    /// Invariants: every chain reference of an in-use inode maps back to it,
    /// and `clucount` equals data clusters plus indirection clusters.
    fn check_ownership(
        &mut self,
        sb: &Superblock,
        inodes: &[Inode],
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for (n_inode, inode) in inodes.iter().enumerate() {
            if inode.is_free() {
                continue;
            }
            let n_inode = n_inode as u32;
            let mut attached: Vec<u32> = Vec::new();

            for reference in inode.direct {
                if reference != NULL_CLUSTER {
                    attached.push(reference);
                }
            }
            if inode.i1 != NULL_CLUSTER {
                attached.push(inode.i1);
                self.load_dref_cluster(cluster_to_block(sb.dzone_start, inode.i1))?;
                for reference in self.dref_cluster()?.refs {
                    if reference != NULL_CLUSTER {
                        attached.push(reference);
                    }
                }
            }
            if inode.i2 != NULL_CLUSTER {
                attached.push(inode.i2);
                self.load_sind_cluster(cluster_to_block(sb.dzone_start, inode.i2))?;
                let subs = self.sind_cluster()?.refs;
                for sub in subs {
                    if sub == NULL_CLUSTER {
                        continue;
                    }
                    attached.push(sub);
                    self.load_dref_cluster(cluster_to_block(sb.dzone_start, sub))?;
                    for reference in self.dref_cluster()?.refs {
                        if reference != NULL_CLUSTER {
                            attached.push(reference);
                        }
                    }
                }
            }

            if attached.len() as u32 != inode.clucount {
                findings.push(finding(
                    Inconsistency::InodeRefList,
                    format!(
                        "inode {n_inode} references {} clusters but clucount is {}",
                        attached.len(),
                        inode.clucount
                    ),
                ));
            }
            for n_clust in attached {
                if n_clust >= sb.dzone_total {
                    findings.push(finding(
                        Inconsistency::InodeRefList,
                        format!("inode {n_inode} references cluster {n_clust} out of range"),
                    ));
                    continue;
                }
                let owner = self.map_entry(n_clust)?;
                if owner != n_inode {
                    findings.push(finding(
                        Inconsistency::ClusterInodeMismatch,
                        format!(
                            "cluster {n_clust} attached to inode {n_inode} is mapped to {owner}"
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Invariants: directory sizes are whole clusters and every directory
    /// starts with `.` → self and `..` → its parent (the root is its own).
    fn check_directories(
        &mut self,
        sb: &Superblock,
        inodes: &[Inode],
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let mut buf = [0_u8; CLUSTER_SIZE];
        // Parent expected for each directory, derived from the tree.
        let mut expected_parent: Vec<Option<u32>> = vec![None; inodes.len()];
        expected_parent[0] = Some(0);

        for (n_dir, inode) in inodes.iter().enumerate() {
            if inode.is_free() || inode.kind() != Some(InodeKind::Directory) {
                continue;
            }
            let n_dir = n_dir as u32;
            if inode.size == 0 || inode.size % BSLPC != 0 {
                findings.push(finding(
                    Inconsistency::DirContents,
                    format!("directory {n_dir} has size {}", inode.size),
                ));
                continue;
            }
            for c in 0..inode.size / BSLPC {
                self.read_file_cluster(n_dir, c, &mut buf)?;
                let cluster =
                    DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;
                for (j, entry) in cluster.entries.iter().enumerate() {
                    let idx = c * DPC + j as u32;
                    if entry.state() != DirEntryState::InUse {
                        continue;
                    }
                    if entry.n_inode >= sb.itotal {
                        findings.push(finding(
                            Inconsistency::DirEntry,
                            format!(
                                "entry {:?} of directory {n_dir} names inode {} out of range",
                                entry.name_str(),
                                entry.n_inode
                            ),
                        ));
                        continue;
                    }
                    match idx {
                        0 => {
                            if entry.name_str() != "." || entry.n_inode != n_dir {
                                findings.push(finding(
                                    Inconsistency::DirContents,
                                    format!("directory {n_dir} entry 0 is not `.` to itself"),
                                ));
                            }
                        }
                        1 => {
                            if entry.name_str() != ".." {
                                findings.push(finding(
                                    Inconsistency::DirContents,
                                    format!("directory {n_dir} entry 1 is not `..`"),
                                ));
                            }
                        }
                        _ => {
                            let target = &inodes[entry.n_inode as usize];
                            if target.kind() == Some(InodeKind::Directory) {
                                expected_parent[entry.n_inode as usize] = Some(n_dir);
                            }
                        }
                    }
                }
            }
        }

        // Second pass: every directory's `..` names the directory that holds
        // it (the root's names itself).
        for (n_dir, inode) in inodes.iter().enumerate() {
            if inode.is_free() || inode.kind() != Some(InodeKind::Directory) {
                continue;
            }
            let Some(parent) = expected_parent[n_dir] else {
                continue; // detached subtree; nothing to compare against
            };
            let n_dir = n_dir as u32;
            if inode.size < BSLPC {
                continue;
            }
            self.read_file_cluster(n_dir, 0, &mut buf)?;
            let cluster = DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;
            if cluster.entries[1].n_inode != parent {
                findings.push(finding(
                    Inconsistency::DirContents,
                    format!(
                        "directory {n_dir} has `..` to {} instead of {parent}",
                        cluster.entries[1].n_inode
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Invariant: the inodes carrying the free bit are exactly the ones on the
/// doubly-linked free list, in both walk directions, `ifree` of them.
fn check_free_inode_list(sb: &Superblock, inodes: &[Inode], findings: &mut Vec<Finding>) {
    let free_count = inodes.iter().filter(|i| i.is_free()).count() as u32;
    if free_count != sb.ifree {
        findings.push(finding(
            Inconsistency::FreeInodeList,
            format!("{free_count} inodes carry the free bit, superblock says {}", sb.ifree),
        ));
    }

    for forward in [true, false] {
        let mut cursor = if forward { sb.ihead } else { sb.itail };
        let mut steps = 0_u32;
        let mut visited = vec![false; inodes.len()];
        while cursor != NULL_INODE {
            if cursor >= sb.itotal || visited[cursor as usize] || steps > sb.itotal {
                findings.push(finding(
                    Inconsistency::FreeInodeList,
                    format!("free list walk broken at inode {cursor}"),
                ));
                return;
            }
            visited[cursor as usize] = true;
            let inode = &inodes[cursor as usize];
            if !inode.is_free() {
                findings.push(finding(
                    Inconsistency::FreeInodeList,
                    format!("inode {cursor} on the free list is not free"),
                ));
                return;
            }
            let Ok((prev, next)) = inode.free_link() else {
                findings.push(finding(
                    Inconsistency::FreeInodeList,
                    format!("inode {cursor} carries times instead of list links"),
                ));
                return;
            };
            cursor = if forward { next } else { prev };
            steps += 1;
        }
        if steps != sb.ifree {
            findings.push(finding(
                Inconsistency::FreeInodeList,
                format!(
                    "{} walk visits {steps} inodes, superblock says {}",
                    if forward { "forward" } else { "backward" },
                    sb.ifree
                ),
            ));
        }
    }
}
