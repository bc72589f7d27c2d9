#![forbid(unsafe_code)]
//! Bit-exact on-disk structures of SOFS13.
//!
//! Superblock, inode, directory entry and the two reference-table block
//! shapes, each with a parse/serialize pair and the quick structural checks
//! the object layer runs before trusting a loaded instance. All multi-byte
//! fields are little-endian.

mod dirent;
mod inode;
mod superblock;

pub use dirent::{DirCluster, DirEntry, DirEntryState};
pub use inode::{Inode, InodeBlock, InodeKind, InodeVariant};
pub use superblock::{MountStatus, RefCache, Superblock};

use sofs_types::{BLOCK_SIZE, CLUSTER_SIZE, ParseError, RPB, RPC, read_le_u32};

/// One block of the cluster-to-inode mapping table: `RPB` inode references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefBlock {
    pub refs: [u32; RPB as usize],
}

impl RefBlock {
    pub fn parse(buf: &[u8; BLOCK_SIZE]) -> Result<Self, ParseError> {
        let mut refs = [0_u32; RPB as usize];
        for (slot, reference) in refs.iter_mut().enumerate() {
            *reference = read_le_u32(buf, slot * 4)?;
        }
        Ok(Self { refs })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0_u8; BLOCK_SIZE];
        for (slot, reference) in self.refs.iter().enumerate() {
            buf[slot * 4..slot * 4 + 4].copy_from_slice(&reference.to_le_bytes());
        }
        buf
    }
}

/// One cluster of cluster references: `RPC` slots, used for both the
/// single-indirect and the direct-reference indirection clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCluster {
    pub refs: [u32; RPC as usize],
}

impl RefCluster {
    /// A cluster with every slot null, the initial state of a freshly
    /// allocated indirection cluster.
    #[must_use]
    pub fn all_null() -> Self {
        Self {
            refs: [sofs_types::NULL_CLUSTER; RPC as usize],
        }
    }

    pub fn parse(buf: &[u8; CLUSTER_SIZE]) -> Result<Self, ParseError> {
        let mut refs = [0_u32; RPC as usize];
        for (slot, reference) in refs.iter_mut().enumerate() {
            *reference = read_le_u32(buf, slot * 4)?;
        }
        Ok(Self { refs })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; CLUSTER_SIZE] {
        let mut buf = [0_u8; CLUSTER_SIZE];
        for (slot, reference) in self.refs.iter().enumerate() {
            buf[slot * 4..slot * 4 + 4].copy_from_slice(&reference.to_le_bytes());
        }
        buf
    }

    /// Whether every slot is `NULL_CLUSTER` (the cluster may be collapsed).
    #[must_use]
    pub fn is_all_null(&self) -> bool {
        self.refs.iter().all(|r| *r == sofs_types::NULL_CLUSTER)
    }
}
