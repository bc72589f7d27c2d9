#![forbid(unsafe_code)]
//! The SOFS13 object layer.
//!
//! Everything above raw block I/O and below the mount glue: the open-volume
//! context with its object cache, the inode and data-cluster allocators, the
//! direct/single/double-indirect file-cluster indexing, the directory layer
//! with path resolution, the full consistency check, and the formatter.
//!
//! The core is single-threaded and non-reentrant by design: all operations
//! are `&mut self` methods on [`Volume`], and callers serialize externally.

mod check;
mod cluster;
mod dir;
mod dzone;
mod inode;
mod mkfs;
mod path;
mod volume;

pub use check::Finding;
pub use cluster::{BulkOp, ClusterOp};
pub use dir::{AddOp, RemoveOp};
pub use inode::{ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE, InodeStatus};
pub use mkfs::{FormatOptions, Geometry, compute_geometry, format};
pub use volume::{Credentials, Volume};

pub use sofs_error::{Inconsistency, Result, SofsError};
pub use sofs_ondisk::{
    DirCluster, DirEntry, DirEntryState, Inode, InodeKind, InodeVariant, MountStatus, Superblock,
};
