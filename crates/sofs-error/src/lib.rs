#![forbid(unsafe_code)]
//! Error types for SOFS13.
//!
//! Defines `SofsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the mount integration surface.
//!
//! The whole enum is `Clone` because the object-cache layer retains the first
//! error a slot ever produced and replays it on every later access (the
//! sticky-error discipline); the `Io` variant therefore carries the
//! `std::io::ErrorKind` rather than the non-cloneable `std::io::Error`.

use thiserror::Error;

/// Which on-disk structure a consistency check found to be damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// Superblock metadata (header, table geometry).
    Superblock,
    /// An inode claimed to be in use fails its structural check.
    InodeInUse,
    /// An inode claimed to be free in the dirty state fails its check.
    FreeDirtyInode,
    /// The direct/indirect cluster reference list of an inode.
    InodeRefList,
    /// The double-linked list of free inodes.
    FreeInodeList,
    /// Data-zone metadata in the superblock.
    DataZone,
    /// The retrieval/insertion caches of free cluster references.
    ClusterCaches,
    /// The total number of free data clusters does not add up.
    FreeClusterTotal,
    /// The cluster-to-inode mapping table.
    ClusterMap,
    /// A directory entry.
    DirEntry,
    /// The contents of a directory.
    DirContents,
    /// A data cluster expected to be allocated is not.
    ClusterNotAllocated,
    /// A data cluster is already present in a reference list.
    ClusterAlreadyInList,
    /// A data cluster is missing from a reference list.
    ClusterNotInList,
    /// The cluster-to-inode map names a different owner.
    ClusterInodeMismatch,
    /// The object-cache layer was driven out of protocol.
    ObjectCache,
}

impl Inconsistency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superblock => "superblock metadata",
            Self::InodeInUse => "inode in use",
            Self::FreeDirtyInode => "free inode in the dirty state",
            Self::InodeRefList => "inode cluster reference list",
            Self::FreeInodeList => "double-linked list of free inodes",
            Self::DataZone => "data zone metadata",
            Self::ClusterCaches => "free cluster reference caches",
            Self::FreeClusterTotal => "free data cluster total",
            Self::ClusterMap => "cluster-to-inode mapping",
            Self::DirEntry => "directory entry",
            Self::DirContents => "directory contents",
            Self::ClusterNotAllocated => "data cluster not allocated",
            Self::ClusterAlreadyInList => "data cluster already in the reference list",
            Self::ClusterNotInList => "data cluster not in the reference list",
            Self::ClusterInodeMismatch => "data cluster owner mismatch",
            Self::ObjectCache => "internal object cache",
        }
    }
}

/// Unified error type for all SOFS13 operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SofsError {
    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("access denied")]
    AccessDenied,

    #[error("write denied")]
    WriteDenied,

    #[error("name too long")]
    NameTooLong,

    #[error("too many levels of symbolic links")]
    Loop,

    #[error("relative path not allowed")]
    RelativePath,

    #[error("too many links")]
    TooManyLinks,

    #[error("file too big")]
    FileTooBig,

    #[error("structural inconsistency: {}", .0.as_str())]
    Inconsistent(Inconsistency),
}

impl SofsError {
    /// Convert this error into a POSIX errno suitable for mount replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(_) => libc::EIO,
            Self::Invalid(_) | Self::Format(_) | Self::RelativePath => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::AccessDenied => libc::EACCES,
            Self::WriteDenied => libc::EPERM,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Loop => libc::ELOOP,
            Self::TooManyLinks => libc::EMLINK,
            Self::FileTooBig => libc::EFBIG,
            Self::Inconsistent(_) => libc::ELIBBAD,
        }
    }

    /// Shorthand for a structural-inconsistency error.
    #[must_use]
    pub fn inconsistent(kind: Inconsistency) -> Self {
        Self::Inconsistent(kind)
    }
}

impl From<std::io::Error> for SofsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

/// Result alias using `SofsError`.
pub type Result<T> = std::result::Result<T, SofsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(SofsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(SofsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(SofsError::WriteDenied.to_errno(), libc::EPERM);
        assert_eq!(SofsError::Loop.to_errno(), libc::ELOOP);
        assert_eq!(
            SofsError::Inconsistent(Inconsistency::Superblock).to_errno(),
            libc::ELIBBAD
        );
    }

    #[test]
    fn io_errors_stay_cloneable() {
        let err: SofsError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        let copy = err.clone();
        assert_eq!(err, copy);
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
