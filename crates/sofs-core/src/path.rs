//! Absolute-path resolution with symbolic-link expansion.
//!
//! Paths are resolved by tail-recursive dirname/basename decomposition, with
//! execute permission required on every traversed directory. At most one
//! symbolic link may be expanded per lookup; a second one fails with *loop*.
//! A relative symlink target is resolved against the directory holding the
//! link.

use crate::inode::{ACCESS_EXEC, InodeStatus};
use crate::volume::Volume;
use sofs_block::ByteDevice;
use sofs_error::{Result, SofsError};
use sofs_ondisk::InodeKind;
use sofs_types::{CLUSTER_SIZE, MAX_NAME, MAX_PATH};

/// Root directory inode number.
const ROOT_INODE: u32 = 0;

/// Symbolic links a single lookup may traverse.
const SYMLINK_BUDGET: u32 = 1;

impl<D: ByteDevice> Volume<D> {
    /// Resolve an absolute path to the inode of its last component and of
    /// the directory holding it.
    ///
    /// Returns `(n_inode_dir, n_inode_ent)`.
    pub fn get_dir_entry_by_path(&mut self, path: &str) -> Result<(u32, u32)> {
        if path.is_empty() {
            return Err(SofsError::Invalid("empty path"));
        }
        if path.len() > MAX_PATH {
            return Err(SofsError::NameTooLong);
        }
        if !path.starts_with('/') {
            return Err(SofsError::RelativePath);
        }
        let mut symlinks = 0_u32;
        self.walk_path(path, ROOT_INODE, &mut symlinks)
    }

    fn walk_path(&mut self, path: &str, base_dir: u32, symlinks: &mut u32) -> Result<(u32, u32)> {
        let (dir_part, base_name) = split_path(path);
        if base_name.len() > MAX_NAME {
            return Err(SofsError::NameTooLong);
        }

        let n_dir = if dir_part == "/" {
            ROOT_INODE
        } else if dir_part == "." {
            base_dir
        } else {
            let (_, ent) = self.walk_path(dir_part, base_dir, symlinks)?;
            ent
        };

        let dir_inode = self.read_inode(n_dir, InodeStatus::InUse)?;
        if dir_inode.kind() != Some(InodeKind::Directory) {
            return Err(SofsError::NotDirectory);
        }
        self.access_granted(n_dir, ACCESS_EXEC)?;

        // The root path resolves to the root's own `.` entry.
        let lookup = if base_name == "/" { "." } else { base_name };
        let (n_ent, _) = self.get_dir_entry_by_name(n_dir, lookup)?;

        let ent_inode = self.read_inode(n_ent, InodeStatus::InUse)?;
        if ent_inode.kind() == Some(InodeKind::Symlink) {
            if *symlinks >= SYMLINK_BUDGET {
                return Err(SofsError::Loop);
            }
            *symlinks += 1;
            self.access_granted(n_ent, ACCESS_EXEC)?;

            let mut buf = [0_u8; CLUSTER_SIZE];
            self.read_file_cluster(n_ent, 0, &mut buf)?;
            let target = nul_terminated(&buf)?;
            if target.is_empty() {
                return Err(SofsError::Invalid("empty symbolic link target"));
            }
            if target.len() > MAX_PATH {
                return Err(SofsError::NameTooLong);
            }
            let target = target.to_owned();
            return if target.starts_with('/') {
                self.walk_path(&target, ROOT_INODE, symlinks)
            } else {
                // Relative target: resolve against the link's directory.
                self.walk_path(&target, n_dir, symlinks)
            };
        }

        Ok((n_dir, n_ent))
    }
}

/// Split a path into (dirname, basename) with the libc conventions:
/// `"/a/b"` → `("/a", "b")`, `"/a"` → `("/", "a")`, `"a"` → `(".", "a")`,
/// `"/"` → `("/", "/")`. Trailing slashes are ignored.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/", "/");
    }
    match trimmed.rfind('/') {
        None => (".", trimmed),
        Some(0) => ("/", &trimmed[1..]),
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
    }
}

/// The NUL-terminated string at the start of a symlink's first cluster.
fn nul_terminated(buf: &[u8]) -> Result<&str> {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
        .map_err(|_| SofsError::Invalid("symbolic link target is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::split_path;

    #[test]
    fn split_follows_libc_conventions() {
        assert_eq!(split_path("/a/b"), ("/a", "b"));
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(split_path("a"), (".", "a"));
        assert_eq!(split_path("a/b"), ("a", "b"));
        assert_eq!(split_path("/"), ("/", "/"));
        assert_eq!(split_path("//"), ("/", "/"));
        assert_eq!(split_path("/a/b/"), ("/a", "b"));
        assert_eq!(split_path("/a//b"), ("/a/", "b"));
    }
}
