//! Directory-entry operations: lookup, add/attach, remove/detach, rename.

use crate::cluster::BulkOp;
use crate::inode::{ACCESS_EXEC, ACCESS_WRITE, InodeStatus};
use crate::volume::Volume;
use sofs_block::ByteDevice;
use sofs_error::{Inconsistency, Result, SofsError};
use sofs_ondisk::{DirCluster, DirEntry, DirEntryState, Inode, InodeKind};
use sofs_types::{BSLPC, CLUSTER_SIZE, DIR_ENTRY_SIZE, DPC, MAX_FILE_SIZE, MAX_NAME};

/// How a new entry is bound into a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOp {
    /// Add a generic entry; a directory target is initialized as empty.
    Add,
    /// Attach a fully organized subsidiary directory, re-pointing its `..`.
    Attach,
}

/// How an entry is taken out of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOp {
    /// Leave the slot dirty-empty (recoverable) and delete the file when the
    /// last hard link goes away.
    Remove,
    /// Fully clear the slot, leaving the target inode alone.
    Detach,
}

/// Outcome of a directory scan for a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirSearch {
    Found { n_inode: u32, idx: u32 },
    Missing { insert_idx: u32 },
}

/// A legal entry name: non-empty, no `/`, at most `MAX_NAME` bytes.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(SofsError::Invalid("not a file name"));
    }
    if name.len() > MAX_NAME {
        return Err(SofsError::NameTooLong);
    }
    Ok(())
}

impl<D: ByteDevice> Volume<D> {
    /// Look up `name` in a directory.
    ///
    /// Returns the entry's inode number and its linear index. The caller
    /// must hold execute permission on the directory.
    pub fn get_dir_entry_by_name(&mut self, n_dir: u32, name: &str) -> Result<(u32, u32)> {
        match self.search_dir_entry(n_dir, name)? {
            DirSearch::Found { n_inode, idx } => Ok((n_inode, idx)),
            DirSearch::Missing { .. } => Err(SofsError::NotFound),
        }
    }

    /// Scan a directory for `name`, also reporting where a new entry would
    /// go: the earliest clean-empty slot, or the append point past the last
    /// allocated entry.
    pub(crate) fn search_dir_entry(&mut self, n_dir: u32, name: &str) -> Result<DirSearch> {
        check_name(name)?;
        let itotal = self.sb()?.itotal;
        if n_dir >= itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        let dir_inode = self.read_inode(n_dir, InodeStatus::InUse)?;
        if dir_inode.kind() != Some(InodeKind::Directory) {
            return Err(SofsError::NotDirectory);
        }
        self.access_granted(n_dir, ACCESS_EXEC)?;
        check_dir_shape(&dir_inode)?;

        let n_clusters = dir_inode.size / BSLPC;
        let mut first_clean: Option<u32> = None;
        let mut buf = [0_u8; CLUSTER_SIZE];
        for c in 0..n_clusters {
            self.read_file_cluster(n_dir, c, &mut buf)?;
            let cluster =
                DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;
            for (j, entry) in cluster.entries.iter().enumerate() {
                let idx = c * DPC + j as u32;
                match entry.state() {
                    DirEntryState::CleanEmpty => {
                        if first_clean.is_none() {
                            first_clean = Some(idx);
                        }
                    }
                    DirEntryState::InUse if entry.name_str() == name => {
                        return Ok(DirSearch::Found {
                            n_inode: entry.n_inode,
                            idx,
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(DirSearch::Missing {
            insert_idx: first_clean.unwrap_or(n_clusters * DPC),
        })
    }

    /// Add a generic entry to a directory, or attach a subsidiary directory
    /// to a new parent.
    ///
    /// `Add` of a directory target writes its first cluster as an empty
    /// directory (`.`, `..`, clean tail). `Attach` only accepts directory
    /// targets and rewrites their `..` to point at `n_dir`.
    pub fn add_dir_entry(&mut self, n_dir: u32, name: &str, n_ent: u32, op: AddOp) -> Result<()> {
        let itotal = self.sb()?.itotal;
        if n_dir >= itotal || n_ent >= itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        check_name(name)?;
        if name == "." || name == ".." {
            return Err(SofsError::Invalid("reserved entry name"));
        }

        let mut dir_inode = self.read_inode(n_dir, InodeStatus::InUse)?;
        if dir_inode.kind() != Some(InodeKind::Directory) {
            return Err(SofsError::NotDirectory);
        }
        self.access_granted(n_dir, ACCESS_EXEC)?;
        self.require_write(n_dir)?;
        if dir_inode.size == MAX_FILE_SIZE {
            return Err(SofsError::FileTooBig);
        }

        let mut ent_inode = self.read_inode(n_ent, InodeStatus::InUse)?;
        if dir_inode.refcount == u16::MAX || ent_inode.refcount == u16::MAX {
            return Err(SofsError::TooManyLinks);
        }

        let idx = match self.search_dir_entry(n_dir, name)? {
            DirSearch::Found { .. } => return Err(SofsError::Exists),
            DirSearch::Missing { insert_idx } => insert_idx,
        };

        match op {
            AddOp::Add => {
                if ent_inode.kind() == Some(InodeKind::Directory) {
                    let first = DirCluster::first_cluster(n_ent, n_dir);
                    self.write_file_cluster(n_ent, 0, &first.serialize())?;
                    // The cluster allocation rewrote the child inode.
                    ent_inode = self.read_inode(n_ent, InodeStatus::InUse)?;
                    ent_inode.size = BSLPC;
                    ent_inode.refcount += 2;
                    dir_inode.refcount += 1;
                } else {
                    ent_inode.refcount += 1;
                }
            }
            AddOp::Attach => {
                if ent_inode.kind() != Some(InodeKind::Directory) {
                    return Err(SofsError::Inconsistent(Inconsistency::InodeInUse));
                }
                if ent_inode.size == 0 {
                    return Err(SofsError::Inconsistent(Inconsistency::DirContents));
                }
                let mut buf = [0_u8; CLUSTER_SIZE];
                self.read_file_cluster(n_ent, 0, &mut buf)?;
                let mut first =
                    DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;
                first.entries[1] = DirEntry::new("..", n_dir);
                self.write_file_cluster(n_ent, 0, &first.serialize())?;
                ent_inode = self.read_inode(n_ent, InodeStatus::InUse)?;
                ent_inode.refcount += 2;
                dir_inode.refcount += 1;
            }
        }

        // Bind the name in the parent.
        let clust_idx = idx / DPC;
        let within = (idx % DPC) as usize;
        let appended = idx * DIR_ENTRY_SIZE as u32 == dir_inode.size;
        let mut cluster = if appended {
            dir_inode.size += BSLPC;
            DirCluster::all_clean()
        } else {
            let mut buf = [0_u8; CLUSTER_SIZE];
            self.read_file_cluster(n_dir, clust_idx, &mut buf)?;
            DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?
        };
        cluster.entries[within] = DirEntry::new(name, n_ent);

        self.write_inode(n_ent, &ent_inode, InodeStatus::InUse)?;
        self.write_inode(n_dir, &dir_inode, InodeStatus::InUse)?;
        self.write_file_cluster(n_dir, clust_idx, &cluster.serialize())?;
        self.store_superblock()
    }

    /// Remove or detach the entry `name` from a directory.
    ///
    /// `Remove` leaves the slot dirty-empty; when the target's last hard
    /// link disappears its data clusters are released and the inode freed.
    /// `Detach` clears the slot entirely (and a directory target's `..`).
    pub fn remove_dir_entry(&mut self, n_dir: u32, name: &str, op: RemoveOp) -> Result<()> {
        check_name(name)?;
        if name == "." || name == ".." {
            return Err(SofsError::Invalid("reserved entry name"));
        }
        let itotal = self.sb()?.itotal;
        if n_dir >= itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        let mut dir_inode = self.read_inode(n_dir, InodeStatus::InUse)?;
        if dir_inode.kind() != Some(InodeKind::Directory) {
            return Err(SofsError::NotDirectory);
        }
        self.access_granted(n_dir, ACCESS_EXEC)?;
        self.require_write(n_dir)?;

        let (n_ent, idx) = match self.search_dir_entry(n_dir, name)? {
            DirSearch::Found { n_inode, idx } => (n_inode, idx),
            DirSearch::Missing { .. } => return Err(SofsError::NotFound),
        };
        let mut ent_inode = self.read_inode(n_ent, InodeStatus::InUse)?;
        let ent_is_dir = ent_inode.kind() == Some(InodeKind::Directory);
        if op == RemoveOp::Remove && ent_is_dir && !self.directory_is_empty(n_ent)? {
            return Err(SofsError::NotEmpty);
        }

        let clust_idx = idx / DPC;
        let within = (idx % DPC) as usize;
        let mut buf = [0_u8; CLUSTER_SIZE];
        self.read_file_cluster(n_dir, clust_idx, &mut buf)?;
        let mut cluster = DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;

        match op {
            RemoveOp::Remove => cluster.entries[within].mark_deleted(),
            RemoveOp::Detach => {
                cluster.entries[within].clear();
                if ent_is_dir {
                    let mut first_buf = [0_u8; CLUSTER_SIZE];
                    self.read_file_cluster(n_ent, 0, &mut first_buf)?;
                    let mut first = DirCluster::parse(&first_buf)
                        .map_err(|e| SofsError::Format(e.to_string()))?;
                    first.entries[1].clear();
                    self.write_file_cluster(n_ent, 0, &first.serialize())?;
                    ent_inode = self.read_inode(n_ent, InodeStatus::InUse)?;
                }
            }
        }

        ent_inode.refcount = ent_inode.refcount.saturating_sub(1);
        if ent_is_dir {
            dir_inode.refcount = dir_inode.refcount.saturating_sub(1);
        }
        if ent_is_dir && op == RemoveOp::Remove {
            // Account for the directory's own `.` entry.
            ent_inode.refcount = ent_inode.refcount.saturating_sub(1);
        }
        let delete = op == RemoveOp::Remove
            && (ent_inode.refcount == 0 || (ent_inode.refcount == 1 && ent_is_dir));
        if delete {
            ent_inode.refcount = 0;
        }

        self.write_inode(n_ent, &ent_inode, InodeStatus::InUse)?;
        self.write_inode(n_dir, &dir_inode, InodeStatus::InUse)?;
        self.write_file_cluster(n_dir, clust_idx, &cluster.serialize())?;

        if delete {
            self.handle_file_clusters(n_ent, 0, BulkOp::FreeClean)?;
            self.free_inode(n_ent)?;
        }
        self.store_superblock()
    }

    /// Rename the entry `old_name` to `new_name` within one directory.
    pub fn rename_dir_entry(&mut self, n_dir: u32, old_name: &str, new_name: &str) -> Result<()> {
        check_name(old_name)?;
        check_name(new_name)?;
        if old_name == "." || old_name == ".." {
            return Err(SofsError::Invalid("reserved entry name"));
        }
        let itotal = self.sb()?.itotal;
        if n_dir >= itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        let dir_inode = self.read_inode(n_dir, InodeStatus::InUse)?;
        if dir_inode.kind() != Some(InodeKind::Directory) {
            return Err(SofsError::NotDirectory);
        }
        self.access_granted(n_dir, ACCESS_EXEC)?;
        self.require_write(n_dir)?;

        let idx = match self.search_dir_entry(n_dir, old_name)? {
            DirSearch::Found { idx, .. } => idx,
            DirSearch::Missing { .. } => return Err(SofsError::NotFound),
        };
        if let DirSearch::Found { .. } = self.search_dir_entry(n_dir, new_name)? {
            return Err(SofsError::Exists);
        }

        let clust_idx = idx / DPC;
        let within = (idx % DPC) as usize;
        let mut buf = [0_u8; CLUSTER_SIZE];
        self.read_file_cluster(n_dir, clust_idx, &mut buf)?;
        let mut cluster = DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;
        cluster.entries[within].set_name(new_name);
        self.write_file_cluster(n_dir, clust_idx, &cluster.serialize())?;
        self.store_superblock()
    }

    /// Whether a directory holds nothing but its own `.` and `..`.
    pub(crate) fn directory_is_empty(&mut self, n_dir: u32) -> Result<bool> {
        let dir_inode = self.read_inode(n_dir, InodeStatus::InUse)?;
        check_dir_shape(&dir_inode)?;
        let n_clusters = dir_inode.size / BSLPC;
        let mut buf = [0_u8; CLUSTER_SIZE];
        for c in 0..n_clusters {
            self.read_file_cluster(n_dir, c, &mut buf)?;
            let cluster =
                DirCluster::parse(&buf).map_err(|e| SofsError::Format(e.to_string()))?;
            for (j, entry) in cluster.entries.iter().enumerate() {
                let idx = c * DPC + j as u32;
                if idx < 2 {
                    continue;
                }
                if entry.state() == DirEntryState::InUse {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Write permission, reported as `WriteDenied` when missing.
    fn require_write(&mut self, n_inode: u32) -> Result<()> {
        match self.access_granted(n_inode, ACCESS_WRITE) {
            Err(SofsError::AccessDenied) => Err(SofsError::WriteDenied),
            other => other,
        }
    }
}

/// A directory's byte size must be a whole, non-zero number of clusters.
fn check_dir_shape(dir_inode: &Inode) -> Result<()> {
    if dir_inode.size == 0 || dir_inode.size % BSLPC != 0 || dir_inode.size > MAX_FILE_SIZE {
        return Err(SofsError::Inconsistent(Inconsistency::DirContents));
    }
    Ok(())
}
