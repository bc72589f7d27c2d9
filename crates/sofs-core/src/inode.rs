//! Inode operations: read/write with state checking, allocation, freeing,
//! cleaning, and the permission check.

use crate::volume::{Volume, unix_now};
use sofs_block::ByteDevice;
use sofs_error::{Inconsistency, Result, SofsError};
use sofs_ondisk::{Inode, InodeKind, InodeVariant};
use sofs_types::{N_DIRECT, NULL_CLUSTER, NULL_INODE, inode_locus};
use tracing::trace;

/// Expected state of an inode being read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeStatus {
    /// In use, describing one of the legal file types.
    InUse,
    /// Free in the dirty state.
    FreeDirty,
}

/// Read permission request bit.
pub const ACCESS_READ: u8 = 0x4;
/// Write permission request bit.
pub const ACCESS_WRITE: u8 = 0x2;
/// Execute permission request bit.
pub const ACCESS_EXEC: u8 = 0x1;

impl<D: ByteDevice> Volume<D> {
    /// Read an inode from the table, verifying it is in the expected state.
    ///
    /// Reading an in-use inode touches its access time on disk.
    pub fn read_inode(&mut self, n_inode: u32, status: InodeStatus) -> Result<Inode> {
        let itotal = self.sb()?.itotal;
        let (n_blk, off) =
            inode_locus(n_inode, itotal).ok_or(SofsError::Invalid("inode number out of range"))?;
        self.load_itable_block(n_blk)?;

        let sb = self.sb()?.clone();
        let block = self.itable_block()?;
        let inode = &mut block.inodes[off as usize];
        match status {
            InodeStatus::InUse => inode.check_in_use(&sb)?,
            InodeStatus::FreeDirty => inode.check_free_dirty(&sb)?,
        }

        if status == InodeStatus::InUse {
            if let InodeVariant::Times { mtime, .. } = inode.var {
                inode.var = InodeVariant::Times {
                    atime: unix_now(),
                    mtime,
                };
            }
        }
        let copy = inode.clone();
        if status == InodeStatus::InUse {
            self.store_itable_block()?;
        }
        Ok(copy)
    }

    /// Write an inode into the table, verifying the given contents are in the
    /// expected state. Writing an in-use inode touches its access and
    /// modification times.
    pub fn write_inode(&mut self, n_inode: u32, inode: &Inode, status: InodeStatus) -> Result<()> {
        let sb = self.sb()?.clone();
        let (n_blk, off) = inode_locus(n_inode, sb.itotal)
            .ok_or(SofsError::Invalid("inode number out of range"))?;
        match status {
            InodeStatus::InUse => inode.check_in_use(&sb)?,
            InodeStatus::FreeDirty => inode.check_free_dirty(&sb)?,
        }

        self.load_itable_block(n_blk)?;
        let block = self.itable_block()?;
        let slot = &mut block.inodes[off as usize];
        *slot = inode.clone();
        if status == InodeStatus::InUse {
            let now = unix_now();
            slot.var = InodeVariant::Times {
                atime: now,
                mtime: now,
            };
        }
        self.store_itable_block()
    }

    /// Read an inode verbatim, with no state check and no time touch.
    pub(crate) fn get_inode_raw(&mut self, n_inode: u32) -> Result<Inode> {
        let itotal = self.sb()?.itotal;
        let (n_blk, off) =
            inode_locus(n_inode, itotal).ok_or(SofsError::Invalid("inode number out of range"))?;
        self.load_itable_block(n_blk)?;
        Ok(self.itable_block()?.inodes[off as usize].clone())
    }

    /// Write an inode verbatim, with no state check and no time touch.
    pub(crate) fn put_inode_raw(&mut self, n_inode: u32, inode: &Inode) -> Result<()> {
        let itotal = self.sb()?.itotal;
        let (n_blk, off) =
            inode_locus(n_inode, itotal).ok_or(SofsError::Invalid("inode number out of range"))?;
        self.load_itable_block(n_blk)?;
        self.itable_block()?.inodes[off as usize] = inode.clone();
        self.store_itable_block()
    }

    /// Allocate a free inode of the given type.
    ///
    /// The inode is taken from the head of the free list; a head still
    /// carrying data-cluster references from its previous life is cleaned
    /// first. The new inode gets the caller's credentials, current times,
    /// and fully null reference lists.
    pub fn alloc_inode(&mut self, kind: InodeKind) -> Result<u32> {
        let (itotal, ifree, ihead) = {
            let sb = self.sb()?;
            (sb.itotal, sb.ifree, sb.ihead)
        };
        if ifree == 0 {
            return Err(SofsError::NoSpace);
        }
        self.sb()?.quick_check()?;

        let n_inode = ihead;
        let (n_blk, off) = inode_locus(n_inode, itotal)
            .ok_or(SofsError::Inconsistent(Inconsistency::FreeInodeList))?;
        self.load_itable_block(n_blk)?;

        let (next, dirty) = {
            let head = &self.itable_block()?.inodes[off as usize];
            if !head.is_free() {
                return Err(SofsError::Inconsistent(Inconsistency::FreeInodeList));
            }
            let (_, next) = head.free_link()?;
            let dirty = head.clucount != 0
                || head.i1 != NULL_CLUSTER
                || head.i2 != NULL_CLUSTER
                || head.direct.iter().any(|r| *r != NULL_CLUSTER);
            (next, dirty)
        };

        if dirty {
            self.clean_inode(n_inode)?;
            self.load_itable_block(n_blk)?;
        }

        let now = unix_now();
        let creds = self.credentials();
        {
            let inode = &mut self.itable_block()?.inodes[off as usize];
            inode.mode = kind.mode_bit();
            inode.refcount = 0;
            inode.owner = creds.uid;
            inode.group = creds.gid;
            inode.size = 0;
            inode.clucount = 0;
            inode.var = InodeVariant::Times {
                atime: now,
                mtime: now,
            };
            inode.direct = [NULL_CLUSTER; N_DIRECT];
            inode.i1 = NULL_CLUSTER;
            inode.i2 = NULL_CLUSTER;
        }
        self.store_itable_block()?;

        if ifree == 1 {
            let sb = self.sb()?;
            sb.ihead = NULL_INODE;
            sb.itail = NULL_INODE;
        } else {
            let (nb, noff) = inode_locus(next, itotal)
                .ok_or(SofsError::Inconsistent(Inconsistency::FreeInodeList))?;
            self.load_itable_block(nb)?;
            {
                let new_head = &mut self.itable_block()?.inodes[noff as usize];
                let (_, follow) = new_head.free_link()?;
                new_head.var = InodeVariant::FreeLink {
                    prev: NULL_INODE,
                    next: follow,
                };
            }
            self.store_itable_block()?;
            self.sb()?.ihead = next;
        }

        self.sb()?.ifree -= 1;
        self.store_superblock()?;
        trace!(target: "sofs::alloc", event = "alloc_inode", n_inode, kind = ?kind);
        Ok(n_inode)
    }

    /// Free an in-use inode with no remaining directory entries.
    ///
    /// The inode is appended to the tail of the free list in the dirty
    /// state: its data clusters are retained until a later clean. Inode 0
    /// (the root directory) can never be freed.
    pub fn free_inode(&mut self, n_inode: u32) -> Result<()> {
        if n_inode == 0 {
            return Err(SofsError::Invalid("the root inode cannot be freed"));
        }
        let sb = self.sb()?.clone();
        let (n_blk, off) = inode_locus(n_inode, sb.itotal)
            .ok_or(SofsError::Invalid("inode number out of range"))?;

        self.load_itable_block(n_blk)?;
        {
            let inode = &mut self.itable_block()?.inodes[off as usize];
            inode.check_in_use(&sb)?;
            if inode.refcount != 0 {
                return Err(SofsError::Inconsistent(Inconsistency::InodeInUse));
            }
            inode.mode |= sofs_types::INODE_FREE;
            inode.owner = 0;
            inode.group = 0;
            inode.var = InodeVariant::FreeLink {
                prev: if sb.ifree == 0 { NULL_INODE } else { sb.itail },
                next: NULL_INODE,
            };
        }
        self.store_itable_block()?;

        if sb.ifree == 0 {
            let sbm = self.sb()?;
            sbm.ihead = n_inode;
            sbm.itail = n_inode;
        } else {
            let (tb, toff) = inode_locus(sb.itail, sb.itotal)
                .ok_or(SofsError::Inconsistent(Inconsistency::FreeInodeList))?;
            self.load_itable_block(tb)?;
            {
                let tail = &mut self.itable_block()?.inodes[toff as usize];
                let (prev, _) = tail.free_link()?;
                tail.var = InodeVariant::FreeLink {
                    prev,
                    next: n_inode,
                };
            }
            self.store_itable_block()?;
            self.sb()?.itail = n_inode;
        }

        self.sb()?.ifree += 1;
        self.store_superblock()?;
        trace!(target: "sofs::alloc", event = "free_inode", n_inode);
        Ok(())
    }

    /// Clean a free-dirty inode: dissociate every data cluster still attached
    /// to it. Afterwards the reference lists are fully null.
    pub fn clean_inode(&mut self, n_inode: u32) -> Result<()> {
        if n_inode == 0 {
            return Err(SofsError::Invalid("the root inode cannot be cleaned"));
        }
        let sb = self.sb()?.clone();
        if n_inode >= sb.itotal {
            return Err(SofsError::Invalid("inode number out of range"));
        }
        let inode = self.get_inode_raw(n_inode)?;
        inode.check_free_dirty(&sb)?;

        self.handle_file_clusters(n_inode, 0, crate::cluster::BulkOp::Clean)?;
        self.store_superblock()
    }

    /// Check the inode's permissions against the requested operation mask
    /// (a non-empty combination of `ACCESS_READ`/`ACCESS_WRITE`/`ACCESS_EXEC`).
    ///
    /// Root is granted reading and writing unconditionally, and execution
    /// whenever any of the three x bits is set.
    pub fn access_granted(&mut self, n_inode: u32, op_mask: u8) -> Result<()> {
        if op_mask == 0 || op_mask & !(ACCESS_READ | ACCESS_WRITE | ACCESS_EXEC) != 0 {
            return Err(SofsError::Invalid("empty or malformed access mask"));
        }
        let inode = self.read_inode(n_inode, InodeStatus::InUse)?;
        let perms = inode.perms();
        let creds = self.credentials();

        if creds.uid == 0 {
            if op_mask & ACCESS_EXEC != 0 && perms & 0o111 == 0 {
                return Err(SofsError::AccessDenied);
            }
            return Ok(());
        }

        let class = if creds.uid == inode.owner {
            (perms >> 6) & 0o7
        } else if creds.gid == inode.group {
            (perms >> 3) & 0o7
        } else {
            perms & 0o7
        };
        if class & u16::from(op_mask) == u16::from(op_mask) {
            Ok(())
        } else {
            Err(SofsError::AccessDenied)
        }
    }
}
