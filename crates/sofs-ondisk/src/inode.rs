use sofs_error::{Inconsistency, SofsError};
use sofs_types::{
    BLOCK_SIZE, INODE_DIR, INODE_FILE, INODE_FREE, INODE_PERM_MASK, INODE_SIZE, INODE_SYMLINK,
    INODE_TYPE_MASK, IPB, MAX_FILE_CLUSTERS, MAX_FILE_SIZE, N_DIRECT, NULL_CLUSTER, ParseError,
    read_le_u16, read_le_u32,
};

use crate::Superblock;

/// Legal file types an in-use inode can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
}

impl InodeKind {
    /// The mode bit representing this type.
    #[must_use]
    pub fn mode_bit(self) -> u16 {
        match self {
            Self::File => INODE_FILE,
            Self::Directory => INODE_DIR,
            Self::Symlink => INODE_SYMLINK,
        }
    }

    fn from_mode(mode: u16) -> Option<Self> {
        match mode & INODE_TYPE_MASK {
            INODE_FILE => Some(Self::File),
            INODE_DIR => Some(Self::Directory),
            INODE_SYMLINK => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// The two dual-meaning 32-bit words of an inode.
///
/// On disk the same storage holds the access/modification times while the
/// inode is in use and the free-list links once it has been freed; the
/// serializer dispatches on the free bit of `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeVariant {
    Times { atime: u32, mtime: u32 },
    FreeLink { prev: u32, next: u32 },
}

/// One entry of the inode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub mode: u16,
    pub refcount: u16,
    pub owner: u32,
    pub group: u32,
    pub size: u32,
    /// Total clusters attached to this file, indirection clusters included.
    pub clucount: u32,
    pub var: InodeVariant,
    pub direct: [u32; N_DIRECT],
    pub i1: u32,
    pub i2: u32,
}

impl Inode {
    /// A free inode in the clean state, linked between `prev` and `next`.
    #[must_use]
    pub fn free_clean(prev: u32, next: u32) -> Self {
        Self {
            mode: INODE_FREE,
            refcount: 0,
            owner: 0,
            group: 0,
            size: 0,
            clucount: 0,
            var: InodeVariant::FreeLink { prev, next },
            direct: [NULL_CLUSTER; N_DIRECT],
            i1: NULL_CLUSTER,
            i2: NULL_CLUSTER,
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let mode = read_le_u16(raw, 0x00)?;
        let vd1 = read_le_u32(raw, 0x14)?;
        let vd2 = read_le_u32(raw, 0x18)?;
        let var = if mode & INODE_FREE != 0 {
            InodeVariant::FreeLink {
                prev: vd1,
                next: vd2,
            }
        } else {
            InodeVariant::Times {
                atime: vd1,
                mtime: vd2,
            }
        };

        let mut direct = [0_u32; N_DIRECT];
        for (i, reference) in direct.iter_mut().enumerate() {
            *reference = read_le_u32(raw, 0x1C + i * 4)?;
        }

        Ok(Self {
            mode,
            refcount: read_le_u16(raw, 0x02)?,
            owner: read_le_u32(raw, 0x04)?,
            group: read_le_u32(raw, 0x08)?,
            size: read_le_u32(raw, 0x0C)?,
            clucount: read_le_u32(raw, 0x10)?,
            var,
            direct,
            i1: read_le_u32(raw, 0x38)?,
            i2: read_le_u32(raw, 0x3C)?,
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0_u8; INODE_SIZE];
        buf[0x00..0x02].copy_from_slice(&self.mode.to_le_bytes());
        buf[0x02..0x04].copy_from_slice(&self.refcount.to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&self.owner.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.group.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.size.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.clucount.to_le_bytes());
        let (vd1, vd2) = match self.var {
            InodeVariant::Times { atime, mtime } => (atime, mtime),
            InodeVariant::FreeLink { prev, next } => (prev, next),
        };
        buf[0x14..0x18].copy_from_slice(&vd1.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&vd2.to_le_bytes());
        for (i, reference) in self.direct.iter().enumerate() {
            buf[0x1C + i * 4..0x20 + i * 4].copy_from_slice(&reference.to_le_bytes());
        }
        buf[0x38..0x3C].copy_from_slice(&self.i1.to_le_bytes());
        buf[0x3C..0x40].copy_from_slice(&self.i2.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode & INODE_FREE != 0
    }

    /// The file type, when exactly one type bit is set.
    #[must_use]
    pub fn kind(&self) -> Option<InodeKind> {
        InodeKind::from_mode(self.mode)
    }

    /// The nine rwx permission bits.
    #[must_use]
    pub fn perms(&self) -> u16 {
        self.mode & INODE_PERM_MASK
    }

    /// Free-list links; an in-use inode has none.
    pub fn free_link(&self) -> Result<(u32, u32), SofsError> {
        match self.var {
            InodeVariant::FreeLink { prev, next } => Ok((prev, next)),
            InodeVariant::Times { .. } => {
                Err(SofsError::Inconsistent(Inconsistency::FreeDirtyInode))
            }
        }
    }

    /// Access/modification times; a free inode has none.
    pub fn times(&self) -> Result<(u32, u32), SofsError> {
        match self.var {
            InodeVariant::Times { atime, mtime } => Ok((atime, mtime)),
            InodeVariant::FreeLink { .. } => {
                Err(SofsError::Inconsistent(Inconsistency::InodeInUse))
            }
        }
    }

    /// Quick check for an inode expected to be in use.
    pub fn check_in_use(&self, sb: &Superblock) -> Result<(), SofsError> {
        let bad = Err(SofsError::Inconsistent(Inconsistency::InodeInUse));
        if self.is_free() || self.kind().is_none() {
            return bad;
        }
        if self.size > MAX_FILE_SIZE || self.clucount > MAX_FILE_CLUSTERS {
            return bad;
        }
        self.check_ref_list(sb)
    }

    /// Quick check for an inode expected to be free in the dirty state.
    pub fn check_free_dirty(&self, sb: &Superblock) -> Result<(), SofsError> {
        if !self.is_free() {
            return Err(SofsError::Inconsistent(Inconsistency::FreeDirtyInode));
        }
        self.check_ref_list(sb)
    }

    /// Every reference in the direct list and the indirection roots is either
    /// null or a valid data-cluster number.
    fn check_ref_list(&self, sb: &Superblock) -> Result<(), SofsError> {
        let in_range = |reference: u32| reference == NULL_CLUSTER || reference < sb.dzone_total;
        if self.direct.iter().all(|r| in_range(*r)) && in_range(self.i1) && in_range(self.i2) {
            Ok(())
        } else {
            Err(SofsError::Inconsistent(Inconsistency::InodeRefList))
        }
    }
}

/// One block of the inode table: `IPB` inodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeBlock {
    pub inodes: Vec<Inode>,
}

impl InodeBlock {
    pub fn parse(buf: &[u8; BLOCK_SIZE]) -> Result<Self, ParseError> {
        let mut inodes = Vec::with_capacity(IPB as usize);
        for i in 0..IPB as usize {
            inodes.push(Inode::parse(&buf[i * INODE_SIZE..(i + 1) * INODE_SIZE])?);
        }
        Ok(Self { inodes })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0_u8; BLOCK_SIZE];
        for (i, inode) in self.inodes.iter().enumerate() {
            buf[i * INODE_SIZE..(i + 1) * INODE_SIZE].copy_from_slice(&inode.serialize());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MountStatus, RefCache};
    use sofs_types::{MAGIC_NUMBER, NULL_INODE, VERSION_NUMBER, VOLUME_NAME_SIZE};

    fn sb() -> Superblock {
        Superblock {
            magic: MAGIC_NUMBER,
            version: VERSION_NUMBER,
            name: [0; VOLUME_NAME_SIZE],
            ntotal: 100,
            mstat: MountStatus::Pru,
            itable_start: 1,
            itable_size: 7,
            itotal: 56,
            ifree: 55,
            ihead: 1,
            itail: 55,
            ciutable_start: 8,
            ciutable_size: 1,
            dzone_retriev: RefCache::empty_retrieval(),
            dzone_insert: RefCache::empty_insertion(),
            fctable_start: 9,
            fctable_size: 1,
            fctable_pos: 1,
            dzone_start: 10,
            dzone_total: 22,
            dzone_free: 21,
        }
    }

    #[test]
    fn in_use_round_trip_keeps_times() {
        let inode = Inode {
            mode: INODE_FILE | 0o644,
            refcount: 1,
            owner: 1000,
            group: 1000,
            size: 4096,
            clucount: 2,
            var: InodeVariant::Times {
                atime: 1_380_000_000,
                mtime: 1_380_000_001,
            },
            direct: [0, 3, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER],
            i1: NULL_CLUSTER,
            i2: NULL_CLUSTER,
        };
        let parsed = Inode::parse(&inode.serialize()).unwrap();
        assert_eq!(parsed, inode);
        assert_eq!(parsed.kind(), Some(InodeKind::File));
        assert_eq!(parsed.times().unwrap(), (1_380_000_000, 1_380_000_001));
        assert!(parsed.free_link().is_err());
    }

    #[test]
    fn free_round_trip_keeps_links() {
        let inode = Inode::free_clean(3, 5);
        let parsed = Inode::parse(&inode.serialize()).unwrap();
        assert_eq!(parsed, inode);
        assert!(parsed.is_free());
        assert_eq!(parsed.free_link().unwrap(), (3, 5));
        assert!(parsed.times().is_err());
    }

    #[test]
    fn variant_dispatches_on_free_bit() {
        // Same raw words, different free bit: the variant flips meaning.
        let mut in_use = Inode {
            mode: INODE_SYMLINK | 0o777,
            refcount: 1,
            owner: 0,
            group: 0,
            size: 10,
            clucount: 1,
            var: InodeVariant::Times {
                atime: 7,
                mtime: 9,
            },
            direct: [NULL_CLUSTER; N_DIRECT],
            i1: NULL_CLUSTER,
            i2: NULL_CLUSTER,
        };
        let raw = in_use.serialize();
        in_use.mode |= INODE_FREE;
        let mut raw_free = raw;
        raw_free[0x00..0x02].copy_from_slice(&in_use.mode.to_le_bytes());
        let parsed = Inode::parse(&raw_free).unwrap();
        assert_eq!(parsed.free_link().unwrap(), (7, 9));
    }

    #[test]
    fn quick_checks() {
        let sb = sb();
        let good = Inode {
            mode: INODE_DIR | 0o755,
            refcount: 2,
            owner: 0,
            group: 0,
            size: 2048,
            clucount: 1,
            var: InodeVariant::Times { atime: 0, mtime: 0 },
            direct: [0, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER],
            i1: NULL_CLUSTER,
            i2: NULL_CLUSTER,
        };
        assert!(good.check_in_use(&sb).is_ok());

        let mut two_types = good.clone();
        two_types.mode |= INODE_FILE;
        assert_eq!(
            two_types.check_in_use(&sb),
            Err(SofsError::Inconsistent(Inconsistency::InodeInUse))
        );

        let mut bad_ref = good.clone();
        bad_ref.direct[3] = sb.dzone_total; // one past the last cluster
        assert_eq!(
            bad_ref.check_in_use(&sb),
            Err(SofsError::Inconsistent(Inconsistency::InodeRefList))
        );

        let free = Inode::free_clean(NULL_INODE, NULL_INODE);
        assert!(free.check_free_dirty(&sb).is_ok());
        assert!(free.check_in_use(&sb).is_err());
        assert!(good.check_free_dirty(&sb).is_err());
    }

    #[test]
    fn inode_block_round_trip() {
        let mut block = InodeBlock {
            inodes: (0..IPB).map(|i| Inode::free_clean(i, i + 2)).collect(),
        };
        block.inodes[0].mode |= INODE_FILE;
        let parsed = InodeBlock::parse(&block.serialize()).unwrap();
        assert_eq!(parsed, block);
    }
}
