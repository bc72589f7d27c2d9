//! The open-volume context and its object cache.
//!
//! The six single-instance storage areas of the object layer (superblock,
//! inode-table block, cluster-to-inode map block, bitmap block, and the two
//! reference-cluster areas) live here as cache slots owned by [`Volume`].
//! Each slot is load-on-demand and write-back on explicit store; the first
//! I/O error a slot sees sticks until the volume is reopened.

use sofs_block::{BlockIo, ByteDevice, FileByteDevice};
use sofs_error::{Inconsistency, Result, SofsError};
use sofs_ondisk::{InodeBlock, RefBlock, RefCluster, Superblock};
use sofs_types::{BLOCK_SIZE, BLOCKS_PER_CLUSTER, BlockNumber};
use std::path::Path;

/// Credentials of the process driving the volume.
///
/// Supplied by the caller (the mount glue knows the per-request uid/gid);
/// tooling that formats or checks images runs as root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    #[must_use]
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// One object-cache slot.
///
/// `load` is a no-op when the requested instance is already resident; an I/O
/// failure moves the slot to `Sticky` and every later operation replays the
/// retained error until the volume is reopened. `store` with nothing loaded
/// is a protocol violation and also sticks.
#[derive(Debug)]
enum Slot<T> {
    Empty,
    Loaded { id: u32, data: T },
    Sticky(SofsError),
}

impl<T> Slot<T> {
    fn load(&mut self, id: u32, read: impl FnOnce() -> Result<T>) -> Result<()> {
        match self {
            Self::Sticky(err) => Err(err.clone()),
            Self::Loaded { id: resident, .. } if *resident == id => Ok(()),
            _ => match read() {
                Ok(data) => {
                    *self = Self::Loaded { id, data };
                    Ok(())
                }
                Err(err) => {
                    *self = Self::Sticky(err.clone());
                    Err(err)
                }
            },
        }
    }

    /// Install an instance without reading it from disk (fresh allocations
    /// whose on-disk bytes are stale).
    fn install(&mut self, id: u32, data: T) -> Result<()> {
        match self {
            Self::Sticky(err) => Err(err.clone()),
            _ => {
                *self = Self::Loaded { id, data };
                Ok(())
            }
        }
    }

    fn get(&mut self) -> Result<&mut T> {
        match self {
            Self::Loaded { data, .. } => Ok(data),
            Self::Sticky(err) => Err(err.clone()),
            Self::Empty => Err(SofsError::Inconsistent(Inconsistency::ObjectCache)),
        }
    }

    fn store(&mut self, write: impl FnOnce(u32, &T) -> Result<()>) -> Result<()> {
        match self {
            Self::Sticky(err) => Err(err.clone()),
            Self::Empty => {
                let err = SofsError::Inconsistent(Inconsistency::ObjectCache);
                *self = Self::Sticky(err.clone());
                Err(err)
            }
            Self::Loaded { id, data } => match write(*id, data) {
                Ok(()) => Ok(()),
                Err(err) => {
                    *self = Self::Sticky(err.clone());
                    Err(err)
                }
            },
        }
    }
}

/// An open SOFS13 volume.
///
/// Owns the block/cluster I/O channel and the object-cache slots. All object
/// layer operations are methods on this type and take `&mut self`: the file
/// system is single-threaded by design and the exclusive borrow makes that a
/// type-level constraint.
#[derive(Debug)]
pub struct Volume<D = FileByteDevice> {
    pub(crate) io: BlockIo<D>,
    creds: Credentials,
    sb: Slot<Superblock>,
    itable: Slot<InodeBlock>,
    cmap: Slot<RefBlock>,
    bmap: Slot<[u8; BLOCK_SIZE]>,
    sind: Slot<RefCluster>,
    dref: Slot<RefCluster>,
}

impl Volume<FileByteDevice> {
    /// Open the backing file at `path`.
    pub fn open_path(path: impl AsRef<Path>, creds: Credentials) -> Result<Self> {
        Self::open(FileByteDevice::open(path)?, creds)
    }
}

impl<D: ByteDevice> Volume<D> {
    /// Open a volume over an arbitrary byte device.
    ///
    /// Loads the superblock and runs its quick check; a device that does not
    /// carry a structurally sound SOFS13 image is rejected here.
    pub fn open(dev: D, creds: Credentials) -> Result<Self> {
        let mut volume = Self::from_io(BlockIo::new(dev)?, creds);
        volume.load_superblock()?;
        let sb = volume.sb.get()?;
        sb.quick_check()?;
        if sb.ntotal > volume.io.block_count() {
            return Err(SofsError::Inconsistent(Inconsistency::Superblock));
        }
        Ok(volume)
    }

    pub(crate) fn from_io(io: BlockIo<D>, creds: Credentials) -> Self {
        Self {
            io,
            creds,
            sb: Slot::Empty,
            itable: Slot::Empty,
            cmap: Slot::Empty,
            bmap: Slot::Empty,
            sind: Slot::Empty,
            dref: Slot::Empty,
        }
    }

    /// Flush the superblock and synchronize the backing device.
    pub fn close(mut self) -> Result<()> {
        if matches!(self.sb, Slot::Loaded { .. }) {
            self.store_superblock()?;
        }
        self.io.sync()
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    pub fn set_credentials(&mut self, creds: Credentials) {
        self.creds = creds;
    }

    // ── Superblock slot ──────────────────────────────────────────────────

    pub(crate) fn load_superblock(&mut self) -> Result<()> {
        let io = &self.io;
        self.sb.load(0, || {
            let raw = io.read_block(BlockNumber(0))?;
            Superblock::parse(&raw).map_err(|e| SofsError::Format(e.to_string()))
        })
    }

    /// The superblock, loading it on demand.
    pub fn superblock(&mut self) -> Result<&Superblock> {
        self.load_superblock()?;
        self.sb.get().map(|sb| &*sb)
    }

    pub(crate) fn sb(&mut self) -> Result<&mut Superblock> {
        self.load_superblock()?;
        self.sb.get()
    }

    pub(crate) fn store_superblock(&mut self) -> Result<()> {
        let io = &self.io;
        self.sb
            .store(|_, sb| io.write_block(BlockNumber(0), &sb.serialize()))
    }

    // ── Inode-table slot ─────────────────────────────────────────────────

    pub(crate) fn load_itable_block(&mut self, n_blk: u32) -> Result<()> {
        let (start, size) = {
            let sb = self.sb()?;
            (sb.itable_start, sb.itable_size)
        };
        if n_blk >= size {
            return Err(SofsError::Invalid("inode table block out of range"));
        }
        let io = &self.io;
        self.itable.load(n_blk, || {
            let raw = io.read_block(BlockNumber(start + n_blk))?;
            InodeBlock::parse(&raw).map_err(|e| SofsError::Format(e.to_string()))
        })
    }

    pub(crate) fn itable_block(&mut self) -> Result<&mut InodeBlock> {
        self.itable.get()
    }

    pub(crate) fn store_itable_block(&mut self) -> Result<()> {
        let start = self.sb()?.itable_start;
        let io = &self.io;
        self.itable
            .store(|n_blk, block| io.write_block(BlockNumber(start + n_blk), &block.serialize()))
    }

    // ── Cluster-to-inode map slot ────────────────────────────────────────

    pub(crate) fn load_map_block(&mut self, n_blk: u32) -> Result<()> {
        let (start, size) = {
            let sb = self.sb()?;
            (sb.ciutable_start, sb.ciutable_size)
        };
        if n_blk >= size {
            return Err(SofsError::Invalid("cluster-to-inode map block out of range"));
        }
        let io = &self.io;
        self.cmap.load(n_blk, || {
            let raw = io.read_block(BlockNumber(start + n_blk))?;
            RefBlock::parse(&raw).map_err(|e| SofsError::Format(e.to_string()))
        })
    }

    pub(crate) fn map_block(&mut self) -> Result<&mut RefBlock> {
        self.cmap.get()
    }

    pub(crate) fn store_map_block(&mut self) -> Result<()> {
        let start = self.sb()?.ciutable_start;
        let io = &self.io;
        self.cmap
            .store(|n_blk, block| io.write_block(BlockNumber(start + n_blk), &block.serialize()))
    }

    // ── Bitmap slot ──────────────────────────────────────────────────────

    pub(crate) fn load_bitmap_block(&mut self, n_blk: u32) -> Result<()> {
        let (start, size) = {
            let sb = self.sb()?;
            (sb.fctable_start, sb.fctable_size)
        };
        if n_blk >= size {
            return Err(SofsError::Invalid("bitmap block out of range"));
        }
        let io = &self.io;
        self.bmap
            .load(n_blk, || io.read_block(BlockNumber(start + n_blk)))
    }

    pub(crate) fn bitmap_block(&mut self) -> Result<&mut [u8; BLOCK_SIZE]> {
        self.bmap.get()
    }

    pub(crate) fn store_bitmap_block(&mut self) -> Result<()> {
        let start = self.sb()?.fctable_start;
        let io = &self.io;
        self.bmap
            .store(|n_blk, block| io.write_block(BlockNumber(start + n_blk), block))
    }

    // ── Reference-cluster slots ──────────────────────────────────────────

    /// Validate that `phys` is the first block of a data cluster.
    fn check_cluster_block(&mut self, phys: BlockNumber) -> Result<()> {
        let sb = self.sb()?;
        let in_zone = phys.0 >= sb.dzone_start
            && phys.0 < sb.dzone_start + sb.dzone_total * BLOCKS_PER_CLUSTER;
        if !in_zone || (phys.0 - sb.dzone_start) % BLOCKS_PER_CLUSTER != 0 {
            return Err(SofsError::Invalid("physical cluster number out of range"));
        }
        Ok(())
    }

    pub(crate) fn load_sind_cluster(&mut self, phys: BlockNumber) -> Result<()> {
        self.check_cluster_block(phys)?;
        let io = &self.io;
        self.sind.load(phys.0, || {
            let raw = io.read_cluster(phys)?;
            RefCluster::parse(&raw).map_err(|e| SofsError::Format(e.to_string()))
        })
    }

    pub(crate) fn sind_cluster(&mut self) -> Result<&mut RefCluster> {
        self.sind.get()
    }

    pub(crate) fn store_sind_cluster(&mut self) -> Result<()> {
        let io = &self.io;
        self.sind
            .store(|phys, cluster| io.write_cluster(BlockNumber(phys), &cluster.serialize()))
    }

    pub(crate) fn install_sind_cluster(&mut self, phys: BlockNumber, data: RefCluster) -> Result<()> {
        self.check_cluster_block(phys)?;
        self.sind.install(phys.0, data)
    }

    pub(crate) fn load_dref_cluster(&mut self, phys: BlockNumber) -> Result<()> {
        self.check_cluster_block(phys)?;
        let io = &self.io;
        self.dref.load(phys.0, || {
            let raw = io.read_cluster(phys)?;
            RefCluster::parse(&raw).map_err(|e| SofsError::Format(e.to_string()))
        })
    }

    pub(crate) fn dref_cluster(&mut self) -> Result<&mut RefCluster> {
        self.dref.get()
    }

    pub(crate) fn store_dref_cluster(&mut self) -> Result<()> {
        let io = &self.io;
        self.dref
            .store(|phys, cluster| io.write_cluster(BlockNumber(phys), &cluster.serialize()))
    }

    pub(crate) fn install_dref_cluster(&mut self, phys: BlockNumber, data: RefCluster) -> Result<()> {
        self.check_cluster_block(phys)?;
        self.dref.install(phys.0, data)
    }
}

/// Seconds since the epoch, truncated to the on-disk 32-bit field.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn unix_now() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_contract() {
        let mut slot: Slot<u32> = Slot::Empty;

        // Store before load is a protocol violation and sticks.
        let err = slot.store(|_, _| Ok(())).unwrap_err();
        assert_eq!(err, SofsError::Inconsistent(Inconsistency::ObjectCache));
        assert_eq!(slot.get().unwrap_err(), err);

        // A fresh slot loads once and then hits.
        let mut slot: Slot<u32> = Slot::Empty;
        let mut reads = 0;
        slot.load(7, || {
            reads += 1;
            Ok(41)
        })
        .unwrap();
        slot.load(7, || {
            reads += 1;
            Ok(99)
        })
        .unwrap();
        assert_eq!(reads, 1);
        assert_eq!(*slot.get().unwrap(), 41);

        // Loading a different id replaces the resident instance.
        slot.load(8, || Ok(42)).unwrap();
        assert_eq!(*slot.get().unwrap(), 42);
    }

    #[test]
    fn slot_sticky_error_replays() {
        let mut slot: Slot<u32> = Slot::Empty;
        let boom = SofsError::Io(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(slot.load(1, || Err(boom.clone())).unwrap_err(), boom);
        // The failure is retained: even a load that would succeed now fails.
        assert_eq!(slot.load(1, || Ok(5)).unwrap_err(), boom);
        assert_eq!(slot.get().unwrap_err(), boom);
        assert_eq!(slot.store(|_, _| Ok(())).unwrap_err(), boom);
    }
}
