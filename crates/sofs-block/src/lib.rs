#![forbid(unsafe_code)]
//! Block and cluster I/O over the backing file.
//!
//! Provides the `ByteDevice` trait with pread/pwrite semantics, a file-backed
//! implementation, a RAM-backed one for tests and tooling, and `BlockIo`,
//! which exposes the byte-exact `read_block` / `write_block` / `read_cluster`
//! / `write_cluster` surface the object layer consumes.

use sofs_error::{Result, SofsError};
use sofs_types::{BLOCK_SIZE, BLOCKS_PER_CLUSTER, BlockNumber, CLUSTER_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;
use tracing::trace;

/// One physical block worth of bytes.
pub type Block = [u8; BLOCK_SIZE];

/// One data cluster worth of bytes.
pub type Cluster = [u8; CLUSTER_SIZE];

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Opens read-write when possible and falls back to read-only; writes on a
/// read-only device fail with `WriteDenied`.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SofsError::WriteDenied);
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed byte device for tests and tooling.
#[derive(Debug)]
pub struct MemByteDevice {
    data: Mutex<Vec<u8>>,
    len: u64,
}

impl MemByteDevice {
    /// Create a zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
            len: len as u64,
        }
    }

    /// Snapshot the full device contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().expect("device poisoned").clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let data = self.data.lock().expect("device poisoned");
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let mut data = self.data.lock().expect("device poisoned");
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| SofsError::Format("I/O range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(SofsError::Format(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── Block/cluster I/O ───────────────────────────────────────────────────────

/// Block- and cluster-addressed view of a byte device.
///
/// A cluster is `BLOCKS_PER_CLUSTER` contiguous blocks addressed by the
/// physical number of its first block.
#[derive(Debug)]
pub struct BlockIo<D> {
    dev: D,
    block_count: u32,
}

impl<D: ByteDevice> BlockIo<D> {
    /// Wrap a byte device whose length is a whole number of blocks.
    pub fn new(dev: D) -> Result<Self> {
        let len = dev.len_bytes();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(SofsError::Format(format!(
                "device length is not block-aligned: len_bytes={len} block_size={BLOCK_SIZE}"
            )));
        }
        let blocks = len / BLOCK_SIZE as u64;
        let block_count = u32::try_from(blocks)
            .map_err(|_| SofsError::Format(format!("device too large: {blocks} blocks")))?;
        Ok(Self { dev, block_count })
    }

    /// Total number of blocks on the device.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn read_block(&self, n_block: BlockNumber) -> Result<Block> {
        self.check_block(n_block, 1)?;
        trace!(target: "sofs::block", event = "read_block", block = n_block.0);
        let mut buf = [0_u8; BLOCK_SIZE];
        self.dev.read_exact_at(n_block.byte_offset(), &mut buf)?;
        Ok(buf)
    }

    pub fn write_block(&self, n_block: BlockNumber, data: &Block) -> Result<()> {
        self.check_block(n_block, 1)?;
        trace!(target: "sofs::block", event = "write_block", block = n_block.0);
        self.dev.write_all_at(n_block.byte_offset(), data)
    }

    /// Read the cluster whose first physical block is `n_block`.
    pub fn read_cluster(&self, n_block: BlockNumber) -> Result<Cluster> {
        self.check_block(n_block, BLOCKS_PER_CLUSTER)?;
        trace!(target: "sofs::block", event = "read_cluster", block = n_block.0);
        let mut buf = [0_u8; CLUSTER_SIZE];
        self.dev.read_exact_at(n_block.byte_offset(), &mut buf)?;
        Ok(buf)
    }

    /// Write the cluster whose first physical block is `n_block`.
    pub fn write_cluster(&self, n_block: BlockNumber, data: &Cluster) -> Result<()> {
        self.check_block(n_block, BLOCKS_PER_CLUSTER)?;
        trace!(target: "sofs::block", event = "write_cluster", block = n_block.0);
        self.dev.write_all_at(n_block.byte_offset(), data)
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    fn check_block(&self, n_block: BlockNumber, span: u32) -> Result<()> {
        let end = n_block.checked_add(span);
        match end {
            Some(end) if end.0 <= self.block_count => Ok(()),
            _ => Err(SofsError::Invalid("physical block number out of range")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mem_io(blocks: u32) -> BlockIo<MemByteDevice> {
        BlockIo::new(MemByteDevice::new(blocks as usize * BLOCK_SIZE)).unwrap()
    }

    #[test]
    fn block_round_trip() {
        let io = mem_io(8);
        let mut block = [0_u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;
        io.write_block(BlockNumber(3), &block).unwrap();
        assert_eq!(io.read_block(BlockNumber(3)).unwrap(), block);
        // Neighbours untouched.
        assert_eq!(io.read_block(BlockNumber(2)).unwrap(), [0_u8; BLOCK_SIZE]);
        assert_eq!(io.read_block(BlockNumber(4)).unwrap(), [0_u8; BLOCK_SIZE]);
    }

    #[test]
    fn cluster_spans_four_blocks() {
        let io = mem_io(8);
        let mut cluster = [0_u8; CLUSTER_SIZE];
        for (i, byte) in cluster.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        io.write_cluster(BlockNumber(4), &cluster).unwrap();
        assert_eq!(io.read_cluster(BlockNumber(4)).unwrap(), cluster);

        // The cluster's third block is readable on its own.
        let block = io.read_block(BlockNumber(6)).unwrap();
        assert_eq!(block[..], cluster[2 * BLOCK_SIZE..3 * BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let io = mem_io(8);
        assert!(matches!(
            io.read_block(BlockNumber(8)),
            Err(SofsError::Invalid(_))
        ));
        // A cluster starting on the last block would run off the end.
        assert!(matches!(
            io.read_cluster(BlockNumber(5)),
            Err(SofsError::Invalid(_))
        ));
        assert!(io.read_cluster(BlockNumber(4)).is_ok());
    }

    #[test]
    fn misaligned_device_is_rejected() {
        let dev = MemByteDevice::new(BLOCK_SIZE + 7);
        assert!(matches!(BlockIo::new(dev), Err(SofsError::Format(_))));
    }

    #[test]
    fn file_device_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; 16 * BLOCK_SIZE]).unwrap();
        tmp.flush().unwrap();

        let io = BlockIo::new(FileByteDevice::open(tmp.path()).unwrap()).unwrap();
        assert_eq!(io.block_count(), 16);

        let mut block = [0_u8; BLOCK_SIZE];
        block[17] = 0x5A;
        io.write_block(BlockNumber(9), &block).unwrap();
        io.sync().unwrap();

        let reopened = BlockIo::new(FileByteDevice::open(tmp.path()).unwrap()).unwrap();
        assert_eq!(reopened.read_block(BlockNumber(9)).unwrap(), block);
    }
}
