//! Volume formatter.
//!
//! Lays an empty SOFS13 file system over a backing device: superblock,
//! inode table with its free chain, cluster-to-inode map, root directory,
//! free-cluster bitmap, and (optionally) zero-filled data clusters. The
//! formatted image must pass the full consistency check before the formatter
//! returns.

use crate::volume::{Credentials, Volume, unix_now};
use sofs_block::{BlockIo, ByteDevice};
use sofs_error::{Result, SofsError};
use sofs_ondisk::{
    DirCluster, Inode, InodeBlock, InodeVariant, MountStatus, RefBlock, RefCache, Superblock,
};
use sofs_types::{
    BITS_PER_BLOCK, BLOCKS_PER_CLUSTER, BLOCK_SIZE, BSLPC, BlockNumber, CLUSTER_SIZE, INODE_DIR,
    IPB, MAGIC_NUMBER, MAP_TAIL_FILL, N_DIRECT, NULL_CLUSTER, NULL_INODE, RPB, VERSION_NUMBER,
    VOLUME_NAME_SIZE, bitmap_locus, bitmap_mask, cluster_to_block,
};
use tracing::debug;

/// Formatter options.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume name, at most 23 characters.
    pub name: String,
    /// Requested inode count, rounded up to whole table blocks; defaults to
    /// one inode per eight device blocks.
    pub inodes: Option<u32>,
    /// Zero-fill every free data cluster.
    pub zero: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            name: "SOFS13".to_owned(),
            inodes: None,
            zero: false,
        }
    }
}

/// The computed on-disk layout for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub ntotal: u32,
    pub itotal: u32,
    pub itable_size: u32,
    pub ciutable_size: u32,
    pub fctable_size: u32,
    pub dzone_total: u32,
}

/// Solve the layout equation for a device of `ntotal` blocks.
///
/// The bitmap and map sizes depend on the cluster count, which depends on
/// them in turn, so the solution is iterated the way the layout was
/// conceived: a first bound from the raw space, a refinement, and a final
/// opportunistic extra cluster when the leftover blocks allow one. The
/// requested inode count is honored exactly (rounded up to a whole table
/// block); leftover blocks past the data zone stay unused.
pub fn compute_geometry(ntotal: u32, requested_inodes: Option<u32>) -> Result<Geometry> {
    let too_small = SofsError::Invalid("device too small for a file system");

    let requested = requested_inodes.unwrap_or(ntotal / 8).max(1);
    let itable_size = requested.div_ceil(IPB);
    let itotal = itable_size
        .checked_mul(IPB)
        .ok_or_else(|| too_small.clone())?;

    let head = 1 + itable_size;
    let spare = ntotal.checked_sub(head).ok_or_else(|| too_small.clone())?;
    let bound = spare / BLOCKS_PER_CLUSTER;
    let mut fctable_size = bound.div_ceil(BITS_PER_BLOCK);
    let mut ciutable_size = bound.div_ceil(RPB);

    let avail = ntotal
        .checked_sub(head + fctable_size + ciutable_size)
        .ok_or_else(|| too_small.clone())?;
    let mut dzone_total = avail / BLOCKS_PER_CLUSTER;
    fctable_size = dzone_total.div_ceil(BITS_PER_BLOCK);
    ciutable_size = dzone_total.div_ceil(RPB);

    let used = head + fctable_size + ciutable_size + dzone_total * BLOCKS_PER_CLUSTER;
    if dzone_total % BITS_PER_BLOCK != 0
        && dzone_total % RPB != 0
        && ntotal.saturating_sub(used) >= BLOCKS_PER_CLUSTER
    {
        dzone_total += 1;
    }

    if dzone_total < 2 || fctable_size == 0 || ciutable_size == 0 {
        return Err(too_small);
    }
    let used = head + fctable_size + ciutable_size + dzone_total * BLOCKS_PER_CLUSTER;
    if used > ntotal {
        return Err(too_small);
    }

    Ok(Geometry {
        ntotal,
        itotal,
        itable_size,
        ciutable_size,
        fctable_size,
        dzone_total,
    })
}

/// Format the device and return the freshly opened volume.
pub fn format<D: ByteDevice>(dev: D, opts: &FormatOptions) -> Result<Volume<D>> {
    let io = BlockIo::new(dev)?;
    let geo = compute_geometry(io.block_count(), opts.inodes)?;
    debug!(target: "sofs::mkfs", ?geo, "formatting");

    let mut sb = Superblock {
        magic: MAGIC_NUMBER,
        version: VERSION_NUMBER,
        name: [0_u8; VOLUME_NAME_SIZE],
        ntotal: geo.ntotal,
        mstat: MountStatus::Pru,
        itable_start: 1,
        itable_size: geo.itable_size,
        itotal: geo.itotal,
        ifree: geo.itotal - 1,
        ihead: 1,
        itail: geo.itotal - 1,
        ciutable_start: 1 + geo.itable_size,
        ciutable_size: geo.ciutable_size,
        dzone_retriev: RefCache::empty_retrieval(),
        dzone_insert: RefCache::empty_insertion(),
        fctable_start: 1 + geo.itable_size + geo.ciutable_size,
        fctable_size: geo.fctable_size,
        fctable_pos: 1,
        dzone_start: 1 + geo.itable_size + geo.ciutable_size + geo.fctable_size,
        dzone_total: geo.dzone_total,
        dzone_free: geo.dzone_total - 1,
    };
    sb.set_volume_name(&opts.name)?;

    fill_inode_table(&io, &sb)?;
    fill_map_table(&io, &sb)?;
    fill_root_dir(&io, &sb)?;
    fill_bitmap(&io, &sb)?;
    if opts.zero {
        zero_data_zone(&io, &sb)?;
    }
    // The superblock goes last: a torn format leaves no valid magic behind.
    io.write_block(BlockNumber(0), &sb.serialize())?;
    io.sync()?;

    let mut volume = Volume::from_io(io, Credentials::root());
    let findings = volume.check()?;
    if let Some(first) = findings.first() {
        return Err(SofsError::Inconsistent(first.kind));
    }
    Ok(volume)
}

/// Only inode 0 is in use (the root directory); every other inode is free in
/// the clean state, chained `1 → 2 → … → itotal-1`.
fn fill_inode_table<D: ByteDevice>(io: &BlockIo<D>, sb: &Superblock) -> Result<()> {
    let now = unix_now();
    for blk in 0..sb.itable_size {
        let mut inodes = Vec::with_capacity(IPB as usize);
        for i in 0..IPB {
            let node = blk * IPB + i;
            if node == 0 {
                inodes.push(root_inode(now));
            } else {
                let prev = if node == 1 { NULL_INODE } else { node - 1 };
                let next = if node == sb.itotal - 1 {
                    NULL_INODE
                } else {
                    node + 1
                };
                inodes.push(Inode::free_clean(prev, next));
            }
        }
        let block = InodeBlock { inodes };
        io.write_block(BlockNumber(sb.itable_start + blk), &block.serialize())?;
    }
    Ok(())
}

fn root_inode(now: u32) -> Inode {
    let mut root = Inode {
        mode: INODE_DIR | 0o777,
        refcount: 2,
        owner: 0,
        group: 0,
        size: BSLPC,
        clucount: 1,
        var: InodeVariant::Times {
            atime: now,
            mtime: now,
        },
        direct: [NULL_CLUSTER; N_DIRECT],
        i1: NULL_CLUSTER,
        i2: NULL_CLUSTER,
    };
    root.direct[0] = 0;
    root
}

/// Cluster 0 belongs to the root; every other in-range slot is null, and
/// slots past `dzone_total` in the last block carry the tail fill.
fn fill_map_table<D: ByteDevice>(io: &BlockIo<D>, sb: &Superblock) -> Result<()> {
    for blk in 0..sb.ciutable_size {
        let mut refs = [NULL_INODE; RPB as usize];
        for (slot, reference) in refs.iter_mut().enumerate() {
            let n_clust = blk * RPB + slot as u32;
            *reference = if n_clust == 0 {
                0
            } else if n_clust < sb.dzone_total {
                NULL_INODE
            } else {
                MAP_TAIL_FILL
            };
        }
        let block = RefBlock { refs };
        io.write_block(BlockNumber(sb.ciutable_start + blk), &block.serialize())?;
    }
    Ok(())
}

fn fill_root_dir<D: ByteDevice>(io: &BlockIo<D>, sb: &Superblock) -> Result<()> {
    let root = DirCluster::first_cluster(0, 0);
    io.write_cluster(BlockNumber(sb.dzone_start), &root.serialize())
}

/// Bit 0 is allocated (the root directory cluster); bits for every other
/// data cluster are set free; bits past `dzone_total` stay zero.
fn fill_bitmap<D: ByteDevice>(io: &BlockIo<D>, sb: &Superblock) -> Result<()> {
    let mut blocks = vec![[0_u8; BLOCK_SIZE]; sb.fctable_size as usize];
    for n_clust in 1..sb.dzone_total {
        let (n_blk, byte, bit) = bitmap_locus(n_clust, sb.dzone_total)
            .ok_or(SofsError::Invalid("bitmap reference out of range"))?;
        blocks[n_blk as usize][byte as usize] |= bitmap_mask(bit);
    }
    for (blk, block) in blocks.iter().enumerate() {
        io.write_block(BlockNumber(sb.fctable_start + blk as u32), block)?;
    }
    Ok(())
}

fn zero_data_zone<D: ByteDevice>(io: &BlockIo<D>, sb: &Superblock) -> Result<()> {
    let zeroes = [0_u8; CLUSTER_SIZE];
    for n_clust in 1..sb.dzone_total {
        io.write_cluster(cluster_to_block(sb.dzone_start, n_clust), &zeroes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_small_volume() {
        // 100 blocks, 56 inodes: 7 inode blocks, one map block, one bitmap
        // block, 22 data clusters, 2 slack blocks.
        let geo = compute_geometry(100, Some(56)).unwrap();
        assert_eq!(
            geo,
            Geometry {
                ntotal: 100,
                itotal: 56,
                itable_size: 7,
                ciutable_size: 1,
                fctable_size: 1,
                dzone_total: 22,
            }
        );
    }

    #[test]
    fn geometry_tiny_volume() {
        let geo = compute_geometry(20, Some(8)).unwrap();
        assert_eq!(geo.itable_size, 1);
        assert_eq!(geo.dzone_total, 4);
        // Exact fit: 1 + 1 + 1 + 1 + 16 = 20.
    }

    #[test]
    fn geometry_medium_volume_needs_two_map_blocks() {
        let geo = compute_geometry(1000, Some(40)).unwrap();
        assert_eq!(geo.itable_size, 5);
        assert_eq!(geo.ciutable_size, 2);
        assert_eq!(geo.fctable_size, 1);
        assert_eq!(geo.dzone_total, 247);
    }

    #[test]
    fn geometry_rounds_inodes_to_whole_blocks() {
        let geo = compute_geometry(1000, Some(9)).unwrap();
        assert_eq!(geo.itotal, 16);
        assert_eq!(geo.itable_size, 2);
    }

    #[test]
    fn geometry_rejects_tiny_devices() {
        assert!(compute_geometry(4, None).is_err());
        assert!(compute_geometry(8, Some(64)).is_err());
    }
}
