use sofs_error::{Inconsistency, SofsError};
use sofs_types::{
    BLOCK_SIZE, BLOCKS_PER_CLUSTER, DZONE_CACHE_SIZE, IPB, MAGIC_NUMBER, NULL_CLUSTER, NULL_INODE,
    ParseError, VERSION_NUMBER, VOLUME_NAME_SIZE, read_fixed, read_le_u32, trim_nul_padded,
};

/// Whether the file system was properly unmounted the last time it was
/// mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// Properly unmounted.
    Pru,
    /// Not properly unmounted.
    Npru,
}

impl MountStatus {
    fn parse(raw: u32) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Pru),
            1 => Ok(Self::Npru),
            _ => Err(ParseError::InvalidField {
                field: "mstat",
                reason: "not PRU or NPRU",
            }),
        }
    }

    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Pru => 0,
            Self::Npru => 1,
        }
    }
}

/// One of the two in-superblock caches of free data-cluster references.
///
/// For the retrieval cache `idx` points at the next slot to consume (empty at
/// `DZONE_CACHE_SIZE`); for the insertion cache it points one past the last
/// inserted slot (empty at 0). Unoccupied slots hold `NULL_CLUSTER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCache {
    pub idx: u32,
    pub cache: [u32; DZONE_CACHE_SIZE],
}

impl RefCache {
    /// An empty retrieval cache (consumption point past the end).
    #[must_use]
    pub fn empty_retrieval() -> Self {
        Self {
            idx: DZONE_CACHE_SIZE as u32,
            cache: [NULL_CLUSTER; DZONE_CACHE_SIZE],
        }
    }

    /// An empty insertion cache (insertion point at the start).
    #[must_use]
    pub fn empty_insertion() -> Self {
        Self {
            idx: 0,
            cache: [NULL_CLUSTER; DZONE_CACHE_SIZE],
        }
    }

    fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        let idx = read_le_u32(buf, offset)?;
        let mut cache = [0_u32; DZONE_CACHE_SIZE];
        for (slot, reference) in cache.iter_mut().enumerate() {
            *reference = read_le_u32(buf, offset + 4 + slot * 4)?;
        }
        Ok(Self { idx, cache })
    }

    fn serialize_into(&self, buf: &mut [u8], offset: usize) {
        put_u32(buf, offset, self.idx);
        for (slot, reference) in self.cache.iter().enumerate() {
            put_u32(buf, offset + 4 + slot * 4, *reference);
        }
    }

    /// References currently held by the retrieval cache.
    #[must_use]
    pub fn retrieval_entries(&self) -> &[u32] {
        &self.cache[(self.idx as usize).min(DZONE_CACHE_SIZE)..]
    }

    /// References currently held by the insertion cache.
    #[must_use]
    pub fn insertion_entries(&self) -> &[u32] {
        &self.cache[..(self.idx as usize).min(DZONE_CACHE_SIZE)]
    }
}

// Field offsets within block 0.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_NAME: usize = 8;
const OFF_NTOTAL: usize = 32;
const OFF_MSTAT: usize = 36;
const OFF_ITABLE_START: usize = 40;
const OFF_ITABLE_SIZE: usize = 44;
const OFF_ITOTAL: usize = 48;
const OFF_IFREE: usize = 52;
const OFF_IHEAD: usize = 56;
const OFF_ITAIL: usize = 60;
const OFF_CIUTABLE_START: usize = 64;
const OFF_CIUTABLE_SIZE: usize = 68;
const OFF_DZONE_RETRIEV: usize = 72;
const OFF_DZONE_INSERT: usize = 276;
const OFF_FCTABLE_START: usize = 480;
const OFF_FCTABLE_SIZE: usize = 484;
const OFF_FCTABLE_POS: usize = 488;
const OFF_DZONE_START: usize = 492;
const OFF_DZONE_TOTAL: usize = 496;
const OFF_DZONE_FREE: usize = 500;
const OFF_RESERVED: usize = 504;

/// Fill byte for the reserved tail, as written by the formatter.
const RESERVED_FILL: u8 = 0xEE;

/// The superblock: global file-system metadata, stored in block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    // ── Header ───────────────────────────────────────────────────────────
    pub magic: u32,
    pub version: u32,
    pub name: [u8; VOLUME_NAME_SIZE],
    pub ntotal: u32,
    pub mstat: MountStatus,

    // ── Inode table metadata ─────────────────────────────────────────────
    pub itable_start: u32,
    pub itable_size: u32,
    pub itotal: u32,
    pub ifree: u32,
    pub ihead: u32,
    pub itail: u32,

    // ── Cluster-to-inode mapping table metadata ──────────────────────────
    pub ciutable_start: u32,
    pub ciutable_size: u32,

    // ── Data zone metadata ───────────────────────────────────────────────
    pub dzone_retriev: RefCache,
    pub dzone_insert: RefCache,
    pub fctable_start: u32,
    pub fctable_size: u32,
    pub fctable_pos: u32,
    pub dzone_start: u32,
    pub dzone_total: u32,
    pub dzone_free: u32,
}

impl Superblock {
    /// Parse block 0. Magic and version are validated here; everything else
    /// is left to [`Superblock::quick_check`].
    pub fn parse(buf: &[u8; BLOCK_SIZE]) -> Result<Self, ParseError> {
        let magic = read_le_u32(buf, OFF_MAGIC)?;
        if magic != MAGIC_NUMBER {
            return Err(ParseError::InvalidMagic {
                expected: MAGIC_NUMBER,
                actual: magic,
            });
        }
        let version = read_le_u32(buf, OFF_VERSION)?;
        if version != VERSION_NUMBER {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported version",
            });
        }

        Ok(Self {
            magic,
            version,
            name: read_fixed::<VOLUME_NAME_SIZE>(buf, OFF_NAME)?,
            ntotal: read_le_u32(buf, OFF_NTOTAL)?,
            mstat: MountStatus::parse(read_le_u32(buf, OFF_MSTAT)?)?,
            itable_start: read_le_u32(buf, OFF_ITABLE_START)?,
            itable_size: read_le_u32(buf, OFF_ITABLE_SIZE)?,
            itotal: read_le_u32(buf, OFF_ITOTAL)?,
            ifree: read_le_u32(buf, OFF_IFREE)?,
            ihead: read_le_u32(buf, OFF_IHEAD)?,
            itail: read_le_u32(buf, OFF_ITAIL)?,
            ciutable_start: read_le_u32(buf, OFF_CIUTABLE_START)?,
            ciutable_size: read_le_u32(buf, OFF_CIUTABLE_SIZE)?,
            dzone_retriev: RefCache::parse(buf, OFF_DZONE_RETRIEV)?,
            dzone_insert: RefCache::parse(buf, OFF_DZONE_INSERT)?,
            fctable_start: read_le_u32(buf, OFF_FCTABLE_START)?,
            fctable_size: read_le_u32(buf, OFF_FCTABLE_SIZE)?,
            fctable_pos: read_le_u32(buf, OFF_FCTABLE_POS)?,
            dzone_start: read_le_u32(buf, OFF_DZONE_START)?,
            dzone_total: read_le_u32(buf, OFF_DZONE_TOTAL)?,
            dzone_free: read_le_u32(buf, OFF_DZONE_FREE)?,
        })
    }

    /// Serialize into a block-0 image. The reserved tail is written with the
    /// formatter's fill pattern.
    #[must_use]
    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0_u8; BLOCK_SIZE];
        put_u32(&mut buf, OFF_MAGIC, self.magic);
        put_u32(&mut buf, OFF_VERSION, self.version);
        buf[OFF_NAME..OFF_NAME + VOLUME_NAME_SIZE].copy_from_slice(&self.name);
        put_u32(&mut buf, OFF_NTOTAL, self.ntotal);
        put_u32(&mut buf, OFF_MSTAT, self.mstat.as_u32());
        put_u32(&mut buf, OFF_ITABLE_START, self.itable_start);
        put_u32(&mut buf, OFF_ITABLE_SIZE, self.itable_size);
        put_u32(&mut buf, OFF_ITOTAL, self.itotal);
        put_u32(&mut buf, OFF_IFREE, self.ifree);
        put_u32(&mut buf, OFF_IHEAD, self.ihead);
        put_u32(&mut buf, OFF_ITAIL, self.itail);
        put_u32(&mut buf, OFF_CIUTABLE_START, self.ciutable_start);
        put_u32(&mut buf, OFF_CIUTABLE_SIZE, self.ciutable_size);
        self.dzone_retriev.serialize_into(&mut buf, OFF_DZONE_RETRIEV);
        self.dzone_insert.serialize_into(&mut buf, OFF_DZONE_INSERT);
        put_u32(&mut buf, OFF_FCTABLE_START, self.fctable_start);
        put_u32(&mut buf, OFF_FCTABLE_SIZE, self.fctable_size);
        put_u32(&mut buf, OFF_FCTABLE_POS, self.fctable_pos);
        put_u32(&mut buf, OFF_DZONE_START, self.dzone_start);
        put_u32(&mut buf, OFF_DZONE_TOTAL, self.dzone_total);
        put_u32(&mut buf, OFF_DZONE_FREE, self.dzone_free);
        for byte in &mut buf[OFF_RESERVED..] {
            *byte = RESERVED_FILL;
        }
        buf
    }

    /// Volume name as a string.
    #[must_use]
    pub fn volume_name(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// Set the volume name; at most `VOLUME_NAME_SIZE - 1` bytes.
    pub fn set_volume_name(&mut self, name: &str) -> Result<(), SofsError> {
        let bytes = name.as_bytes();
        if bytes.len() >= VOLUME_NAME_SIZE {
            return Err(SofsError::NameTooLong);
        }
        self.name = [0_u8; VOLUME_NAME_SIZE];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Quick structural check over the superblock metadata.
    ///
    /// Covers the header, the inode-table metadata, the data-zone metadata
    /// and the two free-cluster caches; cross-structure accounting lives in
    /// the full consistency checks of the core crate.
    pub fn quick_check(&self) -> Result<(), SofsError> {
        let broken = Err(SofsError::Inconsistent(Inconsistency::Superblock));
        if self.magic != MAGIC_NUMBER || self.version != VERSION_NUMBER {
            return broken;
        }
        if self.itable_start != 1
            || self.ciutable_start != self.itable_start + self.itable_size
            || self.fctable_start != self.ciutable_start + self.ciutable_size
            || self.dzone_start != self.fctable_start + self.fctable_size
        {
            return broken;
        }
        if self.itotal != self.itable_size * IPB || self.ifree > self.itotal {
            return broken;
        }
        let list_empty = self.ifree == 0;
        let ends_null = self.ihead == NULL_INODE && self.itail == NULL_INODE;
        if list_empty != ends_null {
            return broken;
        }
        if !list_empty && (self.ihead >= self.itotal || self.itail >= self.itotal) {
            return broken;
        }

        let broken_dz = Err(SofsError::Inconsistent(Inconsistency::DataZone));
        let meta_blocks = 1 + self.itable_size + self.ciutable_size + self.fctable_size;
        if self.ntotal < meta_blocks
            || self.dzone_total > (self.ntotal - meta_blocks) / BLOCKS_PER_CLUSTER
        {
            return broken_dz;
        }
        if self.dzone_free > self.dzone_total || self.fctable_pos >= self.dzone_total.max(1) {
            return broken_dz;
        }

        self.check_cache(&self.dzone_retriev, true)?;
        self.check_cache(&self.dzone_insert, false)?;
        Ok(())
    }

    fn check_cache(&self, cache: &RefCache, retrieval: bool) -> Result<(), SofsError> {
        let bad = Err(SofsError::Inconsistent(Inconsistency::ClusterCaches));
        if cache.idx > DZONE_CACHE_SIZE as u32 {
            return bad;
        }
        let occupied: &[u32] = if retrieval {
            cache.retrieval_entries()
        } else {
            cache.insertion_entries()
        };
        for reference in occupied {
            if *reference == NULL_CLUSTER || *reference >= self.dzone_total {
                return bad;
            }
        }
        Ok(())
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
