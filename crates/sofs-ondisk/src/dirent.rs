use sofs_types::{
    CLUSTER_SIZE, DIR_ENTRY_SIZE, DPC, MAX_NAME, NULL_INODE, ParseError, read_le_u32,
};

/// State of a directory-entry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryState {
    /// Holds a live name → inode binding.
    InUse,
    /// Removed but recoverable: the first and last name bytes were swapped
    /// and the inode reference is still in place.
    DirtyEmpty,
    /// Fully cleared.
    CleanEmpty,
}

/// One directory entry: a NUL-terminated name field and an inode number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; MAX_NAME + 1],
    pub n_inode: u32,
}

impl DirEntry {
    /// A clean-empty entry.
    #[must_use]
    pub fn clean() -> Self {
        Self {
            name: [0_u8; MAX_NAME + 1],
            n_inode: NULL_INODE,
        }
    }

    /// An in-use entry. The caller must have validated the name length.
    #[must_use]
    pub fn new(name: &str, n_inode: u32) -> Self {
        let mut entry = Self::clean();
        entry.set_name(name);
        entry.n_inode = n_inode;
        entry
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() < DIR_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DIR_ENTRY_SIZE,
                offset: 0,
                actual: raw.len(),
            });
        }
        let mut name = [0_u8; MAX_NAME + 1];
        name.copy_from_slice(&raw[..MAX_NAME + 1]);
        Ok(Self {
            name,
            n_inode: read_le_u32(raw, MAX_NAME + 1)?,
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0_u8; DIR_ENTRY_SIZE];
        buf[..MAX_NAME + 1].copy_from_slice(&self.name);
        buf[MAX_NAME + 1..].copy_from_slice(&self.n_inode.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn state(&self) -> DirEntryState {
        if self.name[0] != 0 {
            DirEntryState::InUse
        } else if self.name.iter().all(|b| *b == 0) && self.n_inode == NULL_INODE {
            DirEntryState::CleanEmpty
        } else {
            DirEntryState::DirtyEmpty
        }
    }

    /// The name as a string, up to the first NUL.
    #[must_use]
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Overwrite the name field: NUL padding, then the new name.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0_u8; MAX_NAME + 1];
        let bytes = name.as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    /// Move the entry to the dirty-empty state: swap the first and last name
    /// bytes (the last is NUL for any in-use entry), keeping the inode
    /// reference for forensic recovery.
    pub fn mark_deleted(&mut self) {
        self.name.swap(0, MAX_NAME);
    }

    /// Move the entry to the clean-empty state.
    pub fn clear(&mut self) {
        *self = Self::clean();
    }
}

/// The directory entries stored in one data cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirCluster {
    pub entries: Vec<DirEntry>,
}

impl DirCluster {
    /// A cluster of clean-empty entries.
    #[must_use]
    pub fn all_clean() -> Self {
        Self {
            entries: (0..DPC).map(|_| DirEntry::clean()).collect(),
        }
    }

    /// A root-style first cluster: `.` and `..` bound to the given inodes,
    /// the rest clean-empty.
    #[must_use]
    pub fn first_cluster(n_self: u32, n_parent: u32) -> Self {
        let mut cluster = Self::all_clean();
        cluster.entries[0] = DirEntry::new(".", n_self);
        cluster.entries[1] = DirEntry::new("..", n_parent);
        cluster
    }

    pub fn parse(buf: &[u8; CLUSTER_SIZE]) -> Result<Self, ParseError> {
        let mut entries = Vec::with_capacity(DPC as usize);
        for i in 0..DPC as usize {
            entries.push(DirEntry::parse(
                &buf[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE],
            )?);
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; CLUSTER_SIZE] {
        let mut buf = [0_u8; CLUSTER_SIZE];
        for (i, entry) in self.entries.iter().enumerate() {
            buf[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&entry.serialize());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_states() {
        let clean = DirEntry::clean();
        assert_eq!(clean.state(), DirEntryState::CleanEmpty);

        let mut entry = DirEntry::new("report.txt", 12);
        assert_eq!(entry.state(), DirEntryState::InUse);
        assert_eq!(entry.name_str(), "report.txt");

        entry.mark_deleted();
        assert_eq!(entry.state(), DirEntryState::DirtyEmpty);
        assert_eq!(entry.n_inode, 12);
        assert_eq!(entry.name[MAX_NAME], b'r');
        assert_eq!(entry.name[0], 0);

        entry.clear();
        assert_eq!(entry.state(), DirEntryState::CleanEmpty);
    }

    #[test]
    fn one_char_deleted_name_is_not_clean() {
        let mut entry = DirEntry::new("x", 3);
        entry.mark_deleted();
        // name[0] and name[1] are both zero, yet the entry is recoverable.
        assert_eq!(entry.state(), DirEntryState::DirtyEmpty);
    }

    #[test]
    fn entry_round_trip() {
        let entry = DirEntry::new("a-rather-long-but-legal-name", 0xDEAD);
        let parsed = DirEntry::parse(&entry.serialize()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn first_cluster_shape() {
        let cluster = DirCluster::first_cluster(4, 0);
        assert_eq!(cluster.entries[0].name_str(), ".");
        assert_eq!(cluster.entries[0].n_inode, 4);
        assert_eq!(cluster.entries[1].name_str(), "..");
        assert_eq!(cluster.entries[1].n_inode, 0);
        assert!(cluster.entries[2..]
            .iter()
            .all(|e| e.state() == DirEntryState::CleanEmpty));

        let parsed = DirCluster::parse(&cluster.serialize()).unwrap();
        assert_eq!(parsed, cluster);
    }
}
