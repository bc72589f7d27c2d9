#![allow(dead_code)]

use sofs_block::FileByteDevice;
use sofs_core::{Credentials, FormatOptions, InodeKind, InodeStatus, Volume};
use sofs_types::BLOCK_SIZE;
use tempfile::NamedTempFile;

/// Format a fresh backing file of `blocks` blocks with `inodes` inodes and
/// return the open volume (root credentials). The temp file must outlive the
/// volume.
pub fn format_volume(blocks: u32, inodes: u32) -> (Volume<FileByteDevice>, NamedTempFile) {
    let tmp = NamedTempFile::new().expect("create backing file");
    tmp.as_file()
        .set_len(u64::from(blocks) * BLOCK_SIZE as u64)
        .expect("size backing file");
    let dev = FileByteDevice::open(tmp.path()).expect("open backing file");
    let opts = FormatOptions {
        inodes: Some(inodes),
        ..FormatOptions::default()
    };
    let volume = sofs_core::format(dev, &opts).expect("format volume");
    (volume, tmp)
}

/// Reopen the volume over an existing backing file.
pub fn reopen(tmp: &NamedTempFile) -> Volume<FileByteDevice> {
    Volume::open_path(tmp.path(), Credentials::root()).expect("reopen volume")
}

/// Allocate an inode and give it the usual rwx permissions. A freshly
/// allocated inode carries no permission bits at all, so nothing — not even
/// directory traversal — would be allowed on it otherwise.
pub fn make_inode(volume: &mut Volume<FileByteDevice>, kind: InodeKind, perms: u16) -> u32 {
    let n_inode = volume.alloc_inode(kind).expect("alloc inode");
    let mut inode = volume
        .read_inode(n_inode, InodeStatus::InUse)
        .expect("read fresh inode");
    inode.mode |= perms;
    volume
        .write_inode(n_inode, &inode, InodeStatus::InUse)
        .expect("write inode mode");
    n_inode
}

/// `make_inode` with 0o755, the common case for test trees.
pub fn make_node(volume: &mut Volume<FileByteDevice>, kind: InodeKind) -> u32 {
    make_inode(volume, kind, 0o755)
}

/// Expect the volume to pass the full consistency check.
pub fn assert_clean(volume: &mut Volume<FileByteDevice>) {
    let findings = volume.check().expect("consistency check ran");
    assert!(
        findings.is_empty(),
        "expected a consistent volume, found: {findings:?}"
    );
}
