//! End-to-end scenarios over freshly formatted volumes.

mod common;

use common::{assert_clean, format_volume, make_node};
use sofs_core::{
    ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE, AddOp, Credentials, DirCluster, DirEntryState,
    InodeKind, InodeStatus, InodeVariant, RemoveOp, SofsError,
};
use sofs_types::{
    BSLPC, CLUSTER_SIZE, DZONE_CACHE_SIZE, INODE_DIR, NULL_CLUSTER, NULL_INODE,
};

/// S1: an empty 100-block, 56-inode volume.
#[test]
fn s1_empty_volume() {
    let (mut volume, _tmp) = format_volume(100, 56);

    let root = volume.read_inode(0, InodeStatus::InUse).unwrap();
    assert_eq!(root.mode & INODE_DIR, INODE_DIR);
    assert_eq!(root.perms(), 0o777);
    assert_eq!(root.refcount, 2);
    assert_eq!(root.size, CLUSTER_SIZE as u32);
    assert_eq!(root.clucount, 1);
    assert_eq!(root.direct[0], 0);
    assert!(root.direct[1..].iter().all(|r| *r == NULL_CLUSTER));
    assert_eq!(root.i1, NULL_CLUSTER);
    assert_eq!(root.i2, NULL_CLUSTER);
    assert!(matches!(root.var, InodeVariant::Times { .. }));

    let sb = volume.superblock().unwrap();
    assert_eq!(sb.itotal, 56);
    assert_eq!(sb.ifree, 55);
    assert_eq!(sb.ihead, 1);
    assert_eq!(sb.itail, 55);
    assert_eq!(sb.dzone_total, 22);
    assert_eq!(sb.dzone_free, sb.dzone_total - 1);

    assert_clean(&mut volume);
}

/// S2: allocate every data cluster, free them in reverse, do it again to
/// push references through both caches, and verify the final accounting.
#[test]
fn s2_cluster_alloc_free_round_trip() {
    let (mut volume, _tmp) = format_volume(20, 8);
    let total = volume.superblock().unwrap().dzone_total;
    assert_eq!(total, 4);

    for _round in 0..2 {
        let mut allocated = Vec::new();
        loop {
            match volume.alloc_data_cluster() {
                Ok(n_clust) => allocated.push(n_clust),
                Err(SofsError::NoSpace) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(allocated.len() as u32, total - 1);
        for n_clust in allocated.iter().rev() {
            volume.free_data_cluster(*n_clust).unwrap();
        }
    }

    let sb = volume.superblock().unwrap();
    assert_eq!(sb.dzone_free, total - 1);
    // The retrieval cache drained completely.
    assert_eq!(sb.dzone_retriev.idx, DZONE_CACHE_SIZE as u32);
    // Every freed reference is findable again: between them, the insertion
    // cache and the bitmap hold all clusters but cluster 0.
    assert_clean(&mut volume);

    // Cluster 0 stays pinned to the root.
    assert!(matches!(
        volume.free_data_cluster(0),
        Err(SofsError::Invalid(_))
    ));
}

/// S3: growing a file through the direct, single-indirect and
/// double-indirect ranges.
#[test]
fn s3_indirect_growth() {
    let (mut volume, _tmp) = format_volume(1000, 40);
    let n_file = make_node(&mut volume, InodeKind::File);

    let payload = [0x5A_u8; CLUSTER_SIZE];
    let n_direct = sofs_types::N_DIRECT as u32;
    let rpc = sofs_types::RPC;
    volume.write_file_cluster(n_file, 0, &payload).unwrap();
    volume.write_file_cluster(n_file, n_direct, &payload).unwrap();
    volume
        .write_file_cluster(n_file, n_direct + rpc, &payload)
        .unwrap();

    let inode = volume.read_inode(n_file, InodeStatus::InUse).unwrap();
    assert_ne!(inode.direct[0], NULL_CLUSTER);
    assert_ne!(inode.i1, NULL_CLUSTER);
    assert_ne!(inode.i2, NULL_CLUSTER);
    // Three data clusters plus i1, i2, and one sub-single-indirect cluster.
    assert_eq!(inode.clucount, 6);

    let mut buf = [0_u8; CLUSTER_SIZE];
    volume
        .read_file_cluster(n_file, n_direct + rpc, &mut buf)
        .unwrap();
    assert_eq!(buf, payload);
    // A hole in between reads back as zeros.
    volume.read_file_cluster(n_file, 1, &mut buf).unwrap();
    assert_eq!(buf, [0_u8; CLUSTER_SIZE]);

    // The ownership invariant (every attached cluster mapped to this inode)
    // is part of the full check.
    assert_clean(&mut volume);
}

/// S4: a small hierarchy with a symlink, resolved and torn down.
#[test]
fn s4_directory_hierarchy() {
    let (mut volume, _tmp) = format_volume(100, 72);

    let n_a = make_node(&mut volume, InodeKind::Directory);
    volume.add_dir_entry(0, "a", n_a, AddOp::Add).unwrap();

    let n_b = make_node(&mut volume, InodeKind::File);
    volume.add_dir_entry(n_a, "b", n_b, AddOp::Add).unwrap();
    let mut payload = [0_u8; CLUSTER_SIZE];
    payload[..4].copy_from_slice(b"data");
    volume.write_file_cluster(n_b, 0, &payload).unwrap();

    let n_c = make_node(&mut volume, InodeKind::Symlink);
    let mut target = [0_u8; CLUSTER_SIZE];
    target[..1].copy_from_slice(b"b");
    volume.write_file_cluster(n_c, 0, &target).unwrap();
    volume.add_dir_entry(n_a, "c", n_c, AddOp::Add).unwrap();

    // Directory listing of /a: `.`, `..`, `b`, `c`.
    let mut buf = [0_u8; CLUSTER_SIZE];
    volume.read_file_cluster(n_a, 0, &mut buf).unwrap();
    let cluster = DirCluster::parse(&buf).unwrap();
    assert_eq!(cluster.entries[0].name_str(), ".");
    assert_eq!(cluster.entries[0].n_inode, n_a);
    assert_eq!(cluster.entries[1].name_str(), "..");
    assert_eq!(cluster.entries[1].n_inode, 0);
    assert_eq!(cluster.entries[2].name_str(), "b");
    assert_eq!(cluster.entries[3].name_str(), "c");

    // The path resolver follows the relative symlink to b.
    let (n_dir, n_ent) = volume.get_dir_entry_by_path("/a/c").unwrap();
    assert_eq!(n_dir, n_a);
    assert_eq!(n_ent, n_b);

    // Removing /a/b deletes the file outright: last hard link.
    let ifree_before = volume.superblock().unwrap().ifree;
    volume.remove_dir_entry(n_a, "b", RemoveOp::Remove).unwrap();

    let freed = volume.read_inode(n_b, InodeStatus::FreeDirty).unwrap();
    assert_eq!(freed.refcount, 0);
    assert!(freed.direct.iter().all(|r| *r == NULL_CLUSTER));
    assert_eq!(volume.superblock().unwrap().ifree, ifree_before + 1);

    // The entry stays recoverable: dirty-empty, inode number in place.
    volume.read_file_cluster(n_a, 0, &mut buf).unwrap();
    let cluster = DirCluster::parse(&buf).unwrap();
    assert_eq!(cluster.entries[2].state(), DirEntryState::DirtyEmpty);
    assert_eq!(cluster.entries[2].n_inode, n_b);

    assert_clean(&mut volume);
}

/// S5: rename and its collision/argument errors.
#[test]
fn s5_rename_and_collision() {
    let (mut volume, _tmp) = format_volume(100, 72);
    let n_a = make_node(&mut volume, InodeKind::Directory);
    volume.add_dir_entry(0, "a", n_a, AddOp::Add).unwrap();
    let n_c = make_node(&mut volume, InodeKind::Symlink);
    volume.add_dir_entry(n_a, "c", n_c, AddOp::Add).unwrap();

    volume.rename_dir_entry(n_a, "c", "d").unwrap();
    let (found, _) = volume.get_dir_entry_by_name(n_a, "d").unwrap();
    assert_eq!(found, n_c);
    assert_eq!(
        volume.get_dir_entry_by_name(n_a, "c"),
        Err(SofsError::NotFound)
    );

    assert_eq!(
        volume.rename_dir_entry(n_a, "d", "d"),
        Err(SofsError::Exists)
    );
    assert!(matches!(
        volume.rename_dir_entry(n_a, "..", "x"),
        Err(SofsError::Invalid(_))
    ));
}

/// S6: permission checks for the owner and for root.
#[test]
fn s6_permission_check() {
    let (mut volume, _tmp) = format_volume(100, 56);

    volume.set_credentials(Credentials::new(1000, 1000));
    let n_file = volume.alloc_inode(InodeKind::File).unwrap();
    let mut inode = volume.read_inode(n_file, InodeStatus::InUse).unwrap();
    inode.mode |= 0o400; // r-- --- ---
    volume
        .write_inode(n_file, &inode, InodeStatus::InUse)
        .unwrap();

    assert!(volume.access_granted(n_file, ACCESS_READ).is_ok());
    assert_eq!(
        volume.access_granted(n_file, ACCESS_WRITE),
        Err(SofsError::AccessDenied)
    );
    assert_eq!(
        volume.access_granted(n_file, ACCESS_EXEC),
        Err(SofsError::AccessDenied)
    );

    volume.set_credentials(Credentials::root());
    assert!(volume
        .access_granted(n_file, ACCESS_READ | ACCESS_WRITE)
        .is_ok());
    // No x bit anywhere: even root is refused execution.
    assert_eq!(
        volume.access_granted(n_file, ACCESS_EXEC),
        Err(SofsError::AccessDenied)
    );
}

/// A formatted volume survives a reopen from the backing file alone.
#[test]
fn format_then_reopen() {
    let (mut volume, tmp) = format_volume(100, 56);
    let n_dir = make_node(&mut volume, InodeKind::Directory);
    volume.add_dir_entry(0, "home", n_dir, AddOp::Add).unwrap();
    volume.close().unwrap();

    let mut volume = common::reopen(&tmp);
    let (found, _) = volume.get_dir_entry_by_name(0, "home").unwrap();
    assert_eq!(found, n_dir);
    let sb = volume.superblock().unwrap();
    assert_eq!(sb.volume_name(), "SOFS13");
    assert_eq!(sb.ifree, 54);
    assert_clean(&mut volume);
}

/// Directory sizes stay whole clusters as the root grows past one cluster.
#[test]
fn root_growth_keeps_cluster_granularity() {
    let (mut volume, _tmp) = format_volume(200, 72);
    // Cluster 0 has 30 free slots after `.` and `..`; one more entry forces
    // a second directory cluster.
    for i in 0..31 {
        let n_file = make_node(&mut volume, InodeKind::File);
        let name = format!("f{i:02}");
        volume.add_dir_entry(0, &name, n_file, AddOp::Add).unwrap();
    }
    let root = volume.read_inode(0, InodeStatus::InUse).unwrap();
    assert_eq!(root.size, 2 * BSLPC);
    assert_eq!(root.clucount, 2);
    let (found, idx) = volume.get_dir_entry_by_name(0, "f30").unwrap();
    assert_ne!(found, NULL_INODE);
    assert_eq!(idx, 32);
    assert_clean(&mut volume);
}
