//! Allocator behavior: inode free-list discipline, cluster cache churn,
//! dirty-state retention and recovery.

mod common;

use common::{assert_clean, format_volume, make_node};
use sofs_core::{BulkOp, ClusterOp, Inconsistency, InodeKind, InodeStatus, SofsError};
use sofs_types::{CLUSTER_SIZE, NULL_CLUSTER, NULL_INODE};

#[test]
fn inode_allocation_walks_the_chain_in_order() {
    let (mut volume, _tmp) = format_volume(100, 56);
    for expected in 1..=5 {
        assert_eq!(volume.alloc_inode(InodeKind::File).unwrap(), expected);
    }
    let sb = volume.superblock().unwrap();
    assert_eq!(sb.ihead, 6);
    assert_eq!(sb.ifree, 50);
    assert_clean(&mut volume);
}

#[test]
fn freed_inodes_requeue_at_the_tail() {
    let (mut volume, _tmp) = format_volume(100, 56);
    let n_a = volume.alloc_inode(InodeKind::File).unwrap();
    let n_b = volume.alloc_inode(InodeKind::File).unwrap();
    volume.free_inode(n_a).unwrap();
    volume.free_inode(n_b).unwrap();

    let sb = volume.superblock().unwrap();
    assert_eq!(sb.itail, n_b);
    assert_eq!(sb.ifree, 55);
    assert_clean(&mut volume);
}

#[test]
fn exhausting_inodes_reports_no_space() {
    let (mut volume, _tmp) = format_volume(20, 8);
    for _ in 0..7 {
        volume.alloc_inode(InodeKind::File).unwrap();
    }
    assert_eq!(
        volume.alloc_inode(InodeKind::File),
        Err(SofsError::NoSpace)
    );
    let sb = volume.superblock().unwrap();
    assert_eq!(sb.ifree, 0);
    assert_eq!(sb.ihead, NULL_INODE);
    assert_eq!(sb.itail, NULL_INODE);
    assert_clean(&mut volume);
}

#[test]
fn root_inode_is_pinned() {
    let (mut volume, _tmp) = format_volume(20, 8);
    assert!(matches!(volume.free_inode(0), Err(SofsError::Invalid(_))));
    assert!(matches!(volume.clean_inode(0), Err(SofsError::Invalid(_))));
}

#[test]
fn free_inode_refuses_linked_inodes() {
    let (mut volume, _tmp) = format_volume(100, 56);
    let n_dir = make_node(&mut volume, InodeKind::Directory);
    volume
        .add_dir_entry(0, "d", n_dir, sofs_core::AddOp::Add)
        .unwrap();
    // refcount is 2 now; freeing must be refused.
    assert_eq!(
        volume.free_inode(n_dir),
        Err(SofsError::Inconsistent(Inconsistency::InodeInUse))
    );
}

#[test]
fn cluster_churn_through_both_caches() {
    // 247 data clusters: enough to roll the 50-entry caches over several
    // times in both directions.
    let (mut volume, _tmp) = format_volume(1000, 40);
    let total = volume.superblock().unwrap().dzone_total;
    assert_eq!(total, 247);

    let mut allocated = Vec::new();
    loop {
        match volume.alloc_data_cluster() {
            Ok(n_clust) => allocated.push(n_clust),
            Err(SofsError::NoSpace) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(allocated.len() as u32, total - 1);
    // Every allocation is unique and in range.
    let mut sorted = allocated.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), allocated.len());
    assert!(sorted.iter().all(|c| *c >= 1 && *c < total));

    for n_clust in allocated.iter().rev() {
        volume.free_data_cluster(*n_clust).unwrap();
    }
    let sb = volume.superblock().unwrap();
    assert_eq!(sb.dzone_free, total - 1);
    assert_clean(&mut volume);
}

#[test]
fn freeing_a_free_cluster_is_detected() {
    let (mut volume, _tmp) = format_volume(20, 8);
    let n_clust = volume.alloc_data_cluster().unwrap();
    volume.free_data_cluster(n_clust).unwrap();
    assert_eq!(
        volume.free_data_cluster(n_clust),
        Err(SofsError::Inconsistent(Inconsistency::ClusterNotAllocated))
    );
}

#[test]
fn dirty_cluster_is_cleaned_out_of_its_owner_on_reuse() {
    let (mut volume, _tmp) = format_volume(20, 8);
    let n_file = make_node(&mut volume, InodeKind::File);
    let payload = [7_u8; CLUSTER_SIZE];
    volume.write_file_cluster(n_file, 0, &payload).unwrap();
    let n_clust = volume
        .handle_file_cluster(n_file, 0, ClusterOp::Get)
        .unwrap();
    assert_ne!(n_clust, NULL_CLUSTER);

    // FREE keeps the reference and the mapping: the dirty state.
    volume
        .handle_file_cluster(n_file, 0, ClusterOp::Free)
        .unwrap();
    let inode = volume.read_inode(n_file, InodeStatus::InUse).unwrap();
    assert_eq!(inode.direct[0], n_clust);
    assert_eq!(inode.clucount, 1);

    // Reallocate until the dirty cluster comes back; its old owner must be
    // scrubbed in the process.
    let mut reused = false;
    loop {
        match volume.alloc_data_cluster() {
            Ok(c) if c == n_clust => {
                reused = true;
                break;
            }
            Ok(_) => {}
            Err(SofsError::NoSpace) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(reused, "the freed cluster never came back around");

    let inode = volume.read_inode(n_file, InodeStatus::InUse).unwrap();
    assert_eq!(inode.direct[0], NULL_CLUSTER);
    assert_eq!(inode.clucount, 0);
}

#[test]
fn dirty_file_recovery_flow() {
    // Free a file's clusters (dirty), free the inode, then clean it: the
    // canonical forensic path back to a fully consistent volume.
    let (mut volume, _tmp) = format_volume(1000, 40);
    let n_file = make_node(&mut volume, InodeKind::File);
    let payload = [3_u8; CLUSTER_SIZE];
    for clust_ind in 0..3 {
        volume
            .write_file_cluster(n_file, clust_ind, &payload)
            .unwrap();
    }
    volume
        .write_file_cluster(n_file, sofs_types::N_DIRECT as u32 + 1, &payload)
        .unwrap();

    volume.handle_file_clusters(n_file, 0, BulkOp::Free).unwrap();
    // The chain survives the free: the file is recoverable.
    let inode = volume.read_inode(n_file, InodeStatus::InUse).unwrap();
    assert_eq!(inode.clucount, 5);
    assert_ne!(inode.direct[0], NULL_CLUSTER);

    volume.free_inode(n_file).unwrap();
    volume.clean_inode(n_file).unwrap();

    let inode = volume.read_inode(n_file, InodeStatus::FreeDirty).unwrap();
    assert!(inode.direct.iter().all(|r| *r == NULL_CLUSTER));
    assert_eq!(inode.i1, NULL_CLUSTER);
    assert_eq!(inode.clucount, 0);
    assert_clean(&mut volume);
}

#[test]
fn cleaned_head_inode_is_reusable() {
    // Drive a dirty inode to the head of the free list and allocate it
    // again; the allocator must clean it first.
    let (mut volume, _tmp) = format_volume(100, 16);
    let payload = [9_u8; CLUSTER_SIZE];

    // Consume all inodes so the free list becomes empty.
    let mut taken = Vec::new();
    for _ in 0..15 {
        taken.push(volume.alloc_inode(InodeKind::File).unwrap());
    }
    // Free the first one with clusters still attached (dirty).
    let n_dirty = taken[0];
    volume.write_file_cluster(n_dirty, 0, &payload).unwrap();
    volume
        .handle_file_clusters(n_dirty, 0, BulkOp::Free)
        .unwrap();
    volume.free_inode(n_dirty).unwrap();

    // It is now the single free inode, so the next allocation reuses it.
    let n_again = volume.alloc_inode(InodeKind::Directory).unwrap();
    assert_eq!(n_again, n_dirty);
    let inode = volume.read_inode(n_again, InodeStatus::InUse).unwrap();
    assert_eq!(inode.clucount, 0);
    assert!(inode.direct.iter().all(|r| *r == NULL_CLUSTER));
    assert_eq!(inode.refcount, 0);
}
