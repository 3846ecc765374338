//! Integration tests for the B+Tree index

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use strata::buffer::BufferPoolManager;
use strata::common::{PageId, RecordId, SlotId};
use strata::index::btree_page::NodeView;
use strata::index::{BPlusTree, U32Comparator};
use strata::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_tree(
    pool_size: usize,
    leaf_max: usize,
    internal_max: usize,
) -> (Arc<BufferPoolManager>, BPlusTree<4>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, dm));

    let header_page_id = bpm.new_page().unwrap().page_id();
    let tree = BPlusTree::new(
        "test_index",
        header_page_id,
        Arc::clone(&bpm),
        Arc::new(U32Comparator),
        leaf_max,
        internal_max,
    )
    .unwrap();

    (bpm, tree, temp_file)
}

fn key(n: u32) -> [u8; 4] {
    n.to_le_bytes()
}

fn rid(n: u32) -> RecordId {
    RecordId::new(PageId::new(n), SlotId::new((n % 16) as u16))
}

fn scan(tree: &BPlusTree<4>) -> Vec<u32> {
    tree.begin()
        .unwrap()
        .map(|entry| u32::from_le_bytes(entry.unwrap().0))
        .collect()
}

#[test]
fn test_empty_tree() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 3);

    assert!(tree.is_empty().unwrap());
    assert_eq!(tree.get_value(&key(1)).unwrap(), None);
    assert!(scan(&tree).is_empty());
    assert!(tree.begin().unwrap().is_end());
    tree.remove(&key(1)).unwrap(); // removing from an empty tree is a no-op
}

#[test]
fn test_insert_then_lookup() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 3);

    assert!(tree.insert(&key(7), rid(7)).unwrap());
    assert!(!tree.is_empty().unwrap());
    assert_eq!(tree.get_value(&key(7)).unwrap(), Some(rid(7)));
    assert_eq!(tree.get_value(&key(8)).unwrap(), None);
}

#[test]
fn test_duplicate_insert_rejected() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 3);

    assert!(tree.insert(&key(5), rid(5)).unwrap());
    assert!(!tree.insert(&key(5), rid(99)).unwrap());

    // The original binding survives.
    assert_eq!(tree.get_value(&key(5)).unwrap(), Some(rid(5)));
    assert_eq!(scan(&tree), vec![5]);
}

#[test]
fn test_remove_then_reinsert() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 3);

    assert!(tree.insert(&key(3), rid(3)).unwrap());
    tree.remove(&key(3)).unwrap();
    assert_eq!(tree.get_value(&key(3)).unwrap(), None);

    assert!(tree.insert(&key(3), rid(30)).unwrap());
    assert_eq!(tree.get_value(&key(3)).unwrap(), Some(rid(30)));
}

#[test]
fn test_descending_insert_splits_root() {
    let (bpm, tree, _temp) = create_tree(16, 4, 3);

    for k in [5u32, 4, 3, 2, 1] {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }

    assert_eq!(scan(&tree), vec![1, 2, 3, 4, 5]);

    // Five entries exceed a single leaf, so the root must be internal.
    let root_page_id = tree.root_page_id().unwrap();
    let guard = bpm.checked_read_page(root_page_id).unwrap();
    assert!(!NodeView::new(guard.data()).is_leaf());
    drop(guard);

    tree.verify_integrity().unwrap();
}

#[test]
fn test_remove_middle_key() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 3);

    for k in 1u32..=20 {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }

    tree.remove(&key(10)).unwrap();

    assert_eq!(tree.get_value(&key(10)).unwrap(), None);
    let keys = scan(&tree);
    assert_eq!(keys.len(), 19);
    assert!(!keys.contains(&10));
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    tree.verify_integrity().unwrap();
}

#[test]
fn test_deletion_cascade_keeps_invariants() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 3);

    for k in 1u32..=16 {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }
    tree.verify_integrity().unwrap();

    let mut expected: Vec<u32> = (1..=16).collect();
    for k in [8u32, 7, 9, 6, 10, 5, 11] {
        tree.remove(&key(k)).unwrap();
        expected.retain(|&x| x != k);

        tree.verify_integrity().unwrap();
        assert_eq!(scan(&tree), expected, "after removing {}", k);
    }
}

#[test]
fn test_drain_to_empty_and_refill() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 3);

    for k in 1u32..=12 {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }
    for k in 1u32..=12 {
        tree.remove(&key(k)).unwrap();
        tree.verify_integrity().unwrap();
    }

    assert!(tree.is_empty().unwrap());
    assert!(scan(&tree).is_empty());

    // The tree is usable again after being emptied.
    for k in [4u32, 2, 6] {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }
    assert_eq!(scan(&tree), vec![2, 4, 6]);
    tree.verify_integrity().unwrap();
}

#[test]
fn test_shuffled_permutation_scans_sorted() {
    let (_bpm, tree, _temp) = create_tree(64, 4, 3);

    let mut keys: Vec<u32> = (1..=500).collect();
    keys.shuffle(&mut thread_rng());

    for &k in &keys {
        assert!(tree.insert(&key(k), rid(k)).unwrap(), "insert {}", k);
    }

    assert_eq!(scan(&tree), (1..=500).collect::<Vec<u32>>());
    tree.verify_integrity().unwrap();

    for k in 1u32..=500 {
        assert_eq!(tree.get_value(&key(k)).unwrap(), Some(rid(k)), "lookup {}", k);
    }
}

#[test]
fn test_interleaved_inserts_and_removes() {
    let (_bpm, tree, _temp) = create_tree(64, 4, 3);

    let mut rng = thread_rng();
    let mut keys: Vec<u32> = (1..=200).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }

    // Remove every odd key in random order.
    let mut odd: Vec<u32> = (1..=200).filter(|k| k % 2 == 1).collect();
    odd.shuffle(&mut rng);
    for &k in &odd {
        tree.remove(&key(k)).unwrap();
    }

    tree.verify_integrity().unwrap();
    let expected: Vec<u32> = (1..=200).filter(|k| k % 2 == 0).collect();
    assert_eq!(scan(&tree), expected);
}

#[test]
fn test_begin_at_positions_on_lower_bound() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 3);

    for k in [10u32, 20, 30, 40, 50] {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }

    // Exact hit.
    let keys: Vec<u32> = tree
        .begin_at(&key(30))
        .unwrap()
        .map(|e| u32::from_le_bytes(e.unwrap().0))
        .collect();
    assert_eq!(keys, vec![30, 40, 50]);

    // Between keys: starts at the next larger one.
    let keys: Vec<u32> = tree
        .begin_at(&key(25))
        .unwrap()
        .map(|e| u32::from_le_bytes(e.unwrap().0))
        .collect();
    assert_eq!(keys, vec![30, 40, 50]);

    // Past the largest key: empty range.
    assert!(tree.begin_at(&key(60)).unwrap().is_end());

    // The end iterator matches the exhausted cursor.
    assert!(tree.end().unwrap().is_end());
}

#[test]
fn test_reopen_existing_tree() {
    let (bpm, tree, _temp) = create_tree(32, 4, 3);

    for k in 1u32..=10 {
        assert!(tree.insert(&key(k), rid(k)).unwrap());
    }
    // The header page was the first page allocated in create_tree.
    let header_page_id = PageId::new(0);
    drop(tree);

    let reopened: BPlusTree<4> = BPlusTree::open(
        "test_index",
        header_page_id,
        Arc::clone(&bpm),
        Arc::new(U32Comparator),
        4,
        3,
    );

    assert_eq!(scan(&reopened), (1..=10).collect::<Vec<u32>>());
    assert_eq!(reopened.get_value(&key(7)).unwrap(), Some(rid(7)));
}
