//! Integration tests for the B+ tree index

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use stratum::buffer::BufferPoolManager;
use stratum::common::{PageId, RecordId, SlotId};
use stratum::index::{BPlusTree, IntegerComparator};
use stratum::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_tree(
    pool_size: usize,
    leaf_max: usize,
    internal_max: usize,
) -> (Arc<BufferPoolManager>, BPlusTree, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, dm));
    let tree = BPlusTree::new(
        Arc::clone(&bpm),
        Box::new(IntegerComparator),
        leaf_max,
        internal_max,
    )
    .unwrap();
    (bpm, tree, temp_file)
}

fn rid(key: u32) -> RecordId {
    RecordId::new(PageId::new(key), SlotId::new(key as u16))
}

fn collect_keys(tree: &BPlusTree) -> Vec<u32> {
    tree.begin()
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect()
}

#[test]
fn test_empty_tree() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 5);

    assert!(tree.is_empty());
    assert_eq!(tree.get(1).unwrap(), None);
    assert!(tree.begin().unwrap().is_end());
    tree.check_integrity().unwrap();
}

#[test]
fn test_insert_and_get() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 5);

    for key in [5u32, 3, 8, 1, 9] {
        assert!(tree.insert(key, rid(key)).unwrap());
    }
    assert!(!tree.is_empty());

    for key in [5u32, 3, 8, 1, 9] {
        assert_eq!(tree.get(key).unwrap(), Some(rid(key)));
    }
    assert_eq!(tree.get(2).unwrap(), None);
    assert_eq!(tree.get(100).unwrap(), None);

    // duplicates are rejected
    assert!(!tree.insert(5, rid(5)).unwrap());
    tree.check_integrity().unwrap();
}

/// Sequential insert with small fanouts grows a three-level tree whose
/// drawn leaf shape is checked exactly; removing every third key keeps
/// occupancy legal and iterates the survivors back in order.
#[test]
fn test_insert_remove_cycle() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 5);

    for key in 1..=20u32 {
        assert!(tree.insert(key, rid(key)).unwrap());
        tree.check_integrity().unwrap();
    }
    assert_eq!(collect_keys(&tree), (1..=20).collect::<Vec<_>>());

    // three levels: every leaf sits two levels below the root
    let picture = tree.draw().unwrap();
    let leaves: Vec<&str> = picture
        .lines()
        .filter(|line| line.trim_start().starts_with("leaf"))
        .collect();
    assert!(
        !leaves.is_empty() && leaves.iter().all(|line| line.starts_with("    leaf")),
        "unexpected tree shape:\n{picture}"
    );

    // leaves fill to leaf_max before splitting, and each ascending split
    // leaves the post-split minimum behind, so the chain reads
    // [2, 2, ..., 2, 4] with the still-filling rightmost leaf at capacity
    let sizes: Vec<usize> = leaves
        .iter()
        .map(|line| {
            let keys = line.split('[').nth(1).unwrap().split(']').next().unwrap();
            keys.split_whitespace().count()
        })
        .collect();
    assert_eq!(sizes, vec![2, 2, 2, 2, 2, 2, 2, 2, 4], "{picture}");

    for key in [3u32, 6, 9, 12, 15, 18] {
        tree.remove(key).unwrap();
        tree.check_integrity().unwrap();
    }

    let expected = vec![1, 2, 4, 5, 7, 8, 10, 11, 13, 14, 16, 17, 19, 20];
    assert_eq!(collect_keys(&tree), expected);
    for &key in &expected {
        assert_eq!(tree.get(key).unwrap(), Some(rid(key)));
    }
    for key in [3u32, 6, 9, 12, 15, 18] {
        assert_eq!(tree.get(key).unwrap(), None);
    }
}

#[test]
fn test_remove_to_empty_and_reuse() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 5);

    for key in 1..=30u32 {
        tree.insert(key, rid(key)).unwrap();
    }
    for key in 1..=30u32 {
        tree.remove(key).unwrap();
        tree.check_integrity().unwrap();
    }

    assert!(tree.is_empty());
    assert!(tree.begin().unwrap().is_end());

    // removing from the empty tree is a no-op, and the tree grows again
    tree.remove(7).unwrap();
    assert!(tree.insert(7, rid(7)).unwrap());
    assert_eq!(tree.get(7).unwrap(), Some(rid(7)));
}

#[test]
fn test_remove_absent_key_is_noop() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 5);

    for key in [2u32, 4, 6] {
        tree.insert(key, rid(key)).unwrap();
    }
    tree.remove(3).unwrap();
    tree.remove(100).unwrap();
    assert_eq!(collect_keys(&tree), vec![2, 4, 6]);
}

#[test]
fn test_iterator_seek() {
    let (_bpm, tree, _temp) = create_tree(32, 4, 5);

    for key in (2..=40u32).step_by(2) {
        tree.insert(key, rid(key)).unwrap();
    }

    // exact hit
    let from_ten: Vec<u32> = tree.begin_at(10).unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(from_ten, (10..=40).step_by(2).collect::<Vec<_>>());

    // absent key seeks to the next larger one
    let from_eleven: Vec<u32> = tree.begin_at(11).unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(from_eleven, (12..=40).step_by(2).collect::<Vec<_>>());

    // past the last key
    assert!(tree.begin_at(41).unwrap().is_end());
}

#[test]
fn test_iterator_walks_leaf_chain() {
    let (_bpm, tree, _temp) = create_tree(64, 4, 4);

    for key in 0..100u32 {
        tree.insert(key, rid(key)).unwrap();
    }

    let mut iter = tree.begin().unwrap();
    let mut count = 0;
    while !iter.is_end() {
        let (key, value) = iter.current().unwrap();
        assert_eq!(key, count);
        assert_eq!(value, rid(count));
        iter.advance().unwrap();
        count += 1;
    }
    assert_eq!(count, 100);
}

#[test]
fn test_random_workload_stays_sorted() {
    let (_bpm, tree, _temp) = create_tree(64, 4, 5);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let mut keys: Vec<u32> = (0..200).collect();
    keys.shuffle(&mut rng);
    for &key in &keys {
        assert!(tree.insert(key, rid(key)).unwrap());
    }
    tree.check_integrity().unwrap();
    assert_eq!(collect_keys(&tree), (0..200).collect::<Vec<_>>());

    let (gone, kept) = keys.split_at(100);
    for &key in gone {
        tree.remove(key).unwrap();
    }
    tree.check_integrity().unwrap();

    let mut expected: Vec<u32> = kept.to_vec();
    expected.sort_unstable();
    assert_eq!(collect_keys(&tree), expected);

    for &key in gone {
        assert_eq!(tree.get(key).unwrap(), None);
    }
    for &key in kept {
        assert_eq!(tree.get(key).unwrap(), Some(rid(key)));
    }
}

/// Insert and remove of the same key settle into a two-state cycle.
#[test]
fn test_insert_remove_idempotent_cycle() {
    let (_bpm, tree, _temp) = create_tree(16, 4, 5);

    for round in 0..5 {
        assert!(tree.insert(42, rid(42)).unwrap(), "round {round}");
        assert_eq!(tree.get(42).unwrap(), Some(rid(42)));
        tree.remove(42).unwrap();
        assert_eq!(tree.get(42).unwrap(), None);
    }
}

#[test]
fn test_survives_buffer_pressure() {
    // pool far smaller than the tree: every operation churns the replacer
    let (_bpm, tree, _temp) = create_tree(32, 4, 4);

    for key in 0..300u32 {
        assert!(tree.insert(key, rid(key)).unwrap());
    }
    tree.check_integrity().unwrap();
    for key in 0..300u32 {
        assert_eq!(tree.get(key).unwrap(), Some(rid(key)), "key {key}");
    }
    assert_eq!(collect_keys(&tree), (0..300).collect::<Vec<_>>());
}
