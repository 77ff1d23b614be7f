//! Tests for the copy-on-write B+Tree
//!
//! These tests verify:
//! - Splits, steals, merges and root collapse on small node sizes
//! - Bounded iteration from present and absent keys, both directions
//! - Exhausted iterators keep returning None
//! - Cloned versions are unaffected by later mutations
//! - Random operation sequences behave like BTreeMap and stay consistent

use std::collections::BTreeMap;

use framekv::{BPlusTree, KvError, TreeOptions};
use proptest::prelude::*;

// =============================================================================
// Helper Functions
// =============================================================================

fn tree_of(block_size: usize, keys: impl IntoIterator<Item = u32>) -> BPlusTree<u32, String> {
    let mut tree = BPlusTree::with_block_size(block_size).unwrap();
    for key in keys {
        tree.insert(key, format!("v{}", key));
    }
    assert_consistent(&tree);
    tree
}

fn assert_consistent(tree: &BPlusTree<u32, String>) {
    let report = tree.consistency_report();
    assert!(report.is_consistent(), "{}\n{:?}", report, tree);
}

fn keys_of<'a>(iter: impl Iterator<Item = &'a u32>) -> Vec<u32> {
    iter.copied().collect()
}

// =============================================================================
// Structure Tests
// =============================================================================

#[test]
fn test_split_then_delete_in_order_three_tree() {
    let mut tree = tree_of(3, 1..=4);

    assert_eq!(tree.leaf_keys(), vec![vec![1, 2], vec![3, 4]]);
    assert_eq!(tree.height(), 2);

    assert_eq!(tree.delete(&2), Some("v2".to_string()));
    assert_consistent(&tree);
    assert_eq!(tree.leaf_keys(), vec![vec![1], vec![3, 4]]);
    assert_eq!(keys_of(tree.keys()), vec![1, 3, 4]);
}

#[test]
fn test_underflow_steals_from_sibling() {
    let options = TreeOptions::builder()
        .value_block_size(4)
        .min_value_block_size(2)
        .internal_node_size(4)
        .min_internal_node_size(2)
        .build();
    let mut tree = BPlusTree::with_options(options).unwrap();
    for key in [1u32, 2, 3, 4, 5] {
        tree.insert(key, format!("v{}", key));
    }
    assert_eq!(tree.leaf_keys(), vec![vec![1, 2], vec![3, 4, 5]]);

    tree.delete(&1);

    assert_consistent(&tree);
    assert_eq!(tree.leaf_keys(), vec![vec![2, 3], vec![4, 5]]);
}

#[test]
fn test_underflow_merges_and_root_collapses() {
    let options = TreeOptions::builder()
        .value_block_size(4)
        .min_value_block_size(2)
        .internal_node_size(4)
        .min_internal_node_size(2)
        .build();
    let mut tree = BPlusTree::with_options(options).unwrap();
    for key in [1u32, 2, 3, 4, 5] {
        tree.insert(key, format!("v{}", key));
    }
    tree.delete(&5);
    assert_eq!(tree.leaf_keys(), vec![vec![1, 2], vec![3, 4]]);

    tree.delete(&4);

    assert_consistent(&tree);
    assert_eq!(tree.height(), 1);
    assert_eq!(tree.leaf_keys(), vec![vec![1, 2, 3]]);
}

#[test]
fn test_shrinks_back_to_empty_leaf() {
    let mut tree = tree_of(3, 0..200);
    assert!(tree.height() > 3);

    for key in (0..200).rev() {
        assert_eq!(tree.delete(&key), Some(format!("v{}", key)));
        assert_consistent(&tree);
    }

    assert!(tree.is_empty());
    assert_eq!(tree.height(), 1);
    assert_eq!(tree.entries().next(), None);
}

#[test]
fn test_insert_overwrites_and_delete_missing() {
    let mut tree = tree_of(4, [5, 1, 9]);

    assert_eq!(tree.insert(5, "five".to_string()), Some("v5".to_string()));
    assert_eq!(tree.size(), 3);
    assert_eq!(tree.search(&5).map(String::as_str), Some("five"));
    assert_eq!(tree.delete(&7), None);
    assert_eq!(tree.size(), 3);
}

#[test]
fn test_upsert_and_get_mut() {
    let mut tree: BPlusTree<&str, u32> = BPlusTree::new();

    for word in ["a", "b", "a", "c", "a"] {
        tree.upsert(word, |count| count.map_or(1, |c| c + 1));
    }
    *tree.get_mut(&"b").unwrap() += 10;

    assert_eq!(tree.search(&"a"), Some(&3));
    assert_eq!(tree.search(&"b"), Some(&11));
    assert_eq!(tree.search(&"c"), Some(&1));
    assert!(tree.get_mut(&"z").is_none());
}

#[test]
fn test_invalid_options_rejected() {
    assert!(matches!(
        BPlusTree::<u32, u32>::with_block_size(1),
        Err(KvError::Config(_))
    ));
    let options = TreeOptions::builder()
        .value_block_size(4)
        .min_value_block_size(3)
        .build();
    assert!(matches!(
        BPlusTree::<u32, u32>::with_options(options),
        Err(KvError::Config(_))
    ));
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_full_iteration_both_directions() {
    let tree = tree_of(3, (0..50).map(|k| k * 2));

    assert_eq!(keys_of(tree.keys()), (0..50).map(|k| k * 2).collect::<Vec<_>>());
    assert_eq!(
        keys_of(tree.keys_rev()),
        (0..50).rev().map(|k| k * 2).collect::<Vec<_>>()
    );
    assert_eq!(tree.values().next().map(String::as_str), Some("v0"));
    assert_eq!(tree.values_rev().next().map(String::as_str), Some("v98"));
    assert_eq!(tree.first_key(), Some(&0));
    assert_eq!(tree.last_key(), Some(&98));
    assert_eq!((&tree).into_iter().count(), 50);
}

#[test]
fn test_greater_or_equal_from_present_and_absent_keys() {
    let tree = tree_of(3, (0..30).map(|k| k * 10));

    assert_eq!(keys_of(tree.greater_or_equal_keys(&250)), vec![250, 260, 270, 280, 290]);
    assert_eq!(keys_of(tree.greater_or_equal_keys(&251)), vec![260, 270, 280, 290]);
    assert_eq!(tree.greater_or_equal_keys(&0).count(), 30);
    assert_eq!(tree.greater_or_equal_keys(&291).next(), None);
    assert_eq!(
        tree.greater_or_equal_values(&45).next().map(String::as_str),
        Some("v50")
    );
}

#[test]
fn test_lesser_or_equal_from_present_and_absent_keys() {
    let tree = tree_of(3, (1..=30).map(|k| k * 10));

    assert_eq!(keys_of(tree.lesser_or_equal_keys(&40)), vec![40, 30, 20, 10]);
    assert_eq!(keys_of(tree.lesser_or_equal_keys(&39)), vec![30, 20, 10]);
    assert_eq!(tree.lesser_or_equal_keys(&1_000).count(), 30);
    assert_eq!(tree.lesser_or_equal_keys(&9).next(), None);
    assert_eq!(
        tree.lesser_or_equal_entries(&155).next(),
        Some((&150, &"v150".to_string()))
    );
}

#[test]
fn test_exhausted_iterator_stays_exhausted() {
    let tree = tree_of(3, 0..10);
    let mut iter = tree.entries();
    assert_eq!(iter.by_ref().count(), 10);

    assert_eq!(iter.next(), None);
    assert_eq!(iter.next(), None);

    let mut reverse = tree.lesser_or_equal_keys(&1);
    assert_eq!(reverse.next(), Some(&1));
    assert_eq!(reverse.next(), Some(&0));
    assert_eq!(reverse.next(), None);
    assert_eq!(reverse.next(), None);
}

#[test]
fn test_iteration_over_empty_tree() {
    let tree: BPlusTree<u32, String> = BPlusTree::new();

    assert_eq!(tree.entries().next(), None);
    assert_eq!(tree.entries_rev().next(), None);
    assert_eq!(tree.greater_or_equal_keys(&5).next(), None);
    assert_eq!(tree.lesser_or_equal_keys(&5).next(), None);
    assert_eq!(tree.first_key(), None);
}

// =============================================================================
// Version Tests
// =============================================================================

#[test]
fn test_clone_is_isolated_from_mutation() {
    let original = tree_of(3, 0..100);
    let mut copy = original.clone();
    assert!(copy.ptr_eq(&original));

    copy.insert(1_000, "new".to_string());
    copy.delete(&50);
    *copy.get_mut(&10).unwrap() = "changed".to_string();

    assert!(!copy.ptr_eq(&original));
    assert_eq!(original.size(), 100);
    assert_eq!(original.search(&50).map(String::as_str), Some("v50"));
    assert_eq!(original.search(&10).map(String::as_str), Some("v10"));
    assert_eq!(original.search(&1_000), None);
    assert_eq!(copy.search(&10).map(String::as_str), Some("changed"));
    assert_consistent(&original);
    assert_consistent(&copy);
}

#[test]
fn test_iterator_sees_its_own_version() {
    let mut tree = tree_of(3, 0..20);
    let snapshot = tree.clone();
    let mut iter = snapshot.keys();
    assert_eq!(iter.next(), Some(&0));

    for key in 0..20 {
        tree.delete(&key);
    }

    assert_eq!(iter.count(), 19);
    assert!(tree.is_empty());
}

#[test]
fn test_debug_output_lists_nodes() {
    let tree = tree_of(3, 1..=4);
    let rendered = format!("{:?}", tree);

    assert!(rendered.starts_with("BPlusTree(size=4)"));
    assert!(rendered.contains("internal [3]"));
    assert!(rendered.contains("leaf 1=\"v1\" 2=\"v2\""));
}

// =============================================================================
// Randomized Tests
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u32),
    Delete(u16),
    Upsert(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..300, any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => (0u16..300).prop_map(Op::Delete),
        1 => (0u16..300).prop_map(Op::Upsert),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_behaves_like_btreemap(
        block_size in 3usize..8,
        ops in prop::collection::vec(op_strategy(), 1..400),
    ) {
        let mut tree = BPlusTree::with_block_size(block_size).unwrap();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    prop_assert_eq!(tree.insert(key, value), model.insert(key, value));
                }
                Op::Delete(key) => {
                    prop_assert_eq!(tree.delete(&key), model.remove(&key));
                }
                Op::Upsert(key) => {
                    let bump = |v: Option<&u32>| v.map_or(0, |v| v.wrapping_add(1));
                    let expected = bump(model.get(&key));
                    tree.upsert(key, bump);
                    model.insert(key, expected);
                }
            }
            let report = tree.consistency_report();
            prop_assert!(report.is_consistent(), "{}", report);
            prop_assert_eq!(tree.size(), model.len());
        }

        let entries: Vec<(u16, u32)> = tree.entries().map(|(k, v)| (*k, *v)).collect();
        let expected: Vec<(u16, u32)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(entries, expected);
    }

    #[test]
    fn prop_bounded_iteration_matches_ranges(
        keys in prop::collection::btree_set(0u32..1_000, 0..200),
        bound in 0u32..1_000,
    ) {
        let tree: BPlusTree<u32, ()> = {
            let mut tree = BPlusTree::with_block_size(4).unwrap();
            for key in &keys {
                tree.insert(*key, ());
            }
            tree
        };

        let ge: Vec<u32> = tree.greater_or_equal_keys(&bound).copied().collect();
        let le: Vec<u32> = tree.lesser_or_equal_keys(&bound).copied().collect();

        prop_assert_eq!(ge, keys.range(bound..).copied().collect::<Vec<_>>());
        prop_assert_eq!(le, keys.range(..=bound).rev().copied().collect::<Vec<_>>());
    }
}
