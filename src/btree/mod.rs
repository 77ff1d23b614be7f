//! B+Tree Module
//!
//! Ordered key/value index with copy-on-write nodes.
//!
//! ## Responsibilities
//! - Point lookups, inserts (overwrite), upserts and deletes
//! - Keeping every non-root node within its size bounds (split / steal / merge)
//! - Forward, reverse and bounded iteration over a fixed version
//! - Self-check of the structure
//!
//! ## Versions
//! A tree is a root pointer plus its entry count. Cloning a tree is O(1);
//! the clone shares every node with the original, and a mutation of either
//! copies only the nodes on the path it touches.
//!
//! ```text
//!   v1 root        v2 root (after insert into leaf C)
//!     │   ╲          │
//!     ▼    ╲         ▼
//!   [ A | B ]       [ A | B' ]
//!   ╱   │  ╲         ╱   │   ╲
//!  L1   L2  C       L1   L2   C'
//! ```

mod consistency;
mod iter;
mod node;

use std::fmt;
use std::sync::Arc;

use crate::config::TreeOptions;
use crate::error::Result;

pub use consistency::ConsistencyReport;
pub use iter::{Entries, Keys, Values};

use node::{InternalNode, LeafNode, Node, NodeRef};

/// Copy-on-write B+Tree
#[derive(Clone)]
pub struct BPlusTree<K, V> {
    root: NodeRef<K, V>,
    size: usize,
    options: TreeOptions,
}

impl<K: Ord + Clone, V: Clone> Default for BPlusTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> BPlusTree<K, V> {
    /// Empty tree with default node sizes
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::Leaf(LeafNode::empty())),
            size: 0,
            options: TreeOptions::default(),
        }
    }

    /// Empty tree with the given node sizes
    pub fn with_options(options: TreeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            ..Self::new()
        })
    }

    /// Empty tree deriving every node bound from one block size
    pub fn with_block_size(block_size: usize) -> Result<Self> {
        Self::with_options(TreeOptions::with_block_size(block_size))
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn search(&self, key: &K) -> Option<&V> {
        self.root.search(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.search(key).is_some()
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Levels from the root to the leaves, 1 for a lone leaf
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root.as_ref();
        while let Node::Internal(internal) = node {
            node = &internal.children[0];
            height += 1;
        }
        height
    }

    pub fn first_key(&self) -> Option<&K> {
        self.keys().next()
    }

    pub fn last_key(&self) -> Option<&K> {
        self.keys_rev().next()
    }

    /// True when both trees are the same version (share their root)
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or overwrite, returning the previous value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let (previous, split) = Node::insert(&mut self.root, key, value, &self.options);
        if let Some((separator, right)) = split {
            // root split: tree grows by one level
            let left = Arc::clone(&self.root);
            self.root = Arc::new(Node::Internal(InternalNode {
                keys: vec![separator],
                children: vec![left, right],
            }));
        }
        if previous.is_none() {
            self.size += 1;
        }
        previous
    }

    /// Insert `update(current)` under `key`, returning the previous value
    pub fn upsert<F>(&mut self, key: K, update: F) -> Option<V>
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let value = update(self.search(&key));
        self.insert(key, value)
    }

    /// Remove `key`, returning its value
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let removed = Node::remove(&mut self.root, key, &self.options)?;
        self.size -= 1;

        let collapsed = match self.root.as_ref() {
            Node::Internal(internal) if internal.children.len() == 1 => {
                Some(Arc::clone(&internal.children[0]))
            }
            _ => None,
        };
        if let Some(child) = collapsed {
            self.root = child;
        }
        Some(removed)
    }

    /// Mutable access to a value; shared nodes on the path are copied first,
    /// so other versions of the tree keep the old value
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        Node::search_mut(&mut self.root, key)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    pub fn entries(&self) -> Entries<'_, K, V> {
        Entries::first(&self.root)
    }

    pub fn entries_rev(&self) -> Entries<'_, K, V> {
        Entries::last(&self.root)
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys(self.entries())
    }

    pub fn keys_rev(&self) -> Keys<'_, K, V> {
        Keys(self.entries_rev())
    }

    pub fn values(&self) -> Values<'_, K, V> {
        Values(self.entries())
    }

    pub fn values_rev(&self) -> Values<'_, K, V> {
        Values(self.entries_rev())
    }

    /// Ascending from the first key `>= key`, present or not
    pub fn greater_or_equal_entries(&self, key: &K) -> Entries<'_, K, V> {
        Entries::greater_or_equal(&self.root, key)
    }

    /// Descending from the last key `<= key`, present or not
    pub fn lesser_or_equal_entries(&self, key: &K) -> Entries<'_, K, V> {
        Entries::lesser_or_equal(&self.root, key)
    }

    pub fn greater_or_equal_keys(&self, key: &K) -> Keys<'_, K, V> {
        Keys(self.greater_or_equal_entries(key))
    }

    pub fn lesser_or_equal_keys(&self, key: &K) -> Keys<'_, K, V> {
        Keys(self.lesser_or_equal_entries(key))
    }

    pub fn greater_or_equal_values(&self, key: &K) -> Values<'_, K, V> {
        Values(self.greater_or_equal_entries(key))
    }

    pub fn lesser_or_equal_values(&self, key: &K) -> Values<'_, K, V> {
        Values(self.lesser_or_equal_entries(key))
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Check node sizes, key order, separators and leaf depth
    pub fn consistency_report(&self) -> ConsistencyReport
    where
        K: fmt::Debug,
    {
        consistency::check(&self.root, &self.options, self.size)
    }

    /// Keys grouped per leaf, left to right
    pub fn leaf_keys(&self) -> Vec<Vec<K>> {
        fn collect<K: Clone, V>(node: &Node<K, V>, out: &mut Vec<Vec<K>>) {
            match node {
                Node::Leaf(leaf) => out.push(leaf.keys.clone()),
                Node::Internal(internal) => {
                    for child in &internal.children {
                        collect(child, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }
}

impl<'a, K: Ord + Clone, V: Clone> IntoIterator for &'a BPlusTree<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Entries<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries()
    }
}

impl<K: Ord + Clone, V: Clone> FromIterator<(K, V)> for BPlusTree<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tree = Self::new();
        for (key, value) in iter {
            tree.insert(key, value);
        }
        tree
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for BPlusTree<K, V> {
    /// One line per node, indented by depth
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render<K: fmt::Debug, V: fmt::Debug>(
            node: &Node<K, V>,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            let indent = "  ".repeat(depth);
            match node {
                Node::Leaf(leaf) => {
                    write!(f, "{}leaf", indent)?;
                    for (key, value) in leaf.keys.iter().zip(&leaf.values) {
                        write!(f, " {:?}={:?}", key, value)?;
                    }
                    writeln!(f)
                }
                Node::Internal(internal) => {
                    writeln!(f, "{}internal {:?}", indent, internal.keys)?;
                    for child in &internal.children {
                        render(child, depth + 1, f)?;
                    }
                    Ok(())
                }
            }
        }
        writeln!(f, "BPlusTree(size={})", self.size)?;
        render(&self.root, 0, f)
    }
}
