//! Tree nodes and the structural algorithms (split, steal, merge).
//!
//! Nodes are shared through `Arc`. Every mutation goes through
//! `Arc::make_mut`, so a node still referenced by another tree version is
//! copied before it is touched and the other version keeps the original.

use std::sync::Arc;

use crate::config::TreeOptions;

pub(crate) type NodeRef<K, V> = Arc<Node<K, V>>;

#[derive(Debug, Clone)]
pub(crate) enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K, V>),
}

/// Ordered key/value pairs
#[derive(Debug, Clone)]
pub(crate) struct LeafNode<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
}

/// Separator keys and children.
///
/// `keys[i]` is greater than every key below `children[i]` and not greater
/// than any key below `children[i + 1]`.
#[derive(Debug, Clone)]
pub(crate) struct InternalNode<K, V> {
    pub keys: Vec<K>,
    pub children: Vec<NodeRef<K, V>>,
}

/// Right half produced by a split, with the separator to push up
type Split<K, V> = (K, NodeRef<K, V>);

impl<K, V> LeafNode<K, V> {
    pub fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<K: Ord, V> InternalNode<K, V> {
    /// Index of the child whose subtree may contain `key`
    pub fn child_index(&self, key: &K) -> usize {
        self.keys.partition_point(|separator| separator <= key)
    }
}

impl<K, V> Node<K, V> {
    /// Entries of a leaf, children of an internal node
    pub fn size(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Internal(internal) => internal.children.len(),
        }
    }

    fn min_size(&self, options: &TreeOptions) -> usize {
        match self {
            Node::Leaf(_) => options.min_value_block_size,
            Node::Internal(_) => options.min_internal_node_size,
        }
    }

    fn is_underflow(&self, options: &TreeOptions) -> bool {
        self.size() < self.min_size(options)
    }

    fn has_surplus(&self, options: &TreeOptions) -> bool {
        self.size() > self.min_size(options)
    }
}

impl<K: Ord + Clone, V: Clone> Node<K, V> {
    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn search(&self, key: &K) -> Option<&V> {
        let mut node = self;
        loop {
            match node {
                Node::Internal(internal) => node = &internal.children[internal.child_index(key)],
                Node::Leaf(leaf) => {
                    return leaf
                        .keys
                        .binary_search(key)
                        .ok()
                        .map(|index| &leaf.values[index]);
                }
            }
        }
    }

    /// Mutable access to a value, copying every shared node on the path
    pub fn search_mut<'a>(node: &'a mut NodeRef<K, V>, key: &K) -> Option<&'a mut V> {
        match Arc::make_mut(node) {
            Node::Internal(internal) => {
                let index = internal.child_index(key);
                Self::search_mut(&mut internal.children[index], key)
            }
            Node::Leaf(leaf) => match leaf.keys.binary_search(key) {
                Ok(index) => Some(&mut leaf.values[index]),
                Err(_) => None,
            },
        }
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert below `node`, returning the replaced value and a split of
    /// `node` if it overflowed
    pub fn insert(
        node: &mut NodeRef<K, V>,
        key: K,
        value: V,
        options: &TreeOptions,
    ) -> (Option<V>, Option<Split<K, V>>) {
        match Arc::make_mut(node) {
            Node::Leaf(leaf) => match leaf.keys.binary_search(&key) {
                Ok(index) => {
                    let previous = std::mem::replace(&mut leaf.values[index], value);
                    (Some(previous), None)
                }
                Err(index) => {
                    leaf.keys.insert(index, key);
                    leaf.values.insert(index, value);
                    let split = (leaf.keys.len() > options.value_block_size)
                        .then(|| Self::split_leaf(leaf));
                    (None, split)
                }
            },
            Node::Internal(internal) => {
                let index = internal.child_index(&key);
                let (previous, child_split) =
                    Self::insert(&mut internal.children[index], key, value, options);
                let split = child_split.and_then(|(separator, right)| {
                    internal.keys.insert(index, separator);
                    internal.children.insert(index + 1, right);
                    (internal.children.len() > options.internal_node_size)
                        .then(|| Self::split_internal(internal))
                });
                (previous, split)
            }
        }
    }

    fn split_leaf(leaf: &mut LeafNode<K, V>) -> Split<K, V> {
        let mid = leaf.keys.len() / 2;
        let right = LeafNode {
            keys: leaf.keys.split_off(mid),
            values: leaf.values.split_off(mid),
        };
        let separator = right.keys[0].clone();
        (separator, Arc::new(Node::Leaf(right)))
    }

    fn split_internal(internal: &mut InternalNode<K, V>) -> Split<K, V> {
        let mid = internal.children.len() / 2;
        let children = internal.children.split_off(mid);
        let keys = internal.keys.split_off(mid);
        // the separator between the halves moves up
        let separator = internal
            .keys
            .pop()
            .unwrap_or_else(|| unreachable!("internal node with a single child split"));
        (separator, Arc::new(Node::Internal(InternalNode { keys, children })))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove `key` below `node`, rebalancing children that underflow
    pub fn remove(node: &mut NodeRef<K, V>, key: &K, options: &TreeOptions) -> Option<V> {
        match Arc::make_mut(node) {
            Node::Leaf(leaf) => {
                let index = leaf.keys.binary_search(key).ok()?;
                leaf.keys.remove(index);
                Some(leaf.values.remove(index))
            }
            Node::Internal(internal) => {
                let index = internal.child_index(key);
                let removed = Self::remove(&mut internal.children[index], key, options)?;
                if internal.children[index].is_underflow(options) {
                    Self::rebalance(internal, index, options);
                }
                Some(removed)
            }
        }
    }

    /// Fix an underflowing child: steal from the richer sibling with a
    /// surplus (left on a tie), otherwise merge (into the left sibling when
    /// there is one).
    fn rebalance(parent: &mut InternalNode<K, V>, index: usize, options: &TreeOptions) {
        let left = index
            .checked_sub(1)
            .map(|i| &parent.children[i])
            .filter(|n| n.has_surplus(options))
            .map(|n| n.size());
        let right = parent
            .children
            .get(index + 1)
            .filter(|n| n.has_surplus(options))
            .map(|n| n.size());

        match (left, right) {
            (Some(l), Some(r)) if r > l => Self::steal_from_right(parent, index),
            (Some(_), _) => Self::steal_from_left(parent, index),
            (None, Some(_)) => Self::steal_from_right(parent, index),
            (None, None) if index > 0 => Self::merge_into_left(parent, index),
            (None, None) => Self::merge_into_left(parent, index + 1),
        }
    }

    fn steal_from_left(parent: &mut InternalNode<K, V>, index: usize) {
        let (before, rest) = parent.children.split_at_mut(index);
        let left = Arc::make_mut(&mut before[index - 1]);
        let child = Arc::make_mut(&mut rest[0]);
        let separator = &mut parent.keys[index - 1];

        match (left, child) {
            (Node::Leaf(left), Node::Leaf(child)) => {
                if let (Some(key), Some(value)) = (left.keys.pop(), left.values.pop()) {
                    *separator = key.clone();
                    child.keys.insert(0, key);
                    child.values.insert(0, value);
                }
            }
            (Node::Internal(left), Node::Internal(child)) => {
                if let (Some(key), Some(grandchild)) = (left.keys.pop(), left.children.pop()) {
                    let down = std::mem::replace(separator, key);
                    child.keys.insert(0, down);
                    child.children.insert(0, grandchild);
                }
            }
            _ => unreachable!("siblings at different depths"),
        }
    }

    fn steal_from_right(parent: &mut InternalNode<K, V>, index: usize) {
        let (before, rest) = parent.children.split_at_mut(index + 1);
        let child = Arc::make_mut(&mut before[index]);
        let right = Arc::make_mut(&mut rest[0]);
        let separator = &mut parent.keys[index];

        match (child, right) {
            (Node::Leaf(child), Node::Leaf(right)) => {
                child.keys.push(right.keys.remove(0));
                child.values.push(right.values.remove(0));
                *separator = right.keys[0].clone();
            }
            (Node::Internal(child), Node::Internal(right)) => {
                let up = right.keys.remove(0);
                child.keys.push(std::mem::replace(separator, up));
                child.children.push(right.children.remove(0));
            }
            _ => unreachable!("siblings at different depths"),
        }
    }

    /// Merge `children[index]` into `children[index - 1]`
    fn merge_into_left(parent: &mut InternalNode<K, V>, index: usize) {
        let separator = parent.keys.remove(index - 1);
        let absorbed = parent.children.remove(index);
        let absorbed = Arc::try_unwrap(absorbed).unwrap_or_else(|shared| (*shared).clone());
        let left = Arc::make_mut(&mut parent.children[index - 1]);

        match (left, absorbed) {
            (Node::Leaf(left), Node::Leaf(right)) => {
                left.keys.extend(right.keys);
                left.values.extend(right.values);
            }
            (Node::Internal(left), Node::Internal(right)) => {
                left.keys.push(separator);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
            }
            _ => unreachable!("siblings at different depths"),
        }
    }
}
