//! Cursors over a tree version.
//!
//! A cursor keeps the path from the root to the current leaf, so moving to
//! the neighbouring leaf climbs only as far as needed.

use std::iter::FusedIterator;

use super::node::{InternalNode, LeafNode, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Iterator over `(key, value)` pairs of one tree version
pub struct Entries<'a, K, V> {
    /// Internal nodes above the current leaf and the child taken in each
    path: Vec<(&'a InternalNode<K, V>, usize)>,
    leaf: &'a LeafNode<K, V>,
    /// Forward: index of the next entry. Reverse: one past it.
    position: usize,
    direction: Direction,
}

impl<'a, K: Ord, V> Entries<'a, K, V> {
    /// Start before the smallest key
    pub(crate) fn first(root: &'a Node<K, V>) -> Self {
        let mut cursor = Self::empty(root, Direction::Forward);
        cursor.descend(root, Direction::Forward);
        cursor
    }

    /// Start after the largest key, moving backwards
    pub(crate) fn last(root: &'a Node<K, V>) -> Self {
        let mut cursor = Self::empty(root, Direction::Reverse);
        cursor.descend(root, Direction::Reverse);
        cursor
    }

    /// Start at the smallest key `>= key`
    pub(crate) fn greater_or_equal(root: &'a Node<K, V>, key: &K) -> Self {
        let mut cursor = Self::empty(root, Direction::Forward);
        cursor.seek(root, key);
        cursor.position = cursor.leaf.keys.partition_point(|k| k < key);
        cursor
    }

    /// Start at the largest key `<= key`, moving backwards
    pub(crate) fn lesser_or_equal(root: &'a Node<K, V>, key: &K) -> Self {
        let mut cursor = Self::empty(root, Direction::Reverse);
        cursor.seek(root, key);
        cursor.position = cursor.leaf.keys.partition_point(|k| k <= key);
        cursor
    }

    fn empty(root: &'a Node<K, V>, direction: Direction) -> Self {
        let leaf = leftmost_leaf(root);
        Self {
            path: Vec::new(),
            leaf,
            position: 0,
            direction,
        }
    }

    /// Walk down to the leaf that may contain `key`
    fn seek(&mut self, root: &'a Node<K, V>, key: &K) {
        let mut node = root;
        loop {
            match node {
                Node::Internal(internal) => {
                    let index = internal.child_index(key);
                    self.path.push((internal, index));
                    node = &internal.children[index];
                }
                Node::Leaf(leaf) => {
                    self.leaf = leaf;
                    return;
                }
            }
        }
    }

    /// Walk down the outermost edge of `node` in the cursor's direction
    fn descend(&mut self, mut node: &'a Node<K, V>, direction: Direction) {
        loop {
            match node {
                Node::Internal(internal) => {
                    let index = match direction {
                        Direction::Forward => 0,
                        Direction::Reverse => internal.children.len() - 1,
                    };
                    self.path.push((internal, index));
                    node = &internal.children[index];
                }
                Node::Leaf(leaf) => {
                    self.leaf = leaf;
                    self.position = match direction {
                        Direction::Forward => 0,
                        Direction::Reverse => leaf.keys.len(),
                    };
                    return;
                }
            }
        }
    }

    /// Move to the neighbouring leaf; false when there is none
    fn advance_leaf(&mut self) -> bool {
        while let Some((internal, index)) = self.path.pop() {
            let next = match self.direction {
                Direction::Forward if index + 1 < internal.children.len() => Some(index + 1),
                Direction::Reverse if index > 0 => Some(index - 1),
                _ => None,
            };
            if let Some(next) = next {
                self.path.push((internal, next));
                self.descend(&internal.children[next], self.direction);
                return true;
            }
        }
        false
    }
}

impl<'a, K: Ord, V> Iterator for Entries<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.direction {
                Direction::Forward if self.position < self.leaf.keys.len() => {
                    let index = self.position;
                    self.position += 1;
                    return Some((&self.leaf.keys[index], &self.leaf.values[index]));
                }
                Direction::Reverse if self.position > 0 => {
                    self.position -= 1;
                    let index = self.position;
                    return Some((&self.leaf.keys[index], &self.leaf.values[index]));
                }
                _ => {
                    if !self.advance_leaf() {
                        return None;
                    }
                }
            }
        }
    }
}

impl<K: Ord, V> FusedIterator for Entries<'_, K, V> {}

/// Iterator over the keys of one tree version
pub struct Keys<'a, K, V>(pub(crate) Entries<'a, K, V>);

impl<'a, K: Ord, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(key, _)| key)
    }
}

/// Iterator over the values of one tree version
pub struct Values<'a, K, V>(pub(crate) Entries<'a, K, V>);

impl<'a, K: Ord, V> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(_, value)| value)
    }
}

fn leftmost_leaf<K, V>(mut node: &Node<K, V>) -> &LeafNode<K, V> {
    loop {
        match node {
            Node::Internal(internal) => node = &internal.children[0],
            Node::Leaf(leaf) => return leaf,
        }
    }
}
