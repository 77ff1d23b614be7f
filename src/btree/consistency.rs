//! Structural self-check of a tree version.

use std::fmt;

use crate::config::TreeOptions;

use super::node::Node;

/// Outcome of [`BPlusTree::consistency_report`](super::BPlusTree::consistency_report)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyReport {
    Consistent,
    /// First violation found
    Broken(String),
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        matches!(self, ConsistencyReport::Consistent)
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyReport::Consistent => write!(f, "CONSISTENT"),
            ConsistencyReport::Broken(message) => write!(f, "BROKEN: {}", message),
        }
    }
}

struct Checker<'o> {
    options: &'o TreeOptions,
    leaf_depth: Option<usize>,
    entries: usize,
}

/// Walk the whole tree checking sizes, key order, separators and leaf depth
pub(crate) fn check<K, V>(root: &Node<K, V>, options: &TreeOptions, expected_size: usize) -> ConsistencyReport
where
    K: Ord + fmt::Debug,
{
    let mut checker = Checker {
        options,
        leaf_depth: None,
        entries: 0,
    };
    if let Err(message) = checker.visit(root, None, None, 0) {
        return ConsistencyReport::Broken(message);
    }
    if checker.entries != expected_size {
        return ConsistencyReport::Broken(format!(
            "tree reports {} entries, leaves hold {}",
            expected_size, checker.entries
        ));
    }
    ConsistencyReport::Consistent
}

impl Checker<'_> {
    /// `lower` is inclusive, `upper` exclusive
    fn visit<K, V>(
        &mut self,
        node: &Node<K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
    ) -> Result<(), String>
    where
        K: Ord + fmt::Debug,
    {
        let is_root = depth == 0;
        match node {
            Node::Leaf(leaf) => {
                if leaf.keys.len() != leaf.values.len() {
                    return Err(format!(
                        "leaf at depth {} has {} keys but {} values",
                        depth,
                        leaf.keys.len(),
                        leaf.values.len()
                    ));
                }
                self.check_size(
                    "leaf",
                    leaf.keys.len(),
                    if is_root { 0 } else { self.options.min_value_block_size },
                    self.options.value_block_size,
                    depth,
                )?;
                check_keys(&leaf.keys, lower, upper, depth)?;

                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(format!(
                            "leaf at depth {} but other leaves are at depth {}",
                            depth, expected
                        ));
                    }
                    Some(_) => {}
                }
                self.entries += leaf.keys.len();
                Ok(())
            }
            Node::Internal(internal) => {
                if internal.keys.len() + 1 != internal.children.len() {
                    return Err(format!(
                        "internal node at depth {} has {} separators for {} children",
                        depth,
                        internal.keys.len(),
                        internal.children.len()
                    ));
                }
                self.check_size(
                    "internal node",
                    internal.children.len(),
                    if is_root { 2 } else { self.options.min_internal_node_size },
                    self.options.internal_node_size,
                    depth,
                )?;
                check_keys(&internal.keys, lower, upper, depth)?;

                for (index, child) in internal.children.iter().enumerate() {
                    let child_lower = if index == 0 { lower } else { Some(&internal.keys[index - 1]) };
                    let child_upper = internal.keys.get(index).or(upper);
                    self.visit(child, child_lower, child_upper, depth + 1)?;
                }
                Ok(())
            }
        }
    }

    fn check_size(&self, kind: &str, size: usize, min: usize, max: usize, depth: usize) -> Result<(), String> {
        if size < min || size > max {
            return Err(format!(
                "{} at depth {} has size {}, allowed [{}, {}]",
                kind, depth, size, min, max
            ));
        }
        Ok(())
    }
}

/// Keys strictly ascending and inside `[lower, upper)`
fn check_keys<K: Ord + fmt::Debug>(
    keys: &[K],
    lower: Option<&K>,
    upper: Option<&K>,
    depth: usize,
) -> Result<(), String> {
    for pair in keys.windows(2) {
        if pair[0] >= pair[1] {
            return Err(format!(
                "keys {:?} and {:?} out of order at depth {}",
                pair[0], pair[1], depth
            ));
        }
    }
    if let (Some(first), Some(lower)) = (keys.first(), lower) {
        if first < lower {
            return Err(format!(
                "key {:?} at depth {} below separator {:?}",
                first, depth, lower
            ));
        }
    }
    if let (Some(last), Some(upper)) = (keys.last(), upper) {
        if last >= upper {
            return Err(format!(
                "key {:?} at depth {} not below separator {:?}",
                last, depth, upper
            ));
        }
    }
    Ok(())
}
