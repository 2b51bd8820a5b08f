//! Sibling ordering.
//!
//! Every ordering breaks ties by child key, so sorting is total and
//! deterministic.

use crate::key::key_compare;
use crate::node::Node;
use crate::path::Path;
use crate::value::{Leaf, Priority};
use std::cmp::Ordering;
use std::fmt;

/// The criterion children are ordered by.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OrderBy {
    /// By priority, then key.
    #[default]
    Priority,
    /// By key only.
    Key,
    /// By the child's own value.
    Value,
    /// By the value of a descendant of each child.
    Child(Path),
}

/// One end of a range filter: an indexed value plus an optional key
/// tie-breaker. `value == None` means null.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// The indexed value at the boundary.
    pub value: Option<Leaf>,
    /// Key compared when a child's indexed value equals `value`.
    pub key: Option<String>,
}

impl Bound {
    /// Creates a bound.
    pub fn new(value: Option<Leaf>, key: Option<String>) -> Self {
        Self { value, key }
    }
}

impl OrderBy {
    /// Compares two named children.
    pub fn compare(&self, a: (&str, &Node), b: (&str, &Node)) -> Ordering {
        let primary = match self {
            OrderBy::Priority => a.1.priority().compare(b.1.priority()),
            OrderBy::Key => Ordering::Equal,
            OrderBy::Value => compare_values(a.1, b.1),
            OrderBy::Child(path) => compare_values(&a.1.get(path), &b.1.get(path)),
        };
        primary.then_with(|| key_compare(a.0, b.0))
    }

    /// True when the value this ordering sorts by differs between two
    /// versions of the same child.
    pub fn indexed_value_changed(&self, old: &Node, new: &Node) -> bool {
        let ordering = match self {
            OrderBy::Priority => old.priority().compare(new.priority()),
            OrderBy::Key => Ordering::Equal,
            OrderBy::Value => compare_values(old, new),
            OrderBy::Child(path) => compare_values(&old.get(path), &new.get(path)),
        };
        ordering != Ordering::Equal
    }

    /// Compares a child against a range bound. A bound without a key
    /// compares equal to every child with the same indexed value.
    pub fn compare_to_bound(&self, key: &str, node: &Node, bound: &Bound) -> Ordering {
        let primary = match self {
            OrderBy::Priority => {
                let bound_priority = Priority::from_leaf(bound.value.as_ref()).unwrap_or_default();
                node.priority().compare(&bound_priority)
            }
            OrderBy::Key => match &bound.value {
                Some(Leaf::String(k)) => return key_compare(key, k),
                _ => return Ordering::Greater,
            },
            OrderBy::Value => compare_to_leaf(node, bound.value.as_ref()),
            OrderBy::Child(path) => compare_to_leaf(&node.get(path), bound.value.as_ref()),
        };
        primary.then_with(|| match &bound.key {
            Some(k) => key_compare(key, k),
            None => Ordering::Equal,
        })
    }

    /// Canonical textual form used in query identifiers.
    pub fn identifier(&self) -> String {
        match self {
            OrderBy::Priority => ".priority".to_string(),
            OrderBy::Key => ".key".to_string(),
            OrderBy::Value => ".value".to_string(),
            OrderBy::Child(path) => path.to_string(),
        }
    }

    /// Sorts the immediate children of `node`.
    pub fn sorted_children(&self, node: &Node) -> Vec<(String, Node)> {
        let mut children: Vec<(String, Node)> = node
            .children()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        children.sort_by(|a, b| self.compare((&a.0, &a.1), (&b.0, &b.1)));
        children
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

/// Rank used by value ordering: null, scalars, objects.
fn value_rank(node: &Node) -> u8 {
    if node.is_empty() {
        0
    } else if node.is_leaf() {
        1
    } else {
        2
    }
}

/// Orders nodes as null < false < true < numbers < strings < objects.
pub fn compare_values(a: &Node, b: &Node) -> Ordering {
    match (a.leaf_value(), b.leaf_value()) {
        (Some(x), Some(y)) => x.compare(y),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}

fn compare_to_leaf(node: &Node, leaf: Option<&Leaf>) -> Ordering {
    match (node.leaf_value(), leaf) {
        (Some(x), Some(y)) => x.compare(y),
        (None, None) if node.is_empty() => Ordering::Equal,
        (_, None) => Ordering::Greater,
        (None, Some(_)) => {
            if node.is_empty() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    }
}
