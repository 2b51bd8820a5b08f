//! Persistent tree nodes.
//!
//! A [`Node`] is an immutable `(value, priority)` pair. Object values keep
//! their children in a map ordered by [`key_compare`](crate::key::key_compare).
//! Updates copy only the spine from the root to the changed location;
//! every other subtree is shared with the previous version through `Arc`.
//!
//! Invariants:
//! - a children map never holds an empty node
//! - an empty node never carries a priority
//! - the content hash and max priority are computed at most once per node

use crate::error::{CoreError, CoreResult};
use crate::key::ChildKey;
use crate::path::{validate_key, Path};
use crate::server_values::{ServerValues, SERVER_VALUE_KEY};
use crate::value::{Leaf, Priority};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Key holding a node's priority in exported JSON.
pub const PRIORITY_KEY: &str = ".priority";

/// Key holding a leaf's value when exported alongside its priority.
pub const VALUE_KEY: &str = ".value";

/// Maximum nesting depth accepted at ingress.
pub const MAX_DEPTH: usize = 32;

#[derive(Clone)]
enum NodeKind {
    Empty,
    Leaf(Leaf),
    Children(BTreeMap<ChildKey, Node>),
}

struct NodeInner {
    kind: NodeKind,
    priority: Priority,
    hash: OnceLock<String>,
    max_priority: OnceLock<Priority>,
}

/// An immutable, structurally shared tree value.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    fn from_parts(kind: NodeKind, priority: Priority) -> Self {
        let priority = match kind {
            NodeKind::Empty => Priority::None,
            _ => priority,
        };
        Self {
            inner: Arc::new(NodeInner {
                kind,
                priority,
                hash: OnceLock::new(),
                max_priority: OnceLock::new(),
            }),
        }
    }

    fn from_map(children: BTreeMap<ChildKey, Node>, priority: Priority) -> Self {
        if children.is_empty() {
            Self::empty()
        } else {
            Self::from_parts(NodeKind::Children(children), priority)
        }
    }

    /// The null node.
    pub fn empty() -> Self {
        Self::from_parts(NodeKind::Empty, Priority::None)
    }

    /// A leaf without priority.
    pub fn leaf(value: Leaf) -> Self {
        Self::from_parts(NodeKind::Leaf(value), Priority::None)
    }

    /// Builds an object node from `(key, child)` pairs. Empty children are
    /// dropped.
    pub fn from_children<I, K>(children: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (key, child) in children {
            let key = key.into();
            validate_key(&key)?;
            if !child.is_empty() {
                map.insert(ChildKey::new(key), child);
            }
        }
        Ok(Self::from_map(map, Priority::None))
    }

    /// Builds an object node from children whose keys are already valid.
    pub(crate) fn from_valid_children<I>(children: I, priority: Priority) -> Self
    where
        I: IntoIterator<Item = (String, Node)>,
    {
        let map = children
            .into_iter()
            .filter(|(_, child)| !child.is_empty())
            .map(|(key, child)| (ChildKey::new(key), child))
            .collect();
        Self::from_map(map, priority)
    }

    /// Converts a JSON value, resolving server placeholders with the local
    /// clock.
    pub fn from_json(value: &Json) -> CoreResult<Self> {
        Self::from_json_with(value, &ServerValues::now())
    }

    /// Converts a JSON value, resolving server placeholders with `values`.
    ///
    /// Arrays become integer-keyed objects. `.priority` and `.value` keys are
    /// understood in the exported form produced by [`Node::export`].
    pub fn from_json_with(value: &Json, values: &ServerValues) -> CoreResult<Self> {
        parse_json(value, values, 0)
    }

    /// True for the null node.
    pub fn is_empty(&self) -> bool {
        matches!(self.inner.kind, NodeKind::Empty)
    }

    /// True for scalar nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self.inner.kind, NodeKind::Leaf(_))
    }

    /// The scalar held by a leaf node.
    pub fn leaf_value(&self) -> Option<&Leaf> {
        match &self.inner.kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// This node's priority.
    pub fn priority(&self) -> &Priority {
        &self.inner.priority
    }

    /// Returns a copy carrying `priority`. Children are shared.
    #[must_use]
    pub fn with_priority(&self, priority: Priority) -> Self {
        if self.is_empty() || *self.priority() == priority {
            return self.clone();
        }
        Self::from_parts(self.inner.kind.clone(), priority)
    }

    /// The immediate child named `key`, or the empty node.
    pub fn child(&self, key: &str) -> Node {
        if key == PRIORITY_KEY {
            return self.priority_node();
        }
        match &self.inner.kind {
            NodeKind::Children(map) => map
                .get(&ChildKey::new(key))
                .cloned()
                .unwrap_or_else(Node::empty),
            _ => Node::empty(),
        }
    }

    /// True when an immediate child named `key` exists.
    pub fn has_child(&self, key: &str) -> bool {
        match &self.inner.kind {
            NodeKind::Children(map) => map.contains_key(&ChildKey::new(key)),
            _ => false,
        }
    }

    /// The descendant at `path`, or the empty node.
    pub fn get(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for segment in path.segments() {
            if current.is_empty() {
                break;
            }
            current = current.child(segment);
        }
        current
    }

    /// Number of immediate children.
    pub fn num_children(&self) -> usize {
        match &self.inner.kind {
            NodeKind::Children(map) => map.len(),
            _ => 0,
        }
    }

    /// Immediate children in key order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> + '_ {
        let map = match &self.inner.kind {
            NodeKind::Children(map) => Some(map),
            _ => None,
        };
        map.into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Replaces the immediate child `key`. Setting an empty child removes it.
    #[must_use]
    pub fn update_child(&self, key: &str, child: Node) -> Node {
        if key == PRIORITY_KEY {
            let priority = child
                .leaf_value()
                .and_then(|leaf| Priority::from_leaf(Some(leaf)).ok())
                .unwrap_or_default();
            return self.with_priority(priority);
        }
        match &self.inner.kind {
            NodeKind::Children(map) => {
                let mut map = map.clone();
                if child.is_empty() {
                    if map.remove(&ChildKey::new(key)).is_none() {
                        return self.clone();
                    }
                } else {
                    map.insert(ChildKey::new(key), child);
                }
                Self::from_map(map, self.priority().clone())
            }
            NodeKind::Empty | NodeKind::Leaf(_) => {
                if child.is_empty() {
                    return self.clone();
                }
                let mut map = BTreeMap::new();
                map.insert(ChildKey::new(key), child);
                Self::from_map(map, self.priority().clone())
            }
        }
    }

    /// Replaces the descendant at `path` with `node`.
    #[must_use]
    pub fn update(&self, path: &Path, node: Node) -> Node {
        match path.front() {
            None => node,
            Some(front) => {
                let child = self.child(front).update(&path.rest(), node);
                self.update_child(front, child)
            }
        }
    }

    /// SHA-256 fingerprint of value and priority, hex encoded. The empty node
    /// hashes to the empty string.
    pub fn hash(&self) -> &str {
        self.inner.hash.get_or_init(|| self.compute_hash())
    }

    fn compute_hash(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut repr = String::new();
        if let Some(p) = self.priority().hash_repr() {
            repr.push_str("priority:");
            repr.push_str(&p);
            repr.push(':');
        }
        match &self.inner.kind {
            NodeKind::Empty => {}
            NodeKind::Leaf(leaf) => repr.push_str(&leaf.hash_repr()),
            NodeKind::Children(map) => {
                for (key, child) in map {
                    repr.push(':');
                    repr.push_str(key.as_str());
                    repr.push(':');
                    repr.push_str(child.hash());
                }
            }
        }
        format!("{:x}", Sha256::digest(repr.as_bytes()))
    }

    /// Highest priority carried by any descendant.
    pub fn max_priority(&self) -> &Priority {
        self.inner.max_priority.get_or_init(|| {
            let mut best = Priority::None;
            for (_, child) in self.children() {
                for candidate in [child.priority(), child.max_priority()] {
                    if candidate.compare(&best).is_gt() {
                        best = candidate.clone();
                    }
                }
            }
            best
        })
    }

    /// Public JSON form. Objects whose keys are exactly `0..n` become arrays.
    pub fn to_json(&self) -> Json {
        match &self.inner.kind {
            NodeKind::Empty => Json::Null,
            NodeKind::Leaf(leaf) => leaf.to_json(),
            NodeKind::Children(map) => {
                let is_array = map
                    .keys()
                    .enumerate()
                    .all(|(i, key)| key.array_index() == Some(i));
                if is_array {
                    Json::Array(map.values().map(Node::to_json).collect())
                } else {
                    let mut out = Map::new();
                    for (key, child) in map {
                        out.insert(key.as_str().to_string(), child.to_json());
                    }
                    Json::Object(out)
                }
            }
        }
    }

    /// JSON form including `.priority` and `.value` keys.
    pub fn export(&self) -> Json {
        let priority = self.priority();
        match &self.inner.kind {
            NodeKind::Empty => Json::Null,
            NodeKind::Leaf(leaf) if priority.is_none() => leaf.to_json(),
            NodeKind::Leaf(leaf) => {
                let mut out = Map::new();
                out.insert(VALUE_KEY.to_string(), leaf.to_json());
                out.insert(PRIORITY_KEY.to_string(), priority.to_json());
                Json::Object(out)
            }
            NodeKind::Children(map) => {
                let mut out = Map::new();
                for (key, child) in map {
                    out.insert(key.as_str().to_string(), child.export());
                }
                if !priority.is_none() {
                    out.insert(PRIORITY_KEY.to_string(), priority.to_json());
                }
                Json::Object(out)
            }
        }
    }

    fn priority_node(&self) -> Node {
        match self.priority() {
            Priority::None => Node::empty(),
            Priority::Number(n) => Node::leaf(Leaf::Number(*n)),
            Priority::String(s) => Node::leaf(Leaf::String(s.clone())),
        }
    }
}

fn parse_json(value: &Json, values: &ServerValues, depth: usize) -> CoreResult<Node> {
    if depth > MAX_DEPTH {
        return Err(CoreError::invalid_argument(format!(
            "value nests deeper than {MAX_DEPTH} levels"
        )));
    }
    match value {
        Json::Null => Ok(Node::empty()),
        Json::Bool(_) | Json::Number(_) | Json::String(_) => {
            let leaf = Leaf::from_json(value)
                .ok_or_else(|| CoreError::invalid_argument(format!("unsupported value {value}")))?;
            Ok(Node::leaf(leaf))
        }
        Json::Array(items) => {
            let mut map = BTreeMap::new();
            for (index, item) in items.iter().enumerate() {
                let child = parse_json(item, values, depth + 1)?;
                if !child.is_empty() {
                    map.insert(ChildKey::new(index.to_string()), child);
                }
            }
            Ok(Node::from_map(map, Priority::None))
        }
        Json::Object(object) => {
            if let Some(placeholder) = object.get(SERVER_VALUE_KEY) {
                if object.len() != 1 {
                    return Err(CoreError::invalid_argument(
                        "server value placeholder cannot have siblings",
                    ));
                }
                return Ok(Node::leaf(values.resolve(placeholder)?));
            }
            let priority = match object.get(PRIORITY_KEY) {
                Some(p) => Priority::from_json(p)?,
                None => Priority::None,
            };
            if let Some(inner) = object.get(VALUE_KEY) {
                let extra = object
                    .keys()
                    .any(|k| k != VALUE_KEY && k != PRIORITY_KEY);
                if extra {
                    return Err(CoreError::invalid_argument(
                        "\".value\" cannot be combined with child keys",
                    ));
                }
                let node = parse_json(inner, values, depth + 1)?;
                if !node.is_leaf() && !node.is_empty() {
                    return Err(CoreError::invalid_argument(
                        "\".value\" must hold a scalar",
                    ));
                }
                return Ok(node.with_priority(priority));
            }
            let mut map = BTreeMap::new();
            for (key, child) in object {
                if key == PRIORITY_KEY {
                    continue;
                }
                validate_key(key)?;
                let child = parse_json(child, values, depth + 1)?;
                if !child.is_empty() {
                    map.insert(ChildKey::new(key.clone()), child);
                }
            }
            Ok(Node::from_map(map, priority))
        }
    }
}

fn kinds_equal(a: &NodeKind, b: &NodeKind) -> bool {
    match (a, b) {
        (NodeKind::Empty, NodeKind::Empty) => true,
        (NodeKind::Leaf(x), NodeKind::Leaf(y)) => x == y,
        (NodeKind::Children(x), NodeKind::Children(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
        }
        _ => false,
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.priority == other.inner.priority
                && kinds_equal(&self.inner.kind, &other.inner.kind))
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.export())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: Json) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn null_is_empty() {
        assert!(node(json!(null)).is_empty());
        assert!(node(json!({})).is_empty());
        assert!(node(json!({"a": null})).is_empty());
        assert_eq!(node(json!({"a": {}})).to_json(), json!(null));
    }

    #[test]
    fn arrays_round_trip() {
        let n = node(json!(["x", "y", "z"]));
        assert_eq!(n.num_children(), 3);
        assert_eq!(n.child("1").to_json(), json!("y"));
        assert_eq!(n.to_json(), json!(["x", "y", "z"]));
    }

    #[test]
    fn sparse_arrays_become_objects() {
        let n = node(json!({"0": "a", "2": "c"}));
        assert_eq!(n.to_json(), json!({"0": "a", "2": "c"}));
        let n = node(json!(["a", null, "c"]));
        assert_eq!(n.to_json(), json!({"0": "a", "2": "c"}));
    }

    #[test]
    fn update_shares_untouched_children() {
        let before = node(json!({"a": {"x": 1}, "b": {"y": 2}}));
        let after = before.update(&path("a/x"), node(json!(5)));
        assert_eq!(after.to_json(), json!({"a": {"x": 5}, "b": {"y": 2}}));
        assert!(Arc::ptr_eq(
            &before.child("b").inner,
            &after.child("b").inner
        ));
        assert_eq!(before.to_json(), json!({"a": {"x": 1}, "b": {"y": 2}}));
    }

    #[test]
    fn removing_last_child_empties_parent() {
        let n = node(json!({"a": {"b": 1}}));
        let n = n.update(&path("a/b"), Node::empty());
        assert!(n.is_empty());
    }

    #[test]
    fn writing_beneath_a_leaf_replaces_it() {
        let n = node(json!({"a": 1}));
        let n = n.update(&path("a/b"), node(json!(2)));
        assert_eq!(n.to_json(), json!({"a": {"b": 2}}));
    }

    #[test]
    fn priorities_import_and_export() {
        let n = node(json!({".value": 3, ".priority": "p"}));
        assert_eq!(n.to_json(), json!(3));
        assert_eq!(n.priority(), &Priority::String("p".into()));
        assert_eq!(n.export(), json!({".value": 3, ".priority": "p"}));

        let n = node(json!({"a": 1, ".priority": 2}));
        assert_eq!(n.export(), json!({"a": 1, ".priority": 2}));
        assert_eq!(n.child(".priority").to_json(), json!(2));
        assert!(Node::from_json(&json!({".value": {"a": 1}})).is_err());
    }

    #[test]
    fn empty_never_carries_priority() {
        let n = Node::empty().with_priority(Priority::Number(1.0));
        assert!(n.priority().is_none());
    }

    #[test]
    fn invalid_keys_rejected() {
        assert!(Node::from_json(&json!({"a.b": 1})).is_err());
        assert!(Node::from_json(&json!({"$x": 1})).is_err());
    }

    #[test]
    fn server_timestamp_resolved() {
        let values = ServerValues::at(42);
        let n = Node::from_json_with(&json!({"t": {".sv": "timestamp"}}), &values).unwrap();
        assert_eq!(n.to_json(), json!({"t": 42}));
    }

    #[test]
    fn hash_tracks_content_and_priority() {
        let a = node(json!({"x": 1, "y": "z"}));
        let b = node(json!({"y": "z", "x": 1}));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
        let c = a.with_priority(Priority::Number(1.0));
        assert_ne!(a.hash(), c.hash());
        assert_ne!(a, c);
        assert_eq!(Node::empty().hash(), "");
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn max_priority_of_descendants() {
        let n = node(json!({
            "a": {".value": 1, ".priority": 5},
            "b": {"c": {".value": 1, ".priority": "s"}}
        }));
        assert_eq!(n.max_priority(), &Priority::String("s".into()));
    }

    #[test]
    fn depth_limit() {
        let mut value = json!(1);
        for _ in 0..40 {
            value = json!({ "n": value });
        }
        assert!(Node::from_json(&value).is_err());
    }
}
