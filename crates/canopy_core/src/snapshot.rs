//! Immutable views handed to listeners and transaction callers.

use crate::error::CoreResult;
use crate::index::OrderBy;
use crate::node::Node;
use crate::path::Path;
use serde_json::Value as Json;

/// The value at a location at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSnapshot {
    path: Path,
    node: Node,
    order: OrderBy,
}

impl DataSnapshot {
    /// Wraps `node` located at `path`, iterating children by `order`.
    pub fn new(path: Path, node: Node, order: OrderBy) -> Self {
        Self { path, node, order }
    }

    /// Last path segment, or `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    /// Location of this snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Snapshot of a descendant. `relative` may contain several segments.
    pub fn child(&self, relative: &str) -> CoreResult<DataSnapshot> {
        let rel = Path::parse(relative)?;
        Ok(DataSnapshot::new(
            self.path.join(&rel),
            self.node.get(&rel),
            self.order.clone(),
        ))
    }

    /// True unless the value is null.
    pub fn exists(&self) -> bool {
        !self.node.is_empty()
    }

    /// Visits children in query order. Returns true when `f` stopped the
    /// iteration by returning true.
    pub fn for_each<F>(&self, mut f: F) -> bool
    where
        F: FnMut(DataSnapshot) -> bool,
    {
        for (key, child) in self.order.sorted_children(&self.node) {
            let Ok(path) = self.path.child(&key) else {
                continue;
            };
            if f(DataSnapshot::new(path, child, self.order.clone())) {
                return true;
            }
        }
        false
    }

    /// Priority as JSON (null when unset).
    pub fn priority(&self) -> Json {
        self.node.priority().to_json()
    }

    /// True when a non-null descendant exists at `relative`.
    pub fn has_child(&self, relative: &str) -> CoreResult<bool> {
        let rel = Path::parse(relative)?;
        Ok(!self.node.get(&rel).is_empty())
    }

    /// True when this value has children.
    pub fn has_children(&self) -> bool {
        self.node.num_children() > 0
    }

    /// Number of immediate children.
    pub fn num_children(&self) -> usize {
        self.node.num_children()
    }

    /// The value as plain JSON.
    pub fn val(&self) -> Json {
        self.node.to_json()
    }

    /// The value including priorities.
    pub fn export_val(&self) -> Json {
        self.node.export()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: Json) -> DataSnapshot {
        DataSnapshot::new(
            Path::parse("users").unwrap(),
            Node::from_json(&value).unwrap(),
            OrderBy::Value,
        )
    }

    #[test]
    fn accessors() {
        let snap = snapshot(json!({"ada": {"age": 36}, "alan": {"age": 41}}));
        assert_eq!(snap.key(), Some("users"));
        assert!(snap.exists());
        assert!(snap.has_children());
        assert_eq!(snap.num_children(), 2);
        assert!(snap.has_child("ada/age").unwrap());
        assert!(!snap.has_child("grace").unwrap());
        let age = snap.child("alan/age").unwrap();
        assert_eq!(age.val(), json!(41));
        assert_eq!(age.path().to_string(), "/users/alan/age");
        assert!(snap.child("a.b").is_err());
    }

    #[test]
    fn for_each_follows_order_and_stops_early() {
        let snap = snapshot(json!({"a": 3, "b": 1, "c": 2}));
        let mut seen = Vec::new();
        let stopped = snap.for_each(|child| {
            seen.push(child.key().unwrap().to_string());
            false
        });
        assert!(!stopped);
        assert_eq!(seen, vec!["b", "c", "a"]);

        let mut count = 0;
        let stopped = snap.for_each(|_| {
            count += 1;
            count == 2
        });
        assert!(stopped);
        assert_eq!(count, 2);
    }

    #[test]
    fn nested_iteration_keeps_order() {
        let snap = snapshot(json!({"g": {"x": 9, "y": 1, "z": 5}}));
        let collect = |s: &DataSnapshot| {
            let mut keys = Vec::new();
            s.for_each(|c| {
                keys.push(c.key().unwrap().to_string());
                false
            });
            keys
        };
        assert_eq!(collect(&snap.child("g").unwrap()), vec!["y", "z", "x"]);
        let mut nested = Vec::new();
        snap.for_each(|group| {
            nested = collect(&group);
            false
        });
        assert_eq!(nested, vec!["y", "z", "x"]);
    }

    #[test]
    fn priority_and_export() {
        let snap = snapshot(json!({".value": "x", ".priority": 4}));
        assert_eq!(snap.priority(), json!(4));
        assert_eq!(snap.val(), json!("x"));
        assert_eq!(snap.export_val(), json!({".value": "x", ".priority": 4}));
        assert!(!snapshot(json!(null)).exists());
    }
}
