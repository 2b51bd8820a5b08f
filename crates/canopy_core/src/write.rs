//! Pending local writes.
//!
//! A write is kept in two forms: the [`WriteRecord`] as submitted (the
//! payload still holds server value placeholders, ready for the wire and
//! for persistence) and the resolved [`WriteOp`] applied to the local
//! cache.

use crate::error::{CoreError, CoreResult};
use crate::node::{Node, PRIORITY_KEY, VALUE_KEY};
use crate::path::Path;
use crate::server_values::ServerValues;
use crate::value::Priority;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::fmt;

/// Monotonic identifier of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriteId(pub u64);

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write:{}", self.0)
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Replace the value at the path.
    Set,
    /// Replace several descendants, keyed by relative path.
    Update,
    /// Delete the value at the path.
    Remove,
    /// Replace only the priority at the path.
    SetPriority,
}

/// Lifecycle state of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Applied locally, not yet confirmed.
    Pending,
    /// Confirmed by the server and folded into the server cache.
    Acknowledged,
    /// Rejected or abandoned; removed from the overlay.
    Reverted,
}

/// A write as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    /// Identifier.
    pub id: WriteId,
    /// Target location.
    pub path: Path,
    /// Kind of mutation.
    pub kind: WriteKind,
    /// Set value, update map, priority, or null for removes.
    pub payload: Json,
    /// Hash the server value must match for the write to apply.
    pub expected_hash: Option<String>,
    /// Whether the write is visible in the local overlay.
    pub apply_locally: bool,
}

impl WriteRecord {
    /// Resolves the payload into a cache operation.
    pub fn resolve(&self, values: &ServerValues) -> CoreResult<WriteOp> {
        match self.kind {
            WriteKind::Set => Ok(WriteOp::Overwrite(Node::from_json_with(&self.payload, values)?)),
            WriteKind::Remove => Ok(WriteOp::Overwrite(Node::empty())),
            WriteKind::SetPriority => Ok(WriteOp::Priority(Priority::from_json(&self.payload)?)),
            WriteKind::Update => {
                let Json::Object(map) = &self.payload else {
                    return Err(CoreError::invalid_argument("update payload must be an object"));
                };
                let mut entries: Vec<(Path, Node)> = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let rel = Path::parse(key)?;
                    if rel.is_root() {
                        return Err(CoreError::invalid_argument(format!(
                            "update key {key:?} names no child"
                        )));
                    }
                    if let Some((other, _)) = entries.iter().find(|(p, _)| p.overlaps(&rel)) {
                        return Err(CoreError::invalid_argument(format!(
                            "update keys {other} and {rel} overlap"
                        )));
                    }
                    entries.push((rel, Node::from_json_with(value, values)?));
                }
                Ok(WriteOp::Merge(entries))
            }
        }
    }
}

/// A resolved cache operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the node at the write path.
    Overwrite(Node),
    /// Replace each relative descendant.
    Merge(Vec<(Path, Node)>),
    /// Replace the priority at the write path.
    Priority(Priority),
}

impl WriteOp {
    /// Applies the operation at `path` on top of `base`.
    #[must_use]
    pub fn apply(&self, base: &Node, path: &Path) -> Node {
        match self {
            WriteOp::Overwrite(node) => base.update(path, node.clone()),
            WriteOp::Merge(entries) => entries.iter().fold(base.clone(), |acc, (rel, node)| {
                acc.update(&path.join(rel), node.clone())
            }),
            WriteOp::Priority(priority) => {
                base.update(path, base.get(path).with_priority(priority.clone()))
            }
        }
    }

    /// Absolute locations the operation replaces.
    pub fn affected_paths(&self, path: &Path) -> Vec<Path> {
        match self {
            WriteOp::Merge(entries) => entries.iter().map(|(rel, _)| path.join(rel)).collect(),
            _ => vec![path.clone()],
        }
    }
}

/// A write tracked by the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// The write as submitted.
    pub record: WriteRecord,
    /// The resolved operation.
    pub op: WriteOp,
    /// Lifecycle state.
    pub status: WriteStatus,
}

impl PendingWrite {
    /// Creates a pending write.
    pub fn new(record: WriteRecord, op: WriteOp) -> Self {
        Self {
            record,
            op,
            status: WriteStatus::Pending,
        }
    }

    /// Identifier.
    pub fn id(&self) -> WriteId {
        self.record.id
    }

    /// Target location.
    pub fn path(&self) -> &Path {
        &self.record.path
    }

    /// True when the write contributes to the visible overlay.
    pub fn is_visible(&self) -> bool {
        self.record.apply_locally
    }

    /// True for a set or remove.
    pub fn is_full_write(&self) -> bool {
        matches!(self.op, WriteOp::Overwrite(_))
    }

    /// Locations this write replaces.
    pub fn affected_paths(&self) -> Vec<Path> {
        self.op.affected_paths(&self.record.path)
    }
}

/// Attaches a priority to a set payload, producing the exported form.
pub fn payload_with_priority(value: Json, priority: &Json) -> Json {
    if priority.is_null() {
        return value;
    }
    match value {
        Json::Object(mut map) if !map.contains_key(VALUE_KEY) => {
            if map.is_empty() {
                return Json::Null;
            }
            map.insert(PRIORITY_KEY.to_string(), priority.clone());
            Json::Object(map)
        }
        Json::Null => Json::Null,
        other => {
            let mut map = Map::new();
            map.insert(VALUE_KEY.to_string(), other);
            map.insert(PRIORITY_KEY.to_string(), priority.clone());
            Json::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: WriteKind, path: &str, payload: Json) -> WriteRecord {
        WriteRecord {
            id: WriteId(1),
            path: Path::parse(path).unwrap(),
            kind,
            payload,
            expected_hash: None,
            apply_locally: true,
        }
    }

    fn values() -> ServerValues {
        ServerValues::at(0)
    }

    #[test]
    fn update_keys_may_be_deep() {
        let rec = record(WriteKind::Update, "users", json!({"ada/age": 36, "alan": {"age": 41}}));
        let op = rec.resolve(&values()).unwrap();
        let base = Node::from_json(&json!({"users": {"ada": {"name": "Ada"}}})).unwrap();
        let out = op.apply(&base, &rec.path);
        assert_eq!(
            out.to_json(),
            json!({"users": {"ada": {"name": "Ada", "age": 36}, "alan": {"age": 41}}})
        );
        let affected: Vec<String> = op
            .affected_paths(&rec.path)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(affected, vec!["/users/ada/age", "/users/alan"]);
    }

    #[test]
    fn overlapping_update_keys_rejected() {
        let rec = record(WriteKind::Update, "x", json!({"a": 1, "a/b": 2}));
        assert!(matches!(
            rec.resolve(&values()),
            Err(CoreError::InvalidArgument { .. })
        ));
        let rec = record(WriteKind::Update, "x", json!([1, 2]));
        assert!(rec.resolve(&values()).is_err());
        let rec = record(WriteKind::Update, "x", json!({"a.b": 1}));
        assert!(matches!(
            rec.resolve(&values()),
            Err(CoreError::InvalidPathSegment { .. })
        ));
    }

    #[test]
    fn set_priority_keeps_value() {
        let rec = record(WriteKind::SetPriority, "a", json!(3));
        let base = Node::from_json(&json!({"a": "x"})).unwrap();
        let out = rec.resolve(&values()).unwrap().apply(&base, &rec.path);
        assert_eq!(out.child("a").export(), json!({".value": "x", ".priority": 3}));
    }

    #[test]
    fn remove_clears_subtree() {
        let rec = record(WriteKind::Remove, "a/b", Json::Null);
        let base = Node::from_json(&json!({"a": {"b": 1, "c": 2}})).unwrap();
        let out = rec.resolve(&values()).unwrap().apply(&base, &rec.path);
        assert_eq!(out.to_json(), json!({"a": {"c": 2}}));
    }

    #[test]
    fn priority_payloads() {
        assert_eq!(
            payload_with_priority(json!(5), &json!("p")),
            json!({".value": 5, ".priority": "p"})
        );
        assert_eq!(
            payload_with_priority(json!({"a": 1}), &json!(2)),
            json!({"a": 1, ".priority": 2})
        );
        assert_eq!(payload_with_priority(json!(5), &Json::Null), json!(5));
    }

    #[test]
    fn write_id_display() {
        assert_eq!(WriteId(7).to_string(), "write:7");
    }
}
