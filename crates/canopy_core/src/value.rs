//! Scalar values and priorities.
//!
//! [`Leaf`] is the tagged union stored at leaf nodes. Objects are not a
//! leaf variant; they are represented by a node's children.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::fmt;

/// Largest integer a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A scalar stored at a leaf node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Leaf {
    /// Boolean value.
    Bool(bool),
    /// Numeric value. All numbers are doubles.
    Number(f64),
    /// Text value.
    String(String),
}

impl Leaf {
    /// Converts a JSON scalar. Returns `None` for null, arrays and objects.
    pub fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::Bool(b) => Some(Leaf::Bool(*b)),
            Json::Number(n) => n.as_f64().map(Leaf::Number),
            Json::String(s) => Some(Leaf::String(s.clone())),
            _ => None,
        }
    }

    /// Converts back to JSON.
    pub fn to_json(&self) -> Json {
        match self {
            Leaf::Bool(b) => Json::Bool(*b),
            Leaf::Number(n) => number_to_json(*n),
            Leaf::String(s) => Json::String(s.clone()),
        }
    }

    /// Rank of the variant in value ordering: booleans, numbers, strings.
    fn rank(&self) -> u8 {
        match self {
            Leaf::Bool(_) => 0,
            Leaf::Number(_) => 1,
            Leaf::String(_) => 2,
        }
    }

    /// Total ordering used by value based queries.
    pub fn compare(&self, other: &Leaf) -> Ordering {
        match (self, other) {
            (Leaf::Bool(a), Leaf::Bool(b)) => a.cmp(b),
            (Leaf::Number(a), Leaf::Number(b)) => a.total_cmp(b),
            (Leaf::String(a), Leaf::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Stable textual form fed into node hashes.
    pub(crate) fn hash_repr(&self) -> String {
        match self {
            Leaf::Bool(b) => format!("boolean:{b}"),
            Leaf::Number(n) => format!("number:{:016x}", n.to_bits()),
            Leaf::String(s) => format!("string:{s}"),
        }
    }
}

impl fmt::Display for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Converts a double to JSON, preferring an integer form when exact.
pub(crate) fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Json::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

/// Sibling ordering hint attached to a node.
///
/// Ordered `None < Number < String`; numbers compare numerically and
/// strings lexicographically.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Priority {
    /// No priority.
    #[default]
    None,
    /// Numeric priority.
    Number(f64),
    /// Text priority.
    String(String),
}

impl Priority {
    /// Parses a JSON priority.
    pub fn from_json(value: &Json) -> CoreResult<Self> {
        match value {
            Json::Null => Ok(Priority::None),
            Json::Number(n) => n
                .as_f64()
                .map(Priority::Number)
                .ok_or_else(|| CoreError::invalid_argument("priority is not a finite number")),
            Json::String(s) => Ok(Priority::String(s.clone())),
            other => Err(CoreError::invalid_argument(format!(
                "priority must be a string, number or null, got {other}"
            ))),
        }
    }

    /// Converts a query bound into a priority.
    pub fn from_leaf(leaf: Option<&Leaf>) -> CoreResult<Self> {
        match leaf {
            None => Ok(Priority::None),
            Some(Leaf::Number(n)) => Ok(Priority::Number(*n)),
            Some(Leaf::String(s)) => Ok(Priority::String(s.clone())),
            Some(Leaf::Bool(_)) => Err(CoreError::invalid_argument(
                "priority bounds must be a string, number or null",
            )),
        }
    }

    /// Converts to JSON.
    pub fn to_json(&self) -> Json {
        match self {
            Priority::None => Json::Null,
            Priority::Number(n) => number_to_json(*n),
            Priority::String(s) => Json::String(s.clone()),
        }
    }

    /// True when no priority is set.
    pub fn is_none(&self) -> bool {
        matches!(self, Priority::None)
    }

    fn rank(&self) -> u8 {
        match self {
            Priority::None => 0,
            Priority::Number(_) => 1,
            Priority::String(_) => 2,
        }
    }

    /// Total ordering of priorities.
    pub fn compare(&self, other: &Priority) -> Ordering {
        match (self, other) {
            (Priority::Number(a), Priority::Number(b)) => a.total_cmp(b),
            (Priority::String(a), Priority::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub(crate) fn hash_repr(&self) -> Option<String> {
        match self {
            Priority::None => None,
            Priority::Number(n) => Some(format!("number:{:016x}", n.to_bits())),
            Priority::String(s) => Some(format!("string:{s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn leaf_from_json() {
        assert_eq!(Leaf::from_json(&json!(true)), Some(Leaf::Bool(true)));
        assert_eq!(Leaf::from_json(&json!(3)), Some(Leaf::Number(3.0)));
        assert_eq!(Leaf::from_json(&json!("x")), Some(Leaf::String("x".into())));
        assert_eq!(Leaf::from_json(&json!(null)), None);
        assert_eq!(Leaf::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn numbers_round_trip_as_integers_when_exact() {
        assert_eq!(Leaf::Number(3.0).to_json(), json!(3));
        assert_eq!(Leaf::Number(-2.5).to_json(), json!(-2.5));
    }

    #[test]
    fn leaf_ordering() {
        let f = Leaf::Bool(false);
        let t = Leaf::Bool(true);
        let n = Leaf::Number(-10.0);
        let s = Leaf::String("a".into());
        assert_eq!(f.compare(&t), Ordering::Less);
        assert_eq!(t.compare(&n), Ordering::Less);
        assert_eq!(n.compare(&s), Ordering::Less);
        assert_eq!(Leaf::Number(2.0).compare(&Leaf::Number(10.0)), Ordering::Less);
    }

    #[test]
    fn priority_ordering() {
        let none = Priority::None;
        let low = Priority::Number(1.0);
        let high = Priority::Number(20.0);
        let text = Priority::String("a".into());
        assert_eq!(none.compare(&low), Ordering::Less);
        assert_eq!(low.compare(&high), Ordering::Less);
        assert_eq!(high.compare(&text), Ordering::Less);
        assert_eq!(text.compare(&text.clone()), Ordering::Equal);
    }

    #[test]
    fn priority_parsing() {
        assert_eq!(Priority::from_json(&json!(null)).unwrap(), Priority::None);
        assert_eq!(
            Priority::from_json(&json!(5)).unwrap(),
            Priority::Number(5.0)
        );
        assert!(Priority::from_json(&json!(true)).is_err());
        assert!(Priority::from_leaf(Some(&Leaf::Bool(true))).is_err());
    }
}
