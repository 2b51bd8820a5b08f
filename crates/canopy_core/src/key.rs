//! Child key ordering.
//!
//! Keys that look like 32-bit integers sort first, numerically. All other
//! keys follow in lexicographic order.

use std::cmp::Ordering;
use std::fmt;

/// Parses a key in canonical 32-bit integer form (`"0"`, `"17"`, `"-3"`).
pub fn parse_int_key(key: &str) -> Option<i32> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if key == "-0" {
        return None;
    }
    key.parse::<i32>().ok()
}

/// Compares two child keys.
pub fn key_compare(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    match (parse_int_key(a), parse_int_key(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// A child key ordered by [`key_compare`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChildKey(String);

impl ChildKey {
    /// Wraps a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Array index form of this key, if it is a non-negative integer.
    pub fn array_index(&self) -> Option<usize> {
        parse_int_key(&self.0)
            .filter(|n| *n >= 0)
            .map(|n| n as usize)
    }
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        key_compare(&self.0, &other.0)
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
