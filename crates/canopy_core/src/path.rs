//! Hierarchical node addresses.
//!
//! A [`Path`] is an immutable sequence of keys. The root is the empty
//! sequence. Parsing collapses redundant separators, so `"/a//b/"` and
//! `"a/b"` name the same location.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Maximum length of a single key in bytes.
pub const MAX_KEY_BYTES: usize = 768;

const FORBIDDEN_KEY_CHARS: [char; 5] = ['.', '#', '$', '[', ']'];

/// Validates a single path segment or child key.
pub fn validate_key(segment: &str) -> CoreResult<()> {
    if segment.is_empty() {
        return Err(CoreError::invalid_segment(segment, "empty segment"));
    }
    if segment.contains(SEPARATOR) {
        return Err(CoreError::invalid_segment(
            segment,
            "contains path separator",
        ));
    }
    if segment.contains(FORBIDDEN_KEY_CHARS) {
        return Err(CoreError::invalid_segment(
            segment,
            "contains one of . # $ [ ]",
        ));
    }
    if segment.chars().any(|c| c.is_ascii_control()) {
        return Err(CoreError::invalid_segment(
            segment,
            "contains control character",
        ));
    }
    if segment.len() > MAX_KEY_BYTES {
        return Err(CoreError::invalid_segment(segment, "longer than 768 bytes"));
    }
    Ok(())
}

/// An address in the tree.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Returns the root path.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash separated path string.
    pub fn parse(path: &str) -> CoreResult<Self> {
        let mut segments = Vec::new();
        for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
            validate_key(segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Builds a path from already split segments.
    pub fn from_segments<I, S>(segments: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for segment in segments {
            let segment = segment.into();
            validate_key(&segment)?;
            out.push(segment);
        }
        Ok(Self { segments: out })
    }

    /// Returns the path of the immediate child named `segment`.
    pub fn child(&self, segment: &str) -> CoreResult<Self> {
        validate_key(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Resolves a relative, possibly multi-segment path such as `"a/b/c"`.
    pub fn child_path(&self, relative: &str) -> CoreResult<Self> {
        Ok(self.join(&Self::parse(relative)?))
    }

    /// Appends all segments of `other`.
    #[must_use]
    pub fn join(&self, other: &Path) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + other.segments.len());
        segments.extend(self.segments.iter().cloned());
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Returns the parent path, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Returns the last segment, or `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the first segment, or `None` at the root.
    pub fn front(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Returns the path without its first segment.
    #[must_use]
    pub fn rest(&self) -> Self {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Alias for [`Path::is_root`].
    pub fn is_empty(&self) -> bool {
        self.is_root()
    }

    /// The segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when `self` is a prefix of `other`. A path is its own ancestor.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// True when `self` is a proper prefix of `other`.
    pub fn is_strict_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len() && self.is_ancestor_of(other)
    }

    /// True when one path contains the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Returns `to` relative to `from`, or `None` when `from` is not an
    /// ancestor of `to`.
    pub fn relative(from: &Path, to: &Path) -> Option<Path> {
        if !from.is_ancestor_of(to) {
            return None;
        }
        Some(Self {
            segments: to.segments[from.segments.len()..].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Path::parse(&raw).map_err(serde::de::Error::custom)
    }
}
