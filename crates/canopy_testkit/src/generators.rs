//! Property-based test generators using proptest.
//!
//! Strategies produce keys, paths and values the tree accepts, plus
//! random write operations for convergence tests.

use canopy_core::WriteKind;
use proptest::prelude::*;
use serde_json::{Map, Value as Json};

/// Strategy for valid child keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,7}").expect("Invalid regex")
}

/// Strategy for keys from a small alphabet, so operations collide often.
pub fn hot_key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string)
}

/// Strategy for slash-separated paths of one to `depth` hot keys.
pub fn path_strategy(depth: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(hot_key_strategy(), 1..=depth.max(1)).prop_map(|keys| keys.join("/"))
}

/// Strategy for leaf values. Numbers stay integral so exported values
/// compare exactly.
pub fn leaf_strategy() -> impl Strategy<Value = Json> {
    prop_oneof![
        any::<bool>().prop_map(Json::Bool),
        (-1000i64..1000).prop_map(Json::from),
        "[a-z]{0,6}".prop_map(Json::String),
    ]
}

/// Strategy for whole values: null, leaves, or nested objects.
pub fn value_strategy() -> impl Strategy<Value = Json> {
    let leaf = prop_oneof![1 => Just(Json::Null), 6 => leaf_strategy()];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map(hot_key_strategy(), inner, 1..4)
            .prop_map(|children| Json::Object(children.into_iter().collect::<Map<_, _>>()))
    })
}

/// A random write against the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeOp {
    /// Replace the value at `path`.
    Set {
        /// Target path.
        path: String,
        /// New value.
        value: Json,
    },
    /// Merge children under `path`.
    Update {
        /// Target path.
        path: String,
        /// Child key to value.
        values: Json,
    },
    /// Delete the value at `path`.
    Remove {
        /// Target path.
        path: String,
    },
}

impl TreeOp {
    /// Target path.
    pub fn path(&self) -> &str {
        match self {
            TreeOp::Set { path, .. } | TreeOp::Update { path, .. } | TreeOp::Remove { path } => {
                path
            }
        }
    }

    /// Write kind and payload, as submitted through a reference.
    pub fn into_write(self) -> (String, WriteKind, Json) {
        match self {
            TreeOp::Set { path, value } => (path, WriteKind::Set, value),
            TreeOp::Update { path, values } => (path, WriteKind::Update, values),
            TreeOp::Remove { path } => (path, WriteKind::Remove, Json::Null),
        }
    }
}

/// Strategy for random writes at most `depth` levels deep.
pub fn tree_op_strategy(depth: usize) -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        4 => (path_strategy(depth), value_strategy())
            .prop_map(|(path, value)| TreeOp::Set { path, value }),
        2 => (
            path_strategy(depth),
            prop::collection::btree_map(hot_key_strategy(), value_strategy(), 1..4),
        )
            .prop_map(|(path, values)| TreeOp::Update {
                path,
                values: Json::Object(values.into_iter().collect()),
            }),
        1 => path_strategy(depth).prop_map(|path| TreeOp::Remove { path }),
    ]
}

/// Configuration for property-based tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
