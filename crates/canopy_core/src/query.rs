//! Query parameters: ordering, range bounds and limits.

use crate::error::{CoreError, CoreResult};
use crate::index::{Bound, OrderBy};
use crate::node::Node;
use crate::path::Path;
use crate::value::Leaf;
use serde_json::Value as Json;
use std::fmt;

/// Bounds the number of children in a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// The first `n` children under the active ordering.
    First(usize),
    /// The last `n` children under the active ordering.
    Last(usize),
}

/// Ordering, range and limit applied to the children of a location.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryParams {
    order_by: Option<OrderBy>,
    start: Option<Bound>,
    end: Option<Bound>,
    limit: Option<Limit>,
}

impl QueryParams {
    /// Parameters selecting every child in default order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ordering. Fails if an ordering is already set or an
    /// existing bound is incompatible with it.
    pub fn with_order_by(mut self, order_by: OrderBy) -> CoreResult<Self> {
        if self.order_by.is_some() {
            return Err(CoreError::invalid_argument("ordering already set"));
        }
        for bound in self.start.iter().chain(self.end.iter()) {
            validate_bound(&order_by, bound)?;
        }
        self.order_by = Some(order_by);
        Ok(self)
    }

    /// Sets the inclusive lower bound.
    pub fn with_start_at(mut self, value: Option<Leaf>, key: Option<String>) -> CoreResult<Self> {
        if self.start.is_some() {
            return Err(CoreError::invalid_argument("start bound already set"));
        }
        let bound = Bound::new(value, key);
        validate_bound(&self.order(), &bound)?;
        self.start = Some(bound);
        Ok(self)
    }

    /// Sets the inclusive upper bound.
    pub fn with_end_at(mut self, value: Option<Leaf>, key: Option<String>) -> CoreResult<Self> {
        if self.end.is_some() {
            return Err(CoreError::invalid_argument("end bound already set"));
        }
        let bound = Bound::new(value, key);
        validate_bound(&self.order(), &bound)?;
        self.end = Some(bound);
        Ok(self)
    }

    /// Sets both bounds to the same point.
    pub fn with_equal_to(self, value: Option<Leaf>, key: Option<String>) -> CoreResult<Self> {
        if self.start.is_some() || self.end.is_some() {
            return Err(CoreError::invalid_argument(
                "equal_to cannot be combined with start_at or end_at",
            ));
        }
        self.with_start_at(value.clone(), key.clone())?
            .with_end_at(value, key)
    }

    /// Sets the limit.
    pub fn with_limit(mut self, limit: Limit) -> CoreResult<Self> {
        if self.limit.is_some() {
            return Err(CoreError::invalid_argument("limit already set"));
        }
        let n = match limit {
            Limit::First(n) | Limit::Last(n) => n,
        };
        if n == 0 {
            return Err(CoreError::invalid_argument("limit must be a positive integer"));
        }
        self.limit = Some(limit);
        Ok(self)
    }

    /// The active ordering.
    pub fn order(&self) -> OrderBy {
        self.order_by.clone().unwrap_or_default()
    }

    /// The limit, if any.
    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }

    /// True when an ordering was chosen explicitly.
    pub fn has_explicit_order(&self) -> bool {
        self.order_by.is_some()
    }

    /// True when no bound or limit filters children out.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    /// True when no parameter was set at all.
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.order_by.is_none()
    }

    /// Canonical string identifying these parameters.
    pub fn identifier(&self) -> String {
        if self.is_default() {
            return "default".to_string();
        }
        let mut parts = vec![format!("o={}", self.order())];
        if let Some(bound) = &self.start {
            parts.push(format!("s={}", bound_identifier(bound)));
        }
        if let Some(bound) = &self.end {
            parts.push(format!("e={}", bound_identifier(bound)));
        }
        match self.limit {
            Some(Limit::First(n)) => parts.push(format!("lf={n}")),
            Some(Limit::Last(n)) => parts.push(format!("ll={n}")),
            None => {}
        }
        parts.join("&")
    }

    /// True when `(key, node)` lies within the range bounds.
    pub fn matches(&self, key: &str, node: &Node) -> bool {
        let order = self.order();
        let after_start = self
            .start
            .as_ref()
            .map_or(true, |b| order.compare_to_bound(key, node, b).is_ge());
        let before_end = self
            .end
            .as_ref()
            .map_or(true, |b| order.compare_to_bound(key, node, b).is_le());
        after_start && before_end
    }

    /// Children of `node` selected by these parameters, in query order.
    pub fn view(&self, node: &Node) -> Vec<(String, Node)> {
        let mut children = self.order().sorted_children(node);
        if self.start.is_some() || self.end.is_some() {
            children.retain(|(k, v)| self.matches(k, v));
        }
        match self.limit {
            Some(Limit::First(n)) => children.truncate(n),
            Some(Limit::Last(n)) if children.len() > n => {
                children.drain(..children.len() - n);
            }
            _ => {}
        }
        children
    }

    /// `node` restricted to the children selected by these parameters.
    pub fn filtered_node(&self, node: &Node) -> Node {
        if self.loads_all_data() {
            return node.clone();
        }
        Node::from_valid_children(self.view(node), node.priority().clone())
    }
}

fn bound_identifier(bound: &Bound) -> String {
    let value = bound.value.as_ref().map_or(Json::Null, Leaf::to_json);
    match &bound.key {
        Some(key) => format!("{value}:{key}"),
        None => value.to_string(),
    }
}

fn validate_bound(order: &OrderBy, bound: &Bound) -> CoreResult<()> {
    match order {
        OrderBy::Key => {
            if bound.key.is_some() {
                return Err(CoreError::invalid_argument(
                    "order_by_key bounds take no key argument",
                ));
            }
            if !matches!(bound.value, Some(Leaf::String(_))) {
                return Err(CoreError::invalid_argument(
                    "order_by_key bounds must be strings",
                ));
            }
        }
        OrderBy::Priority => {
            if matches!(bound.value, Some(Leaf::Bool(_))) {
                return Err(CoreError::invalid_argument(
                    "priority bounds must be a string, number or null",
                ));
            }
        }
        OrderBy::Value | OrderBy::Child(_) => {}
    }
    Ok(())
}

/// A location plus query parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Location being queried.
    pub path: Path,
    /// Filtering and ordering.
    pub params: QueryParams,
}

impl QuerySpec {
    /// Creates a spec.
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    /// Unfiltered query at `path`.
    pub fn default_at(path: Path) -> Self {
        Self::new(path, QueryParams::default())
    }

    /// Unique key for view bookkeeping.
    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.path.clone(), self.params.identifier())
    }
}

/// Identity of a query: its location plus the canonical parameter string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey {
    /// Location being queried.
    pub path: Path,
    /// Canonical form of the parameters.
    pub identifier: String,
}

impl QueryKey {
    /// Creates a key.
    pub fn new(path: Path, identifier: impl Into<String>) -> Self {
        Self {
            path,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.identifier)
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.params.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: Json) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn keys(view: &[(String, Node)]) -> Vec<&str> {
        view.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn num(n: f64) -> Option<Leaf> {
        Some(Leaf::Number(n))
    }

    fn scores() -> Node {
        node(json!({"a": 5, "b": 1, "c": 3, "d": 3, "e": 9}))
    }

    #[test]
    fn rejects_duplicate_settings() {
        let q = QueryParams::new().with_order_by(OrderBy::Key).unwrap();
        assert!(q.clone().with_order_by(OrderBy::Value).is_err());

        let q = QueryParams::new().with_limit(Limit::First(2)).unwrap();
        assert!(q.with_limit(Limit::Last(1)).is_err());
        assert!(QueryParams::new().with_limit(Limit::First(0)).is_err());

        let q = QueryParams::new().with_start_at(num(1.0), None).unwrap();
        assert!(q.clone().with_start_at(num(2.0), None).is_err());
        assert!(q.with_equal_to(num(2.0), None).is_err());
    }

    #[test]
    fn key_ordering_restrictions() {
        let q = QueryParams::new().with_order_by(OrderBy::Key).unwrap();
        assert!(q.clone().with_start_at(num(1.0), None).is_err());
        assert!(q
            .clone()
            .with_start_at(Some(Leaf::String("a".into())), Some("k".into()))
            .is_err());
        assert!(q.with_start_at(Some(Leaf::String("a".into())), None).is_ok());

        let q = QueryParams::new()
            .with_start_at(Some(Leaf::Bool(true)), None)
            .unwrap_err();
        assert!(q.is_validation());

        let bounded = QueryParams::new().with_start_at(num(1.0), None).unwrap();
        assert!(bounded.with_order_by(OrderBy::Key).is_err());
    }

    #[test]
    fn limit_to_first_and_last() {
        let base = QueryParams::new().with_order_by(OrderBy::Value).unwrap();
        let first = base.clone().with_limit(Limit::First(2)).unwrap();
        assert_eq!(keys(&first.view(&scores())), vec!["b", "c"]);
        let last = base.with_limit(Limit::Last(2)).unwrap();
        assert_eq!(keys(&last.view(&scores())), vec!["a", "e"]);
    }

    #[test]
    fn range_then_limit() {
        let q = QueryParams::new()
            .with_order_by(OrderBy::Value)
            .unwrap()
            .with_start_at(num(3.0), None)
            .unwrap()
            .with_limit(Limit::First(10))
            .unwrap();
        assert_eq!(keys(&q.view(&scores())), vec!["c", "d", "a", "e"]);
    }

    #[test]
    fn key_tie_breaker_at_boundary() {
        let q = QueryParams::new()
            .with_order_by(OrderBy::Value)
            .unwrap()
            .with_start_at(num(3.0), Some("d".into()))
            .unwrap()
            .with_end_at(num(5.0), None)
            .unwrap();
        assert_eq!(keys(&q.view(&scores())), vec!["d", "a"]);
    }

    #[test]
    fn equal_to_selects_matches() {
        let q = QueryParams::new()
            .with_order_by(OrderBy::Value)
            .unwrap()
            .with_equal_to(num(3.0), None)
            .unwrap();
        assert_eq!(keys(&q.view(&scores())), vec!["c", "d"]);
    }

    #[test]
    fn filtered_node_drops_leaves() {
        let q = QueryParams::new().with_limit(Limit::First(1)).unwrap();
        assert!(q.filtered_node(&node(json!(5))).is_empty());
        assert_eq!(q.filtered_node(&scores()).num_children(), 1);
    }

    #[test]
    fn identifiers_are_canonical() {
        assert_eq!(QueryParams::new().identifier(), "default");
        let q = QueryParams::new()
            .with_order_by(OrderBy::Child(Path::parse("age").unwrap()))
            .unwrap()
            .with_start_at(num(3.0), Some("k".into()))
            .unwrap()
            .with_limit(Limit::Last(4))
            .unwrap();
        assert_eq!(q.identifier(), "o=/age&s=3:k&ll=4");
        let spec = QuerySpec::new(Path::parse("users").unwrap(), q);
        assert_eq!(spec.key().identifier, "o=/age&s=3:k&ll=4");
        assert_eq!(spec.key().to_string(), "/users (o=/age&s=3:k&ll=4)");
    }

    #[test]
    fn keys_keep_separator_characters_in_paths() {
        let a = QuerySpec::default_at(Path::parse("a|b").unwrap()).key();
        let b = QueryKey::new(Path::parse("a").unwrap(), "b|default");
        assert_ne!(a, b);
        assert_eq!(a.path.key(), Some("a|b"));
    }
}
