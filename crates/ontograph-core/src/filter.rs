//! Structured predicate tree for schema-aware queries.
//!
//! Paths address JSON field payloads: `$.field.sub` on the row itself,
//! `left.$.field` / `right.$.field` on relation endpoints. Backends lower
//! the tree to their query form; [`Filter::matches`] evaluates direct
//! predicates in memory for backends without a SQL engine.

use serde_json::{Map, Value};

use crate::error::{OntoError, Result};

fn valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_segments(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Err(OntoError::Filter("path must not be empty".to_string()));
    }
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    for segment in &segments {
        if !valid_segment(segment) {
            return Err(OntoError::Filter(format!(
                "invalid path segment '{segment}': must match [A-Za-z_][A-Za-z0-9_]*"
            )));
        }
    }
    Ok(segments)
}

/// Which payload a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// The row's own field payload (`$.`).
    Direct,
    /// The left endpoint entity (`left.$.`).
    Left,
    /// The right endpoint entity (`right.$.`).
    Right,
}

/// A validated dotted field path with its root prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub root: PathRoot,
    pub segments: Vec<String>,
}

impl FieldPath {
    /// Parse `$.a.b`, `left.$.a` or `right.$.a`.
    pub fn parse(path: &str) -> Result<Self> {
        let (root, rest) = if let Some(rest) = path.strip_prefix("left.$.") {
            (PathRoot::Left, rest)
        } else if let Some(rest) = path.strip_prefix("right.$.") {
            (PathRoot::Right, rest)
        } else if let Some(rest) = path.strip_prefix("$.") {
            (PathRoot::Direct, rest)
        } else {
            return Err(OntoError::Filter(format!("invalid field path: {path}")));
        };
        Ok(FieldPath { root, segments: validate_segments(rest)? })
    }

    pub fn direct(field: &str) -> Result<Self> {
        Ok(FieldPath { root: PathRoot::Direct, segments: validate_segments(field)? })
    }

    pub fn left(field: &str) -> Result<Self> {
        Ok(FieldPath { root: PathRoot::Left, segments: validate_segments(field)? })
    }

    pub fn right(field: &str) -> Result<Self> {
        Ok(FieldPath { root: PathRoot::Right, segments: validate_segments(field)? })
    }

    /// Dotted path without the root prefix.
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// SQLite `json_extract` path (`$.a.b`).
    pub fn json_path(&self) -> String {
        format!("$.{}", self.dotted())
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.root {
            PathRoot::Direct => write!(f, "$.{}", self.dotted()),
            PathRoot::Left => write!(f, "left.$.{}", self.dotted()),
            PathRoot::Right => write!(f, "right.$.{}", self.dotted()),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    In,
    IsNull,
    IsNotNull,
}

/// Structured predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `path op value`. `value` is `None` for the null checks.
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Option<Value>,
    },
    /// Existential predicate over a list-of-record field: at least one
    /// element whose `item_path` satisfies `op value`. Not allowed on
    /// endpoint paths.
    Exists {
        list_path: FieldPath,
        item_path: String,
        op: CompareOp,
        value: Option<Value>,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        Filter::And(vec![self, other])
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(vec![self, other])
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Whether any predicate in the tree addresses the given root.
    pub fn references(&self, root: PathRoot) -> bool {
        match self {
            Filter::Compare { path, .. } => path.root == root,
            Filter::Exists { list_path, .. } => list_path.root == root,
            Filter::And(children) | Filter::Or(children) => {
                children.iter().any(|c| c.references(root))
            }
            Filter::Not(child) => child.references(root),
        }
    }

    /// Extract the sub-tree addressing a specific root, dropping all other
    /// predicates. Used to attach endpoint predicates to their existence
    /// subqueries.
    pub fn extract(&self, root: PathRoot) -> Option<Filter> {
        match self {
            Filter::Compare { path, .. } => (path.root == root).then(|| self.clone()),
            Filter::Exists { list_path, .. } => (list_path.root == root).then(|| self.clone()),
            Filter::Not(child) => child
                .extract(root)
                .map(|c| Filter::Not(Box::new(c))),
            Filter::And(children) | Filter::Or(children) => {
                let mut extracted: Vec<Filter> =
                    children.iter().filter_map(|c| c.extract(root)).collect();
                match extracted.len() {
                    0 => None,
                    1 => extracted.pop(),
                    _ => Some(match self {
                        Filter::And(_) => Filter::And(extracted),
                        _ => Filter::Or(extracted),
                    }),
                }
            }
        }
    }

    /// Evaluate direct predicates against a field payload. Endpoint
    /// predicates evaluate to `true`; callers resolve those separately.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        match self {
            Filter::Compare { path, op, value } => {
                if path.root != PathRoot::Direct {
                    return true;
                }
                let resolved = resolve_path(fields, &path.segments);
                compare_values(resolved, *op, value.as_ref())
            }
            Filter::Exists { list_path, item_path, op, value } => {
                if list_path.root != PathRoot::Direct {
                    return true;
                }
                let Some(Value::Array(items)) = resolve_path(fields, &list_path.segments) else {
                    return false;
                };
                let item_segments: Vec<String> =
                    item_path.split('.').map(str::to_string).collect();
                items.iter().any(|item| {
                    let item_value = match item {
                        Value::Object(map) => resolve_path(map, &item_segments),
                        other => Some(other),
                    };
                    compare_values(item_value, *op, value.as_ref())
                })
            }
            Filter::And(children) => children.iter().all(|c| c.matches(fields)),
            Filter::Or(children) => children.iter().any(|c| c.matches(fields)),
            Filter::Not(child) => !child.matches(fields),
        }
    }

    /// Evaluate against a payload plus resolved endpoint payloads.
    pub fn matches_with_endpoints(
        &self,
        fields: &Map<String, Value>,
        left: Option<&Map<String, Value>>,
        right: Option<&Map<String, Value>>,
    ) -> bool {
        match self {
            Filter::Compare { path, op, value } => {
                let target = match path.root {
                    PathRoot::Direct => Some(fields),
                    PathRoot::Left => left,
                    PathRoot::Right => right,
                };
                let Some(target) = target else { return false };
                compare_values(resolve_path(target, &path.segments), *op, value.as_ref())
            }
            Filter::Exists { .. } => self.matches(fields),
            Filter::And(children) => children
                .iter()
                .all(|c| c.matches_with_endpoints(fields, left, right)),
            Filter::Or(children) => children
                .iter()
                .any(|c| c.matches_with_endpoints(fields, left, right)),
            Filter::Not(child) => !child.matches_with_endpoints(fields, left, right),
        }
    }
}

/// Resolve a dotted path against a JSON object, `None` on missing keys.
pub fn resolve_path<'a>(map: &'a Map<String, Value>, segments: &[String]) -> Option<&'a Value> {
    let mut current: &Value = map.get(segments.first()?)?;
    for segment in &segments[1..] {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn json_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn like_match(value: &Value, pattern: &str) -> bool {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => return false,
        other => other.to_string(),
    };
    let starts = pattern.starts_with('%');
    let ends = pattern.ends_with('%');
    match (starts, ends) {
        (true, true) if pattern.len() >= 2 => text.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => text.ends_with(&pattern[1..]),
        (false, true) => text.starts_with(&pattern[..pattern.len() - 1]),
        _ => text == pattern,
    }
}

/// Compare a resolved value against an operator and right-hand side.
pub fn compare_values(value: Option<&Value>, op: CompareOp, rhs: Option<&Value>) -> bool {
    let value = value.filter(|v| !v.is_null());
    match op {
        CompareOp::IsNull => value.is_none(),
        CompareOp::IsNotNull => value.is_some(),
        CompareOp::Eq => match (value, rhs) {
            (Some(v), Some(r)) => v == r,
            _ => false,
        },
        CompareOp::Ne => match (value, rhs) {
            (Some(v), Some(r)) => v != r,
            _ => false,
        },
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let (Some(v), Some(r)) = (value, rhs) else { return false };
            let Some(ord) = json_cmp(v, r) else { return false };
            match op {
                CompareOp::Gt => ord.is_gt(),
                CompareOp::Ge => ord.is_ge(),
                CompareOp::Lt => ord.is_lt(),
                CompareOp::Le => ord.is_le(),
                _ => unreachable!(),
            }
        }
        CompareOp::Like => {
            let (Some(v), Some(Value::String(p))) = (value, rhs) else { return false };
            like_match(v, p)
        }
        CompareOp::In => {
            let (Some(v), Some(Value::Array(items))) = (value, rhs) else { return false };
            items.contains(v)
        }
    }
}

/// Reference to a field for building predicates: `field("age").gt(30)`.
#[derive(Debug, Clone)]
pub struct FieldRef {
    path: FieldPath,
}

/// Predicate builder on a direct field.
pub fn field(name: &str) -> FieldRef {
    FieldRef {
        path: FieldPath::direct(name).unwrap_or_else(|_| FieldPath {
            root: PathRoot::Direct,
            segments: vec![name.to_string()],
        }),
    }
}

/// Predicate builder on the left endpoint of a relation.
pub fn left_field(name: &str) -> FieldRef {
    FieldRef {
        path: FieldPath::left(name).unwrap_or_else(|_| FieldPath {
            root: PathRoot::Left,
            segments: vec![name.to_string()],
        }),
    }
}

/// Predicate builder on the right endpoint of a relation.
pub fn right_field(name: &str) -> FieldRef {
    FieldRef {
        path: FieldPath::right(name).unwrap_or_else(|_| FieldPath {
            root: PathRoot::Right,
            segments: vec![name.to_string()],
        }),
    }
}

impl FieldRef {
    fn compare(self, op: CompareOp, value: Option<Value>) -> Filter {
        Filter::Compare { path: self.path, op, value }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Eq, Some(value.into()))
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Ne, Some(value.into()))
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Gt, Some(value.into()))
    }

    pub fn ge(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Ge, Some(value.into()))
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Lt, Some(value.into()))
    }

    pub fn le(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Le, Some(value.into()))
    }

    pub fn like(self, pattern: impl Into<String>) -> Filter {
        self.compare(CompareOp::Like, Some(Value::String(pattern.into())))
    }

    pub fn starts_with(self, prefix: &str) -> Filter {
        self.like(format!("{prefix}%"))
    }

    pub fn ends_with(self, suffix: &str) -> Filter {
        self.like(format!("%{suffix}"))
    }

    pub fn contains(self, substring: &str) -> Filter {
        self.like(format!("%{substring}%"))
    }

    pub fn in_values(self, values: impl IntoIterator<Item = Value>) -> Filter {
        self.compare(CompareOp::In, Some(Value::Array(values.into_iter().collect())))
    }

    pub fn is_null(self) -> Filter {
        self.compare(CompareOp::IsNull, None)
    }

    pub fn is_not_null(self) -> Filter {
        self.compare(CompareOp::IsNotNull, None)
    }

    /// Navigate into a nested record field.
    pub fn path(mut self, sub_path: &str) -> Result<FieldRef> {
        self.path.segments.extend(validate_segments(sub_path)?);
        Ok(self)
    }

    /// Existential predicate builder over a list-of-record field.
    /// Rejected on endpoint paths.
    pub fn any_path(self, item_path: &str) -> Result<AnyPathRef> {
        if self.path.root != PathRoot::Direct {
            return Err(OntoError::Filter(
                "existential predicates are not supported on endpoint paths".to_string(),
            ));
        }
        validate_segments(item_path)?;
        Ok(AnyPathRef { list_path: self.path, item_path: item_path.to_string() })
    }
}

/// Builder for existential predicates: `field("events").any_path("kind")?.eq("click")`.
#[derive(Debug, Clone)]
pub struct AnyPathRef {
    list_path: FieldPath,
    item_path: String,
}

impl AnyPathRef {
    fn compare(self, op: CompareOp, value: Option<Value>) -> Filter {
        Filter::Exists {
            list_path: self.list_path,
            item_path: self.item_path,
            op,
            value,
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Eq, Some(value.into()))
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Ne, Some(value.into()))
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Gt, Some(value.into()))
    }

    pub fn ge(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Ge, Some(value.into()))
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Lt, Some(value.into()))
    }

    pub fn le(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Le, Some(value.into()))
    }

    pub fn like(self, pattern: impl Into<String>) -> Filter {
        self.compare(CompareOp::Like, Some(Value::String(pattern.into())))
    }

    pub fn in_values(self, values: impl IntoIterator<Item = Value>) -> Filter {
        self.compare(CompareOp::In, Some(Value::Array(values.into_iter().collect())))
    }

    pub fn is_null(self) -> Filter {
        self.compare(CompareOp::IsNull, None)
    }

    pub fn is_not_null(self) -> Filter {
        self.compare(CompareOp::IsNotNull, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        serde_json::from_value(json!({
            "name": "Alice",
            "age": 30,
            "tier": "Gold",
            "profile": {"city": "Berlin"},
            "events": [{"kind": "click", "count": 3}, {"kind": "view", "count": 9}],
            "nickname": null,
        }))
        .unwrap()
    }

    #[test]
    fn parse_prefixes() {
        assert_eq!(FieldPath::parse("$.a.b").unwrap().root, PathRoot::Direct);
        assert_eq!(FieldPath::parse("left.$.tier").unwrap().root, PathRoot::Left);
        assert_eq!(FieldPath::parse("right.$.price").unwrap().root, PathRoot::Right);
        assert!(FieldPath::parse("a.b").is_err());
        assert!(FieldPath::parse("$.bad-segment").is_err());
    }

    #[test]
    fn compare_matching() {
        let p = payload();
        assert!(field("age").gt(29).matches(&p));
        assert!(!field("age").gt(30).matches(&p));
        assert!(field("age").ge(30).matches(&p));
        assert!(field("name").eq("Alice").matches(&p));
        assert!(field("name").starts_with("Al").matches(&p));
        assert!(field("name").contains("lic").matches(&p));
        assert!(field("tier").in_values([json!("Gold"), json!("Silver")]).matches(&p));
        assert!(field("nickname").is_null().matches(&p));
        assert!(field("missing").is_null().matches(&p));
        assert!(field("name").is_not_null().matches(&p));
    }

    #[test]
    fn nested_paths() {
        let p = payload();
        assert!(field("profile").path("city").unwrap().eq("Berlin").matches(&p));
        assert!(!field("profile").path("country").unwrap().is_not_null().matches(&p));
    }

    #[test]
    fn logical_combinators() {
        let p = payload();
        let f = field("age").ge(18).and(field("tier").eq("Gold"));
        assert!(f.matches(&p));
        let g = field("age").lt(18).or(field("tier").eq("Gold"));
        assert!(g.matches(&p));
        assert!(!field("tier").eq("Gold").not().matches(&p));
    }

    #[test]
    fn existential_predicates() {
        let p = payload();
        let f = field("events").any_path("kind").unwrap().eq("click");
        assert!(f.matches(&p));
        let g = field("events").any_path("count").unwrap().gt(10);
        assert!(!g.matches(&p));
    }

    #[test]
    fn existential_rejected_on_endpoints() {
        assert!(left_field("events").any_path("kind").is_err());
    }

    #[test]
    fn extract_splits_by_root() {
        let f = field("weight")
            .gt(1)
            .and(left_field("tier").eq("Gold"))
            .and(right_field("price").lt(100));
        let direct = f.extract(PathRoot::Direct).unwrap();
        assert!(matches!(direct, Filter::Compare { .. }));
        assert!(f.extract(PathRoot::Left).is_some());
        assert!(f.extract(PathRoot::Right).is_some());
        assert!(f.references(PathRoot::Left));
        assert!(field("a").eq(1).extract(PathRoot::Left).is_none());
    }

    #[test]
    fn endpoint_evaluation() {
        let p = payload();
        let left: Map<String, Value> = serde_json::from_value(json!({"tier": "Gold"})).unwrap();
        let f = left_field("tier").eq("Gold");
        assert!(f.matches_with_endpoints(&p, Some(&left), None));
        assert!(!f.matches_with_endpoints(&p, None, None));
    }
}
