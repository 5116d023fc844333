//! # vg-query: The "Lens" of VIGIL
//!
//! Filter DSL for reading the audit trail. Raw query args are parsed once
//! into a canonical [`PredicateGroup`] tree ([`parser`]) and then compiled
//! into a join fragment plus a parameterized where fragment ([`compiler`]).
//! [`record`] assembles the full record query on top of both.
//!
//! ```text
//! raw args ──parse──▶ PredicateGroup ──compile──▶ Clause { join, where, params }
//! ```

pub mod compiler;
pub mod parser;
pub mod record;

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Compare operators
// =============================================================================

/// The closed set of comparison operators a predicate may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "NOT LIKE")]
    NotLike,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    #[serde(rename = "REGEXP")]
    Regexp,
    #[serde(rename = "NOT REGEXP")]
    NotRegexp,
    #[serde(rename = "RLIKE")]
    RLike,
}

impl CompareOp {
    pub const ALL: [CompareOp; 9] = [
        Self::Eq,
        Self::Neq,
        Self::Like,
        Self::NotLike,
        Self::In,
        Self::NotIn,
        Self::Regexp,
        Self::NotRegexp,
        Self::RLike,
    ];

    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Regexp => "REGEXP",
            Self::NotRegexp => "NOT REGEXP",
            Self::RLike => "RLIKE",
        }
    }

    /// Strict lookup. Case-insensitive, inner whitespace collapsed.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        Self::ALL.into_iter().find(|op| op.as_sql() == normalized)
    }

    /// Permissive lookup: anything outside the whitelist becomes `=`.
    pub fn from_raw(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| {
            tracing::warn!("Unknown compare operator '{}', falling back to '='", raw);
            Self::Eq
        })
    }

    /// `IN` / `NOT IN` take a list of values.
    #[inline]
    pub fn takes_list(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    #[inline]
    pub fn is_like(self) -> bool {
        matches!(self, Self::Like | Self::NotLike)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

// =============================================================================
// Cast hints
// =============================================================================

/// Validated `CAST(... AS <type>)` target. Defaults to `CHAR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastType(String);

fn cast_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:BINARY|CHAR|DATE|DATETIME|SIGNED|UNSIGNED|TIME|NUMERIC(?:\(\d+(?:,\s?\d+)?\))?|DECIMAL(?:\(\d+(?:,\s?\d+)?\))?)$",
        )
        .expect("cast pattern is a valid regex")
    })
}

impl CastType {
    pub fn char() -> Self {
        Self("CHAR".into())
    }

    /// Whitelisted types pass through uppercased; bare `NUMERIC` means
    /// `SIGNED`; anything else is `CHAR`.
    pub fn from_raw(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::char();
        };
        let upper = raw.trim().to_ascii_uppercase();
        if upper == "NUMERIC" {
            return Self("SIGNED".into());
        }
        if cast_pattern().is_match(&upper) {
            Self(upper)
        } else {
            Self::char()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CastType {
    fn default() -> Self {
        Self::char()
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// The value side of a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredicateValue {
    Scalar(String),
    List(Vec<String>),
}

impl PredicateValue {
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Scalar(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
        }
    }

    /// Scalar form. A list collapses to its first element.
    pub fn first(&self) -> &str {
        match self {
            Self::Scalar(s) => s,
            Self::List(items) => items.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// List form. A scalar is split on commas and whitespace.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::Scalar(s) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
            Self::List(items) => items.clone(),
        }
    }
}

impl From<&str> for PredicateValue {
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<Vec<&str>> for PredicateValue {
    fn from(values: Vec<&str>) -> Self {
        Self::List(values.into_iter().map(str::to_string).collect())
    }
}

/// A single `field <compare> value` comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub compare: CompareOp,
    pub value: PredicateValue,
    #[serde(default)]
    pub cast: CastType,
}

impl Predicate {
    /// Predicate with the implied operator: `IN` for lists, `=` otherwise.
    pub fn new(field: impl Into<String>, value: impl Into<PredicateValue>) -> Self {
        let value = value.into();
        let compare = if value.is_list() {
            CompareOp::In
        } else {
            CompareOp::Eq
        };
        Self::with_compare(field, compare, value)
    }

    pub fn with_compare(
        field: impl Into<String>,
        compare: CompareOp,
        value: impl Into<PredicateValue>,
    ) -> Self {
        Self {
            field: field.into(),
            compare,
            value: value.into(),
            cast: CastType::char(),
        }
    }

    pub fn cast(mut self, cast: CastType) -> Self {
        self.cast = cast;
        self
    }
}

// =============================================================================
// Groups
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Relation {
    #[default]
    And,
    Or,
}

impl Relation {
    /// `OR` only for the case-insensitive literal "OR".
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("or") {
            Self::Or
        } else {
            Self::And
        }
    }

    /// Reads an optional JSON `relation` value. Non-strings mean `AND`.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(serde_json::Value::as_str)
            .map_or(Self::And, Self::from_raw)
    }

    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// A member of a predicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Predicate(Predicate),
    Group(PredicateGroup),
}

/// Predicates and sub-groups combined by one relation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PredicateGroup {
    pub relation: Relation,
    pub members: Vec<Node>,
}

impl PredicateGroup {
    pub fn new(relation: Relation) -> Self {
        Self {
            relation,
            members: Vec::new(),
        }
    }

    /// An `AND` group holding exactly one predicate.
    pub fn single(predicate: Predicate) -> Self {
        Self {
            relation: Relation::And,
            members: vec![Node::Predicate(predicate)],
        }
    }

    pub fn push(&mut self, node: Node) {
        self.members.push(node);
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_is_always_whitelisted() {
        let inputs = [
            "=", "!=", "like", "Not Like", "in", "NOT   IN", "regexp", "not regexp", "rlike",
            "INN", "", ">", "; DROP TABLE records", "BETWEEN", "<>",
        ];
        for raw in inputs {
            let op = CompareOp::from_raw(raw);
            assert!(CompareOp::ALL.contains(&op), "{raw} produced {op}");
        }
    }

    #[test]
    fn test_compare_op_case_insensitive() {
        assert_eq!(CompareOp::from_raw("not in"), CompareOp::NotIn);
        assert_eq!(CompareOp::from_raw(" Like "), CompareOp::Like);
        assert_eq!(CompareOp::from_raw("RLike"), CompareOp::RLike);
    }

    #[test]
    fn test_unknown_compare_falls_back_to_eq() {
        assert_eq!(CompareOp::from_raw("INN"), CompareOp::Eq);
        assert_eq!(CompareOp::from_raw(">="), CompareOp::Eq);
        assert_eq!(CompareOp::parse("INN"), None);
    }

    #[test]
    fn test_cast_type_whitelist() {
        assert_eq!(CastType::from_raw(None).as_str(), "CHAR");
        assert_eq!(CastType::from_raw(Some("signed")).as_str(), "SIGNED");
        assert_eq!(CastType::from_raw(Some("numeric")).as_str(), "SIGNED");
        assert_eq!(CastType::from_raw(Some("decimal(10,2)")).as_str(), "DECIMAL(10,2)");
        assert_eq!(CastType::from_raw(Some("CHAR) OR 1=1 --")).as_str(), "CHAR");
        assert_eq!(CastType::from_raw(Some("varchar")).as_str(), "CHAR");
    }

    #[test]
    fn test_scalar_splits_into_list() {
        let v = PredicateValue::from("posts, forms  comments,,");
        assert_eq!(v.to_list(), vec!["posts", "forms", "comments"]);
        assert_eq!(PredicateValue::from("").to_list(), Vec::<String>::new());
    }

    #[test]
    fn test_list_collapses_to_first() {
        let v = PredicateValue::from(vec!["a", "b"]);
        assert_eq!(v.first(), "a");
        assert_eq!(PredicateValue::List(vec![]).first(), "");
    }

    #[test]
    fn test_predicate_default_operator_follows_shape() {
        assert_eq!(Predicate::new("context", "posts").compare, CompareOp::Eq);
        assert_eq!(
            Predicate::new("context", vec!["posts", "pages"]).compare,
            CompareOp::In
        );
    }

    #[test]
    fn test_relation_from_raw() {
        assert_eq!(Relation::from_raw("or"), Relation::Or);
        assert_eq!(Relation::from_raw("Or"), Relation::Or);
        assert_eq!(Relation::from_raw("OR"), Relation::Or);
        assert_eq!(Relation::from_raw("xor"), Relation::And);
        assert_eq!(Relation::from_value(Some(&serde_json::json!(1))), Relation::And);
        assert_eq!(Relation::from_value(None), Relation::And);
    }
}
