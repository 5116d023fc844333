//! # Query Argument Parser
//!
//! Normalises raw filter args into one canonical [`PredicateGroup`].
//! Two input shapes are accepted and merged:
//!
//! ```text
//! { "context__in": "posts,forms", "action": "updated" }          flat shorthand
//! { "context_query": [ { "context": "posts", "action": "x" } ] }  nested groups
//! { "context_query": { "relation": "OR", "0": {..}, "1": {..} } } nested, with relation
//! ```
//!
//! Malformed values never fail the parse. They are coerced or dropped.

use serde_json::{Map, Value};

use super::{CastType, CompareOp, Node, Predicate, PredicateGroup, PredicateValue, Relation};

/// Fields accepted by the flat shorthand and inside nested groups.
pub const CONTEXT_FIELDS: [&str; 3] = ["connector", "context", "action"];

/// Flat key suffixes and the operator each implies.
const FLAT_VARIANTS: [(&str, CompareOp); 3] = [
    ("", CompareOp::Eq),
    ("__in", CompareOp::In),
    ("__not_in", CompareOp::NotIn),
];

/// Parse the connector/context/action filters of `raw`.
///
/// Flat groups come first (fixed field order, then suffix order), followed
/// by the groups of `connector_query`, `context_query` and `action_query`.
/// The top-level relation is `OR` when `raw` or any nested input carries
/// `relation: "OR"`.
pub fn parse(raw: &Value) -> PredicateGroup {
    let Some(args) = raw.as_object() else {
        return PredicateGroup::default();
    };

    let mut relation = Relation::from_value(args.get("relation"));
    let flat_keys = CONTEXT_FIELDS.map(|field| (field, field));
    let mut members = parse_flat(args, &flat_keys);

    for field in CONTEXT_FIELDS {
        let Some(nested) = args.get(&format!("{field}_query")) else {
            continue;
        };
        let (nested_relation, groups) = parse_nested(nested, context_field);
        if nested_relation == Relation::Or {
            relation = Relation::Or;
        }
        members.extend(groups.into_iter().map(Node::Group));
    }

    PredicateGroup { relation, members }
}

fn context_field(key: &str) -> Option<String> {
    CONTEXT_FIELDS.contains(&key).then(|| key.to_string())
}

/// Flat shorthand: `key`, `key__in`, `key__not_in` for each `(key, field)`.
///
/// Each present, non-empty variant becomes a single-predicate group.
pub fn parse_flat(args: &Map<String, Value>, keys: &[(&str, &str)]) -> Vec<Node> {
    let mut members = Vec::new();
    for (key, field) in keys {
        for (suffix, compare) in FLAT_VARIANTS {
            let Some(raw) = args.get(&format!("{key}{suffix}")) else {
                continue;
            };
            let Some(value) = normalize_value(raw).filter(|v| !v.is_empty()) else {
                continue;
            };
            let predicate = Predicate::with_compare(*field, compare, value);
            members.push(Node::Group(PredicateGroup::single(predicate)));
        }
    }
    members
}

/// Nested `*_query` input: an array of groups, or an object whose
/// `relation` key sets the returned relation and whose object values are
/// the groups (numeric keys in numeric order). An array value contributes
/// each of its objects as a group.
///
/// `resolve` maps a group key to a filter field, or `None` to drop it.
pub fn parse_nested<F>(raw: &Value, resolve: F) -> (Relation, Vec<PredicateGroup>)
where
    F: Fn(&str) -> Option<String>,
{
    match raw {
        Value::Array(items) => {
            let groups = items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|group| parse_group(group, &resolve))
                .collect();
            (Relation::And, groups)
        }
        Value::Object(map) => {
            let relation = Relation::from_value(map.get("relation"));
            let mut entries: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "relation")
                .collect();
            entries.sort_by_key(|(key, _)| key.parse::<u64>().map_or((1, 0), |n| (0, n)));
            let groups = entries
                .into_iter()
                .flat_map(|(_, value)| match value {
                    Value::Object(group) => vec![group],
                    Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
                    _ => Vec::new(),
                })
                .filter_map(|group| parse_group(group, &resolve))
                .collect();
            (relation, groups)
        }
        _ => (Relation::And, Vec::new()),
    }
}

/// One nested group. Empty groups are dropped.
fn parse_group<F>(group: &Map<String, Value>, resolve: &F) -> Option<PredicateGroup>
where
    F: Fn(&str) -> Option<String>,
{
    let mut parsed = PredicateGroup::new(Relation::from_value(group.get("relation")));
    for (key, entry) in group {
        if key == "relation" {
            continue;
        }
        let Some(field) = resolve(key) else {
            tracing::debug!("Dropping filter on unsupported field '{}'", key);
            continue;
        };
        if let Some(predicate) = parse_entry(field, entry) {
            parsed.push(Node::Predicate(predicate));
        }
    }
    (!parsed.is_empty()).then_some(parsed)
}

/// `field => scalar | list | {value, compare?, type?}`.
///
/// An object without a `value` key, or with a null one, is itself the value.
fn parse_entry(field: String, entry: &Value) -> Option<Predicate> {
    let (raw_value, raw_compare, raw_type) = match entry {
        Value::Object(explicit) if explicit.get("value").is_some_and(|v| !v.is_null()) => (
            explicit.get("value")?,
            explicit.get("compare").and_then(Value::as_str),
            explicit.get("type").and_then(Value::as_str),
        ),
        other => (other, None, None),
    };

    let value = normalize_value(raw_value).filter(|v| !v.is_empty())?;
    let compare = match raw_compare {
        Some(raw) => CompareOp::from_raw(raw),
        None if value.is_list() => CompareOp::In,
        None => CompareOp::Eq,
    };

    Some(Predicate::with_compare(field, compare, value).cast(CastType::from_raw(raw_type)))
}

/// Map a JSON value to a predicate value. `null` means absent.
pub fn normalize_value(value: &Value) -> Option<PredicateValue> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(PredicateValue::List(
            items.iter().filter_map(scalar_text).collect(),
        )),
        Value::Object(map) => Some(PredicateValue::List(
            map.values().filter_map(scalar_text).collect(),
        )),
        scalar => scalar_text(scalar).map(PredicateValue::Scalar),
    }
}

/// Text of a JSON scalar. Containers and `null` have none.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}
