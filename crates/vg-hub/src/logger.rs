//! # Logger
//!
//! Turns a connector's [`LogEntry`] into a [`NewRecord`]: renders the
//! summary template, converts args into meta, applies exclusion rules and
//! writes through the configured [`LogSink`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vg_core::{Actor, LogSink, NewRecord, RecordId, RecordMeta, SinkError};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// One message a connector wants logged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogEntry {
    /// Summary template: `%s` / `%d` sequential, `%N$s` positional, `%%`.
    pub message: String,
    /// Named template args, in template order. Also stored as meta.
    pub args: Vec<(String, Value)>,
    pub object_id: Option<i64>,
    pub context: String,
    pub action: String,
    /// Overrides the actor of the current invocation.
    pub actor: Option<Actor>,
}

impl LogEntry {
    pub fn new(
        message: impl Into<String>,
        context: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            context: context.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    pub fn object(mut self, object_id: i64) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }
}

// =============================================================================
// Exclusions
// =============================================================================

/// Drops matching entries before they reach the sink. Every set field must
/// match; a rule with no fields set matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub actor_role: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl ExclusionRule {
    pub fn matches(&self, record: &NewRecord) -> bool {
        let checks = [
            (&self.connector, Some(record.connector.as_str())),
            (&self.context, Some(record.context.as_str())),
            (&self.action, Some(record.action.as_str())),
            (&self.actor_role, Some(record.actor_role.as_str())),
            (&self.ip, record.ip.as_deref()),
        ];
        let mut any_set = false;
        for (rule, actual) in checks {
            if let Some(expected) = rule {
                any_set = true;
                if actual != Some(expected.as_str()) {
                    return false;
                }
            }
        }
        any_set
    }
}

// =============================================================================
// Logger
// =============================================================================

pub struct Logger {
    sink: Arc<dyn LogSink>,
    exclusions: Vec<ExclusionRule>,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            exclusions: Vec::new(),
        }
    }

    pub fn with_exclusions(mut self, rules: Vec<ExclusionRule>) -> Self {
        self.exclusions = rules;
        self
    }

    /// Build the record `connector` would write for `entry`.
    pub fn build(&self, connector: &str, entry: &LogEntry, actor: &Actor) -> NewRecord {
        let actor = entry.actor.as_ref().unwrap_or(actor);
        NewRecord {
            object_id: entry.object_id,
            actor_id: actor.id,
            actor_role: actor.role.clone(),
            created_at: None,
            summary: render_summary(&entry.message, &entry.args),
            connector: connector.to_string(),
            context: entry.context.clone(),
            action: entry.action.clone(),
            ip: actor.ip.clone(),
            meta: args_to_meta(&entry.args),
        }
    }

    /// Write `entry` for `connector`. `Ok(None)` when an exclusion rule
    /// dropped it.
    pub fn log(
        &self,
        connector: &str,
        entry: &LogEntry,
        actor: &Actor,
    ) -> Result<Option<RecordId>, LogError> {
        let record = self.build(connector, entry, actor);
        if let Some(rule) = self.exclusions.iter().find(|rule| rule.matches(&record)) {
            tracing::debug!(
                "Excluded {}/{}/{} by rule {:?}",
                record.connector,
                record.context,
                record.action,
                rule
            );
            return Ok(None);
        }
        let written = self.sink.write(record)?;
        Ok(Some(written.id))
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Text of an arg as it appears in a summary. Lists are comma-joined.
fn arg_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(arg_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn arg_int(value: &Value) -> String {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.trunc() as i64),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    n.unwrap_or(0).to_string()
}

/// Render a printf-style template. Missing args render empty; unknown
/// directives are kept verbatim.
pub fn render_summary(template: &str, args: &[(String, Value)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut digits = String::new();
        while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(d);
            chars.next();
        }
        let position = if digits.is_empty() {
            None
        } else if chars.peek() == Some(&'$') {
            chars.next();
            digits.parse::<usize>().ok().filter(|n| *n > 0)
        } else {
            out.push('%');
            out.push_str(&digits);
            continue;
        };

        let Some(kind) = chars.next() else {
            out.push('%');
            break;
        };
        let index = match (kind, position) {
            ('%', None) => {
                out.push('%');
                continue;
            }
            ('s' | 'd', Some(n)) => n - 1,
            ('s' | 'd', None) => {
                next_arg += 1;
                next_arg - 1
            }
            _ => {
                out.push('%');
                if let Some(n) = position {
                    out.push_str(&format!("{n}$"));
                }
                out.push(kind);
                continue;
            }
        };

        if let Some((_, value)) = args.get(index) {
            if kind == 'd' {
                out.push_str(&arg_int(value));
            } else {
                out.push_str(&arg_text(value));
            }
        }
    }
    out
}

/// Args as record meta: strings as-is, arrays as one value per item,
/// anything else JSON-serialised. Null args are dropped.
pub fn args_to_meta(args: &[(String, Value)]) -> RecordMeta {
    let mut meta = RecordMeta::new();
    for (key, value) in args {
        let values = match value {
            Value::Null => continue,
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            other => vec![other.to_string()],
        };
        meta.entry(key.clone()).or_default().extend(values);
    }
    meta
}
