//! # Connector Framework
//!
//! A [`Connector`] maps host lifecycle events to audit-trail records. It
//! declares the events it listens to, the contexts and actions it logs,
//! and an explicit event → handler table. Every integration is a plain
//! `Connector` value built with the builder methods below; see [`users`]
//! and [`settings`].

pub mod registry;
pub mod settings;
pub mod users;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};
use vg_core::{Actor, Record, RecordId};

use crate::logger::{LogEntry, LogError, Logger};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Malformed payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Why a connector failed its capability check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Connector has no slug")]
    MissingSlug,

    #[error("Connector '{0}' has no label")]
    MissingLabel(String),

    #[error("Connector '{0}' declares no events")]
    NoEvents(String),

    #[error("Connector '{0}' handles undeclared event '{1}'")]
    UndeclaredHandler(String, String),
}

// =============================================================================
// Handlers
// =============================================================================

/// What a handler gets to work with during one invocation.
pub struct HookContext<'a> {
    pub connector: &'a Connector,
    pub logger: &'a Logger,
    pub actor: &'a Actor,
    pub event: &'a str,
}

impl HookContext<'_> {
    /// Log immediately as the invocation's actor.
    pub fn log(&self, entry: LogEntry) -> Result<Option<RecordId>, ConnectorError> {
        self.connector.log(self.logger, &entry, self.actor)
    }

    pub fn delayed_log(&self, key: impl Into<String>, entry: LogEntry) {
        self.connector.delayed_log(key, entry, self.actor);
    }

    pub fn delayed_log_append(&self, key: impl Into<String>, entry: LogEntry) {
        self.connector.delayed_log_append(key, entry, self.actor);
    }
}

pub type Handler = Arc<dyn Fn(&HookContext<'_>, &Value) -> Result<(), ConnectorError> + Send + Sync>;

/// Builds post-hoc action links for one of the connector's records.
pub type LinkBuilder = Arc<dyn Fn(&Record) -> Vec<ActionLink> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionLink {
    pub label: String,
    pub url: String,
}

impl ActionLink {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

// =============================================================================
// Delayed buffer
// =============================================================================

/// Entries keyed by caller key, in first-buffered key order.
#[derive(Default)]
struct DelayedBuffer {
    order: Vec<String>,
    entries: HashMap<String, Vec<(LogEntry, Actor)>>,
}

impl DelayedBuffer {
    fn slot(&mut self, key: String) -> &mut Vec<(LogEntry, Actor)> {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.entry(key).or_default()
    }

    fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Connector
// =============================================================================

pub struct Connector {
    pub slug: String,
    pub label: String,
    /// Context slug → label.
    pub contexts: Vec<(String, String)>,
    /// Action slug → label.
    pub actions: Vec<(String, String)>,
    events: Vec<String>,
    handlers: HashMap<String, Handler>,
    links: Option<LinkBuilder>,
    delayed: Mutex<DelayedBuffer>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("slug", &self.slug)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(slug: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            label: label.into(),
            contexts: Vec::new(),
            actions: Vec::new(),
            events: Vec::new(),
            handlers: HashMap::new(),
            links: None,
            delayed: Mutex::new(DelayedBuffer::default()),
        }
    }

    pub fn context(mut self, slug: impl Into<String>, label: impl Into<String>) -> Self {
        self.contexts.push((slug.into(), label.into()));
        self
    }

    pub fn action(mut self, slug: impl Into<String>, label: impl Into<String>) -> Self {
        self.actions.push((slug.into(), label.into()));
        self
    }

    /// Declare an event without a handler. Firing it is a no-op.
    pub fn listen(mut self, event: impl Into<String>) -> Self {
        let event = event.into();
        if !self.events.contains(&event) {
            self.events.push(event);
        }
        self
    }

    /// Declare an event and its handler.
    pub fn on<F>(self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&HookContext<'_>, &Value) -> Result<(), ConnectorError> + Send + Sync + 'static,
    {
        let event = event.into();
        let mut this = self.listen(event.clone());
        this.handlers.insert(event, Arc::new(handler));
        this
    }

    pub fn action_links<F>(mut self, builder: F) -> Self
    where
        F: Fn(&Record) -> Vec<ActionLink> + Send + Sync + 'static,
    {
        self.links = Some(Arc::new(builder));
        self
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Capability check run before registration.
    pub fn validate(&self) -> Result<(), CapabilityError> {
        if self.slug.trim().is_empty() {
            return Err(CapabilityError::MissingSlug);
        }
        if self.label.trim().is_empty() {
            return Err(CapabilityError::MissingLabel(self.slug.clone()));
        }
        if self.events.is_empty() {
            return Err(CapabilityError::NoEvents(self.slug.clone()));
        }
        if let Some(event) = self.handlers.keys().find(|e| !self.events.contains(e)) {
            return Err(CapabilityError::UndeclaredHandler(
                self.slug.clone(),
                event.clone(),
            ));
        }
        Ok(())
    }

    /// Run the handler for `event`. No handler is a no-op.
    pub fn handle(
        &self,
        logger: &Logger,
        actor: &Actor,
        event: &str,
        payload: &Value,
    ) -> Result<(), ConnectorError> {
        let Some(handler) = self.handlers.get(event) else {
            return Ok(());
        };
        let ctx = HookContext {
            connector: self,
            logger,
            actor,
            event,
        };
        handler(&ctx, payload)
    }

    pub fn log(
        &self,
        logger: &Logger,
        entry: &LogEntry,
        actor: &Actor,
    ) -> Result<Option<RecordId>, ConnectorError> {
        Ok(logger.log(&self.slug, entry, actor)?)
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, DelayedBuffer> {
        self.delayed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer under `key`. A later call with the same key replaces the
    /// entry but keeps the key's original position.
    pub fn delayed_log(&self, key: impl Into<String>, entry: LogEntry, actor: &Actor) {
        let mut buffer = self.buffer();
        let slot = buffer.slot(key.into());
        slot.clear();
        slot.push((entry, actor.clone()));
    }

    /// Buffer under `key` alongside any entries already there.
    pub fn delayed_log_append(&self, key: impl Into<String>, entry: LogEntry, actor: &Actor) {
        self.buffer().slot(key.into()).push((entry, actor.clone()));
    }

    pub fn pending(&self) -> usize {
        self.buffer().len()
    }

    /// Write every buffered entry in key order and clear the buffer.
    /// Stops at the first failure; the rest of the buffer is dropped.
    pub fn commit_delayed(&self, logger: &Logger) -> Result<Vec<RecordId>, ConnectorError> {
        let mut buffer = std::mem::take(&mut *self.buffer());
        let total = buffer.len();
        let mut written = Vec::with_capacity(total);
        let mut attempted = 0;

        for key in std::mem::take(&mut buffer.order) {
            let Some(entries) = buffer.entries.remove(&key) else {
                continue;
            };
            for (entry, actor) in entries {
                attempted += 1;
                match self.log(logger, &entry, &actor) {
                    Ok(Some(id)) => written.push(id),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            "Connector '{}' delayed commit failed at '{}', dropping {} buffered entries",
                            self.slug,
                            key,
                            total - attempted
                        );
                        return Err(e);
                    }
                }
            }
        }
        Ok(written)
    }

    pub fn links_for(&self, record: &Record) -> Vec<ActionLink> {
        match &self.links {
            Some(builder) if record.connector == self.slug => builder(record),
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Payload helpers
// =============================================================================

/// String field of a JSON payload, numbers stringified.
pub fn payload_str(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer field of a JSON payload, numeric strings accepted.
pub fn payload_i64(payload: &Value, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_numeric_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_digit())
}

/// Keys whose values differ between `before` and `after`, including added
/// and removed keys: `before` keys first, then keys only in `after`. With
/// `depth > 0`, differing nested objects yield dotted keys instead.
/// Numeric keys are ignored.
pub fn changed_keys(before: &Value, after: &Value, depth: usize) -> Vec<String> {
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);
    let mut changed = Vec::new();

    for (key, old) in before {
        if is_numeric_key(key) {
            continue;
        }
        let Some(new) = after.get(key) else {
            changed.push(key.clone());
            continue;
        };
        if old == new {
            continue;
        }
        if depth > 0 && old.is_object() && new.is_object() {
            let nested = changed_keys(old, new, depth - 1);
            if !nested.is_empty() {
                changed.extend(nested.into_iter().map(|inner| format!("{key}.{inner}")));
                continue;
            }
        }
        changed.push(key.clone());
    }

    for key in after.keys() {
        if !is_numeric_key(key) && !before.contains_key(key) {
            changed.push(key.clone());
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;
    use vg_core::{LogSink, NewRecord, SinkError};

    fn logger() -> (Arc<MemorySink>, Logger) {
        let sink = Arc::new(MemorySink::new(100));
        (sink.clone(), Logger::new(sink))
    }

    fn posts() -> Connector {
        Connector::new("posts", "Posts")
            .context("post", "Post")
            .action("updated", "Updated")
            .on("save_post", |ctx, payload| {
                let title = payload_str(payload, "title").unwrap_or_default();
                ctx.log(LogEntry::new("\"%s\" updated", "post", "updated").arg("title", title))?;
                Ok(())
            })
    }

    #[test]
    fn test_validate() {
        assert!(posts().validate().is_ok());
        assert_eq!(
            Connector::new("", "x").listen("e").validate(),
            Err(CapabilityError::MissingSlug)
        );
        assert_eq!(
            Connector::new("x", " ").listen("e").validate(),
            Err(CapabilityError::MissingLabel("x".into()))
        );
        assert_eq!(
            Connector::new("x", "X").validate(),
            Err(CapabilityError::NoEvents("x".into()))
        );
    }

    #[test]
    fn test_handle_dispatches_by_event() {
        let (sink, logger) = logger();
        let connector = posts().listen("trash_post");
        let actor = Actor::user(2, "editor");

        connector
            .handle(&logger, &actor, "save_post", &json!({ "title": "Hello" }))
            .unwrap();
        connector
            .handle(&logger, &actor, "trash_post", &json!({}))
            .unwrap();
        connector.handle(&logger, &actor, "unknown", &json!({})).unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].summary, "\"Hello\" updated");
        assert_eq!(records[0].connector, "posts");
        assert_eq!(records[0].actor_id, 2);
    }

    #[test]
    fn test_delayed_commit_keeps_first_key_order() {
        let (sink, logger) = logger();
        let connector = posts();
        let actor = Actor::system();

        connector.delayed_log("e1", LogEntry::new("first", "post", "updated"), &actor);
        connector.delayed_log("e2", LogEntry::new("second", "post", "updated"), &actor);
        connector.delayed_log("e1", LogEntry::new("first again", "post", "updated"), &actor);
        assert_eq!(connector.pending(), 2);

        let ids = connector.commit_delayed(&logger).unwrap();
        assert_eq!(ids, vec![1, 2]);
        let summaries: Vec<String> = sink.records().into_iter().map(|r| r.summary).collect();
        assert_eq!(summaries, vec!["first again", "second"]);
        assert_eq!(connector.pending(), 0);
        assert!(connector.commit_delayed(&logger).unwrap().is_empty());
    }

    #[test]
    fn test_delayed_append_accumulates() {
        let (sink, logger) = logger();
        let connector = posts();
        let actor = Actor::system();

        connector.delayed_log_append("k", LogEntry::new("a", "post", "updated"), &actor);
        connector.delayed_log_append("k", LogEntry::new("b", "post", "updated"), &actor);
        connector.commit_delayed(&logger).unwrap();
        assert_eq!(sink.len(), 2);
    }

    struct FailSecond {
        inner: MemorySink,
    }

    impl LogSink for FailSecond {
        fn write(&self, record: NewRecord) -> Result<Record, SinkError> {
            if self.inner.len() == 1 {
                return Err(SinkError::Storage("disk full".into()));
            }
            self.inner.write(record)
        }
    }

    #[test]
    fn test_commit_stops_at_first_failure() {
        let sink = Arc::new(FailSecond {
            inner: MemorySink::new(10),
        });
        let logger = Logger::new(sink.clone());
        let connector = posts();
        let actor = Actor::system();
        for key in ["a", "b", "c"] {
            connector.delayed_log(key, LogEntry::new(key, "post", "updated"), &actor);
        }

        let err = connector.commit_delayed(&logger).unwrap_err();
        assert!(matches!(err, ConnectorError::Log(_)));
        assert_eq!(sink.inner.len(), 1);
        assert_eq!(connector.pending(), 0);
    }

    #[test]
    fn test_links_only_for_own_records() {
        let connector = posts().action_links(|record| {
            vec![ActionLink::new("Edit", format!("/post/{}", record.object_id.unwrap_or(0)))]
        });
        let record = NewRecord {
            object_id: Some(5),
            connector: "posts".into(),
            context: "post".into(),
            action: "updated".into(),
            ..Default::default()
        }
        .into_record(1, chrono::Utc::now());
        assert_eq!(connector.links_for(&record), vec![ActionLink::new("Edit", "/post/5")]);

        let foreign = Record {
            connector: "users".into(),
            ..record
        };
        assert!(connector.links_for(&foreign).is_empty());
    }

    #[test]
    fn test_changed_keys() {
        let before = json!({ "a": 1, "b": { "x": 1, "y": 2 }, "c": 3, "0": "skip" });
        let after = json!({ "a": 1, "b": { "x": 1, "y": 5 }, "d": 4, "0": "other" });

        assert_eq!(changed_keys(&before, &after, 0), vec!["b", "c", "d"]);
        assert_eq!(changed_keys(&before, &after, 1), vec!["b.y", "c", "d"]);
        assert!(changed_keys(&before, &before, 2).is_empty());
    }

    #[test]
    fn test_changed_keys_nested_numeric_only_falls_back_to_parent() {
        let before = json!({ "list": { "0": "a" } });
        let after = json!({ "list": { "0": "b" } });
        assert_eq!(changed_keys(&before, &after, 1), vec!["list"]);
    }

    #[test]
    fn test_changed_keys_non_objects() {
        assert_eq!(changed_keys(&json!("x"), &json!({ "k": 1 }), 0), vec!["k"]);
        assert!(changed_keys(&json!(null), &json!([1, 2]), 0).is_empty());
    }
}
