//! # Connector Registry
//!
//! Owns the dispatcher and decides which connectors are bound to it.
//! Discovery yields built-in connectors followed by extension-supplied
//! ones; each is capability-checked, and the allowed ones are registered
//! by binding one dispatcher hook per declared event.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use vg_core::{Actor, Record, RecordId};

use super::{settings, users, ActionLink, CapabilityError, Connector};
use crate::dispatch::{Dispatcher, FireReport, HandleId, Hook, HookError, Invocation};
use crate::logger::Logger;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Connector '{0}' not found")]
    UnknownConnector(String),
}

// =============================================================================
// Discovery
// =============================================================================

/// Appends connectors to the discovered list.
pub type ExtensionHook = Box<dyn Fn(&mut Vec<Arc<Connector>>) + Send + Sync>;

pub struct Discovery {
    pub builtin: Vec<Arc<Connector>>,
    pub extensions: Vec<ExtensionHook>,
}

impl Discovery {
    /// The connectors shipped with the hub.
    pub fn builtin() -> Self {
        Self {
            builtin: vec![Arc::new(users::connector()), Arc::new(settings::connector())],
            extensions: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            builtin: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn extend_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Vec<Arc<Connector>>) + Send + Sync + 'static,
    {
        self.extensions.push(Box::new(hook));
        self
    }

    /// Built-ins first, then whatever each extension appends, in order.
    pub fn discover(&self) -> Vec<Arc<Connector>> {
        let mut found = self.builtin.clone();
        for hook in &self.extensions {
            hook(&mut found);
        }
        found
    }
}

// =============================================================================
// Labels
// =============================================================================

/// Slug → label tables. Later writers win; unknown slugs label themselves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Labels {
    pub connectors: HashMap<String, String>,
    pub contexts: HashMap<String, String>,
    pub actions: HashMap<String, String>,
}

impl Labels {
    fn absorb(&mut self, connector: &Connector) {
        self.connectors
            .insert(connector.slug.clone(), connector.label.clone());
        for (slug, label) in &connector.contexts {
            self.contexts.insert(slug.clone(), label.clone());
        }
        for (slug, label) in &connector.actions {
            self.actions.insert(slug.clone(), label.clone());
        }
    }

    pub fn connector<'a>(&'a self, slug: &'a str) -> &'a str {
        self.connectors.get(slug).map_or(slug, String::as_str)
    }

    pub fn context<'a>(&'a self, slug: &'a str) -> &'a str {
        self.contexts.get(slug).map_or(slug, String::as_str)
    }

    pub fn action<'a>(&'a self, slug: &'a str) -> &'a str {
        self.actions.get(slug).map_or(slug, String::as_str)
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub registered: Vec<String>,
    pub inactive: Vec<String>,
    /// `(slug, reason)` of connectors that failed the capability check or
    /// reused a slug that is already taken.
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveReport {
    pub registered: Vec<String>,
    pub unregistered: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub written: Vec<RecordId>,
    /// `(slug, error)` for connectors whose commit stopped early.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorInfo {
    pub slug: String,
    pub label: String,
    pub active: bool,
    pub events: Vec<String>,
    pub contexts: Vec<String>,
    pub actions: Vec<String>,
}

// =============================================================================
// Registry
// =============================================================================

/// A registered connector and the dispatcher handles bound for it.
struct Binding {
    connector: Arc<Connector>,
    handles: Vec<(String, HandleId)>,
}

pub struct RegistryContext {
    dispatcher: Dispatcher,
    logger: Arc<Logger>,
    /// Every valid discovered connector, in discovery order.
    known: Vec<Arc<Connector>>,
    /// Bindings per registered slug.
    bound: HashMap<String, Binding>,
    /// Registered slugs in registration order.
    order: Vec<String>,
    labels: Labels,
}

impl RegistryContext {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            logger,
            known: Vec::new(),
            bound: HashMap::new(),
            order: Vec::new(),
            labels: Labels::default(),
        }
    }

    /// Discover, validate and register every allowed connector. Invalid
    /// connectors are skipped, never fatal.
    ///
    /// The first connector discovered for a slug wins. A registered instance
    /// is never replaced; a different instance under its slug is skipped.
    pub fn load_all(&mut self, discovery: &Discovery, allow_list: &[String]) -> LoadReport {
        let mut report = LoadReport::default();
        let mut seen: Vec<String> = Vec::new();
        for connector in discovery.discover() {
            if let Err(e) = connector.validate() {
                tracing::warn!("Skipping connector '{}': {}", connector.slug, e);
                report.skipped.push((connector.slug.clone(), e.to_string()));
                continue;
            }
            let slug = connector.slug.clone();
            if seen.contains(&slug) {
                tracing::warn!("Skipping connector '{}': duplicate slug", slug);
                report.skipped.push((slug, "duplicate slug".into()));
                continue;
            }
            seen.push(slug.clone());

            if let Some(binding) = self.bound.get(&slug) {
                if !Arc::ptr_eq(&binding.connector, &connector) {
                    tracing::warn!("Skipping connector '{}': already registered", slug);
                    report.skipped.push((slug, "already registered".into()));
                }
                continue;
            }
            self.remember(connector.clone());
            if !allow_list.iter().any(|allowed| *allowed == slug) {
                report.inactive.push(slug);
                continue;
            }
            match self.register(connector) {
                Ok(true) => report.registered.push(slug),
                Ok(false) => {}
                Err(e) => report.skipped.push((slug, e.to_string())),
            }
        }
        tracing::info!(
            "Loaded connectors: {} registered, {} inactive, {} skipped",
            report.registered.len(),
            report.inactive.len(),
            report.skipped.len()
        );
        report
    }

    fn remember(&mut self, connector: Arc<Connector>) {
        match self.known.iter_mut().find(|c| c.slug == connector.slug) {
            Some(existing) => *existing = connector,
            None => self.known.push(connector),
        }
    }

    /// Bind one hook per declared event. Returns `Ok(false)` if the slug is
    /// already registered.
    pub fn register(&mut self, connector: Arc<Connector>) -> Result<bool, RegistryError> {
        connector.validate()?;
        if self.bound.contains_key(&connector.slug) {
            return Ok(false);
        }

        let mut handles = Vec::with_capacity(connector.events().len());
        for event in connector.events() {
            let target = connector.clone();
            let logger = self.logger.clone();
            let hook: Hook = Arc::new(move |inv: &Invocation<'_>| -> Result<(), HookError> {
                target.handle(&logger, inv.actor, inv.event, inv.payload)?;
                Ok(())
            });
            handles.push((event.clone(), self.dispatcher.bind(event, hook)));
        }

        tracing::debug!(
            "Registered connector '{}' on {} events",
            connector.slug,
            handles.len()
        );
        self.labels.absorb(&connector);
        self.order.push(connector.slug.clone());
        self.remember(connector.clone());
        self.bound
            .insert(connector.slug.clone(), Binding { connector, handles });
        Ok(true)
    }

    /// Remove every binding `register` created. Returns false if the slug
    /// was not registered.
    pub fn unregister(&mut self, slug: &str) -> bool {
        let Some(binding) = self.bound.remove(slug) else {
            return false;
        };
        for (event, handle) in binding.handles {
            self.dispatcher.unbind(&event, handle);
        }
        self.order.retain(|s| s != slug);
        tracing::debug!("Unregistered connector '{}'", slug);
        true
    }

    /// Unregister then register again. The connector moves to the end of
    /// the firing order.
    pub fn reload(&mut self, slug: &str) -> Result<(), RegistryError> {
        let connector = self
            .find(slug)
            .ok_or_else(|| RegistryError::UnknownConnector(slug.to_string()))?;
        self.unregister(slug);
        self.register(connector)?;
        Ok(())
    }

    /// Make exactly the known connectors in `allow_list` registered.
    pub fn set_active(&mut self, allow_list: &[String]) -> ActiveReport {
        let mut report = ActiveReport::default();
        for connector in self.known.clone() {
            let allowed = allow_list.iter().any(|s| *s == connector.slug);
            let active = self.is_registered(&connector.slug);
            if allowed && !active {
                let slug = connector.slug.clone();
                if matches!(self.register(connector), Ok(true)) {
                    report.registered.push(slug);
                }
            } else if !allowed && active {
                self.unregister(&connector.slug);
                report.unregistered.push(connector.slug.clone());
            }
        }
        for slug in allow_list {
            if self.find(slug).is_none() {
                tracing::warn!("Cannot activate unknown connector '{}'", slug);
            }
        }
        report
    }

    pub fn fire(&self, event: &str, payload: &Value, actor: &Actor) -> FireReport {
        self.dispatcher.fire(event, payload, actor)
    }

    /// Flush each registered connector's delayed buffer, in registration
    /// order.
    pub fn commit_delayed(&self) -> CommitReport {
        let mut report = CommitReport::default();
        for slug in &self.order {
            let Some(Binding { connector, .. }) = self.bound.get(slug) else {
                continue;
            };
            match connector.commit_delayed(&self.logger) {
                Ok(ids) => report.written.extend(ids),
                Err(e) => report.failures.push((slug.clone(), e.to_string())),
            }
        }
        report
    }

    pub fn is_registered(&self, slug: &str) -> bool {
        self.bound.contains_key(slug)
    }

    /// The registered instance for `slug`, else the known one.
    pub fn find(&self, slug: &str) -> Option<Arc<Connector>> {
        match self.bound.get(slug) {
            Some(binding) => Some(binding.connector.clone()),
            None => self.known.iter().find(|c| c.slug == slug).cloned(),
        }
    }

    pub fn registered(&self) -> &[String] {
        &self.order
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn connectors(&self) -> Vec<ConnectorInfo> {
        self.known
            .iter()
            .map(|c| ConnectorInfo {
                slug: c.slug.clone(),
                label: c.label.clone(),
                active: self.is_registered(&c.slug),
                events: c.events().to_vec(),
                contexts: c.contexts.iter().map(|(slug, _)| slug.clone()).collect(),
                actions: c.actions.iter().map(|(slug, _)| slug.clone()).collect(),
            })
            .collect()
    }

    /// Links offered by the record's connector, if it is known.
    pub fn action_links(&self, record: &Record) -> Vec<ActionLink> {
        self.find(&record.connector)
            .map(|c| c.links_for(record))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::payload_str;
    use crate::logger::LogEntry;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn registry() -> (Arc<MemorySink>, RegistryContext) {
        let sink = Arc::new(MemorySink::new(100));
        let logger = Arc::new(Logger::new(sink.clone()));
        (sink, RegistryContext::new(logger))
    }

    fn counting(slug: &str) -> Arc<Connector> {
        Arc::new(
            Connector::new(slug, slug.to_uppercase())
                .context("things", "Things")
                .on("thing_saved", |ctx, payload| {
                    let name = payload_str(payload, "name").unwrap_or_default();
                    ctx.log(LogEntry::new("%s saved", "things", "saved").arg("name", name))?;
                    Ok(())
                })
                .on("thing_deleted", |ctx, _| {
                    ctx.delayed_log("deleted", LogEntry::new("deleted", "things", "deleted"));
                    Ok(())
                }),
        )
    }

    fn allow(slugs: &[&str]) -> Vec<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_then_unregister_leaves_no_trace() {
        let (sink, mut registry) = registry();
        let connector = counting("things");

        assert!(registry.register(connector.clone()).unwrap());
        assert!(registry.unregister("things"));
        assert!(registry.dispatcher().is_empty());

        for event in connector.events() {
            let report = registry.fire(event, &json!({ "name": "x" }), &Actor::system());
            assert_eq!(report.invoked, 0);
        }
        assert!(sink.is_empty());
        assert!(!registry.unregister("things"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let (sink, mut registry) = registry();
        let connector = counting("things");

        assert!(registry.register(connector.clone()).unwrap());
        assert!(!registry.register(connector).unwrap());

        let report = registry.fire("thing_saved", &json!({ "name": "x" }), &Actor::system());
        assert_eq!(report.invoked, 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_register_rejects_invalid_connector() {
        let (_, mut registry) = registry();
        let invalid = Arc::new(Connector::new("empty", "Empty"));
        assert!(matches!(
            registry.register(invalid),
            Err(RegistryError::Capability(CapabilityError::NoEvents(_)))
        ));
        assert!(registry.dispatcher().is_empty());
    }

    #[test]
    fn test_load_all_orders_builtin_then_extensions() {
        let (_, mut registry) = registry();
        let discovery = Discovery::empty()
            .extend_with(|found| found.push(counting("alpha")))
            .extend_with(|found| {
                found.push(counting("beta"));
                found.push(Arc::new(Connector::new("", "Nameless").listen("x")));
            });
        let discovery = Discovery {
            builtin: vec![counting("core")],
            ..discovery
        };

        let report = registry.load_all(&discovery, &allow(&["core", "beta", "alpha"]));
        assert_eq!(report.registered, vec!["core", "alpha", "beta"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(registry.registered(), &["core", "alpha", "beta"]);
    }

    #[test]
    fn test_load_all_respects_allow_list() {
        let (_, mut registry) = registry();
        let report = registry.load_all(&Discovery::builtin(), &allow(&["users"]));
        assert_eq!(report.registered, vec!["users"]);
        assert_eq!(report.inactive, vec!["settings"]);

        let infos = registry.connectors();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|c| c.slug == "settings" && !c.active));
    }

    fn update_blogname(registry: &RegistryContext) -> CommitReport {
        let payload = json!({ "option": "blogname", "old_value": "A", "value": "B" });
        registry.fire("update_option", &payload, &Actor::system());
        registry.commit_delayed()
    }

    #[test]
    fn test_second_load_keeps_bound_instance() {
        let (sink, mut registry) = registry();
        registry.load_all(&Discovery::builtin(), &allow(&["settings"]));
        let bound = registry.find("settings").unwrap();

        let report = registry.load_all(&Discovery::builtin(), &allow(&["settings"]));
        assert!(report.registered.is_empty());
        assert_eq!(
            report.skipped,
            vec![("settings".to_string(), "already registered".to_string())]
        );
        assert!(Arc::ptr_eq(&registry.find("settings").unwrap(), &bound));

        let committed = update_blogname(&registry);
        assert_eq!(committed.written.len(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_duplicate_slug_from_extension_is_skipped() {
        let (sink, mut registry) = registry();
        let discovery = Discovery::builtin()
            .extend_with(|found| found.push(Arc::new(settings::connector())));

        let report = registry.load_all(&discovery, &allow(&["settings"]));
        assert_eq!(report.registered, vec!["settings"]);
        assert_eq!(
            report.skipped,
            vec![("settings".to_string(), "duplicate slug".to_string())]
        );
        assert_eq!(registry.dispatcher().bound_count("update_option"), 1);

        let committed = update_blogname(&registry);
        assert_eq!(committed.written.len(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_register_other_instance_keeps_bound_one() {
        let (sink, mut registry) = registry();
        let first = counting("things");
        registry.register(first.clone()).unwrap();
        assert!(!registry.register(counting("things")).unwrap());
        assert!(Arc::ptr_eq(&registry.find("things").unwrap(), &first));

        registry.fire("thing_deleted", &json!({}), &Actor::system());
        assert_eq!(registry.commit_delayed().written, vec![1]);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_set_active_switches_bindings() {
        let (sink, mut registry) = registry();
        registry.load_all(&Discovery::builtin(), &allow(&["users"]));

        let report = registry.set_active(&allow(&["settings", "ghost"]));
        assert_eq!(report.registered, vec!["settings"]);
        assert_eq!(report.unregistered, vec!["users"]);

        let fired = registry.fire("wp_login", &json!({ "user_id": 1 }), &Actor::system());
        assert_eq!(fired.invoked, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_reload_moves_connector_to_end() {
        let (_, mut registry) = registry();
        registry.register(counting("a")).unwrap();
        registry.register(counting("b")).unwrap();
        registry.reload("a").unwrap();
        assert_eq!(registry.registered(), &["b", "a"]);
        assert_eq!(registry.dispatcher().bound_count("thing_saved"), 2);
        assert!(matches!(
            registry.reload("zzz"),
            Err(RegistryError::UnknownConnector(_))
        ));
    }

    #[test]
    fn test_commit_delayed_across_connectors() {
        let (sink, mut registry) = registry();
        registry.register(counting("a")).unwrap();
        registry.register(counting("b")).unwrap();

        registry.fire("thing_deleted", &json!({}), &Actor::system());
        registry.fire("thing_deleted", &json!({}), &Actor::system());
        assert!(sink.is_empty());

        let report = registry.commit_delayed();
        assert_eq!(report.written, vec![1, 2]);
        let connectors: Vec<String> = sink.records().into_iter().map(|r| r.connector).collect();
        assert_eq!(connectors, vec!["a", "b"]);
    }

    #[test]
    fn test_labels_fall_back_to_slug() {
        let (_, mut registry) = registry();
        registry.register(counting("things")).unwrap();
        let labels = registry.labels();
        assert_eq!(labels.connector("things"), "THINGS");
        assert_eq!(labels.context("things"), "Things");
        assert_eq!(labels.action("unknown"), "unknown");
    }

    #[test]
    fn test_user_register_writes_one_record() {
        let (sink, mut registry) = registry();
        registry.load_all(&Discovery::builtin(), &allow(&["users", "settings"]));

        let admin = Actor::user(1, "administrator");
        let payload = json!({
            "user_id": 7,
            "user_login": "alice",
            "display_name": "Alice",
            "role": "editor",
        });
        let report = registry.fire("user_register", &payload, &admin);
        assert!(report.failures.is_empty());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].connector, "users");
        assert_eq!(records[0].action, "created");
        assert_eq!(records[0].object_id, Some(7));
    }
}
