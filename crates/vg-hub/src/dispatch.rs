//! # Event Dispatcher
//!
//! Named-event hook table. Hooks bound to an event run in bind order each
//! time it fires. A failing or panicking hook is logged and reported but
//! never stops the hooks after it.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use vg_core::Actor;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// A bound callback.
pub type Hook = Arc<dyn Fn(&Invocation<'_>) -> Result<(), HookError> + Send + Sync>;

/// What a hook sees when its event fires.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub event: &'a str,
    pub payload: &'a Value,
    pub actor: &'a Actor,
}

/// Opaque binding handle returned by [`Dispatcher::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

/// Outcome of one [`Dispatcher::fire`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FireReport {
    pub event: String,
    pub invoked: usize,
    pub failures: Vec<String>,
}

#[derive(Default)]
pub struct Dispatcher {
    next_handle: u64,
    bindings: HashMap<String, Vec<(HandleId, Hook)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, event: &str, hook: Hook) -> HandleId {
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.bindings
            .entry(event.to_string())
            .or_default()
            .push((handle, hook));
        handle
    }

    /// Remove one binding. Returns false if it was not bound.
    pub fn unbind(&mut self, event: &str, handle: HandleId) -> bool {
        let Some(hooks) = self.bindings.get_mut(event) else {
            return false;
        };
        let before = hooks.len();
        hooks.retain(|(id, _)| *id != handle);
        let removed = hooks.len() != before;
        if hooks.is_empty() {
            self.bindings.remove(event);
        }
        removed
    }

    /// Run every hook bound to `event`. Unbound events are a no-op.
    pub fn fire(&self, event: &str, payload: &Value, actor: &Actor) -> FireReport {
        let mut report = FireReport {
            event: event.to_string(),
            ..FireReport::default()
        };
        let Some(hooks) = self.bindings.get(event) else {
            return report;
        };

        let invocation = Invocation {
            event,
            payload,
            actor,
        };
        for (handle, hook) in hooks {
            report.invoked += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(&invocation)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "hook panicked".to_string(),
            };
            tracing::error!("Hook {:?} for '{}' failed: {}", handle, event, failure);
            report.failures.push(failure);
        }
        report
    }

    pub fn bound_count(&self, event: &str) -> usize {
        self.bindings.get(event).map_or(0, Vec::len)
    }

    pub fn is_bound(&self, event: &str, handle: HandleId) -> bool {
        self.bindings
            .get(event)
            .is_some_and(|hooks| hooks.iter().any(|(id, _)| *id == handle))
    }

    /// Total number of live bindings across all events.
    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Hook {
        let log = log.clone();
        Arc::new(move |inv: &Invocation<'_>| -> Result<(), HookError> {
            log.lock().unwrap().push(format!("{name}:{}", inv.event));
            Ok(())
        })
    }

    #[test]
    fn test_hooks_fire_in_bind_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.bind("save", recorder(&log, "a"));
        dispatcher.bind("save", recorder(&log, "b"));
        dispatcher.bind("other", recorder(&log, "c"));

        let report = dispatcher.fire("save", &Value::Null, &Actor::system());
        assert_eq!(report.invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:save", "b:save"]);
    }

    #[test]
    fn test_unbound_event_is_noop() {
        let dispatcher = Dispatcher::new();
        let report = dispatcher.fire("nothing", &Value::Null, &Actor::system());
        assert_eq!(report.invoked, 0);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_unbind_removes_only_that_binding() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let a = dispatcher.bind("save", recorder(&log, "a"));
        let b = dispatcher.bind("save", recorder(&log, "b"));

        assert!(dispatcher.unbind("save", a));
        assert!(!dispatcher.unbind("save", a));
        assert!(dispatcher.is_bound("save", b));
        assert_eq!(dispatcher.bound_count("save"), 1);

        assert!(dispatcher.unbind("save", b));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_failing_hook_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.bind(
            "save",
            Arc::new(|_: &Invocation<'_>| -> Result<(), HookError> { Err("boom".into()) }),
        );
        dispatcher.bind(
            "save",
            Arc::new(|_: &Invocation<'_>| -> Result<(), HookError> { panic!("kaboom") }),
        );
        dispatcher.bind("save", recorder(&log, "after"));

        let report = dispatcher.fire("save", &Value::Null, &Actor::system());
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failures, vec!["boom", "hook panicked"]);
        assert_eq!(*log.lock().unwrap(), vec!["after:save"]);
    }
}
