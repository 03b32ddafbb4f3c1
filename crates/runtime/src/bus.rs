//! Pattern-matched publish/subscribe.
//!
//! An `EventBus` is an explicit instance owned by the session or process
//! context and handed to the components that need it — there is no ambient
//! global registry.  Patterns use `*` / `?` glob wildcards matched against
//! the published event type.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use globset::{Glob, GlobMatcher};
use serde_json::Value;
use tracing::warn;

type Handler = Arc<dyn Fn(&str, &Value) -> Result<()> + Send + Sync>;

struct Subscriber {
    pattern: String,
    matcher: GlobMatcher,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every published type matching `pattern`.
    /// Errors only on an invalid glob.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&str, &Value) -> Result<()> + Send + Sync + 'static,
    {
        let matcher = Glob::new(pattern)?.compile_matcher();
        self.lock().push(Subscriber {
            pattern: pattern.to_string(),
            matcher,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Invoke every handler whose pattern matches `kind`.
    ///
    /// A failing handler is logged and skipped; it never prevents the
    /// remaining handlers from running.  Handlers run with the lock
    /// released, so a handler may publish or subscribe re-entrantly, and
    /// a panicking handler cannot poison the bus for later callers.
    pub fn publish(&self, kind: &str, payload: &Value) {
        let matched: Vec<(String, Handler)> = self
            .lock()
            .iter()
            .filter(|sub| sub.matcher.is_match(kind))
            .map(|sub| (sub.pattern.clone(), sub.handler.clone()))
            .collect();
        for (pattern, handler) in matched {
            if let Err(err) = handler(kind, payload) {
                warn!(pattern = %pattern, kind, ?err, "event bus handler failed");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        // The subscriber list is never left mid-mutation, so a poisoned
        // lock is still a consistent list.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
