//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Typed listener registry for session, warning, and progress updates."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::channel::DataOrigin;
use crate::fallback::FallbackMode;
use crate::predictive::PredictiveWarning;
use crate::progress::ProgressState;
use crate::session::SessionSnapshot;

/// Observer of session manager output. Every method defaults to a no-op.
pub trait StreamListener: Send + Sync {
    fn on_state_change(&self, _snapshot: &SessionSnapshot) {}

    /// Receives the complete current warning set, which may be empty.
    fn on_predictive_warning(&self, _warnings: &[PredictiveWarning]) {}

    fn on_progress(&self, _topic: &str, _progress: &ProgressState) {}

    fn on_data(&self, _topic: &str, _payload: &serde_json::Value, _origin: DataOrigin) {}

    fn on_fallback_change(&self, _mode: FallbackMode) {}

    /// A high-availability session failed and needs attention.
    fn on_escalation(&self, _snapshot: &SessionSnapshot) {}
}

type ListenerMap = IndexMap<u64, Arc<dyn StreamListener>>;

/// Registration list in subscription order.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Arc<RwLock<ListenerMap>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays subscribed until the guard is dropped.
    #[must_use = "dropping the guard unsubscribes the listener"]
    pub fn subscribe(&self, listener: Arc<dyn StreamListener>) -> ListenerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, listener);
        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke `notify` on every listener. Panics are caught and logged so one
    /// faulty listener cannot starve the others or the caller.
    pub fn dispatch(&self, event: &'static str, notify: impl Fn(&dyn StreamListener)) {
        let listeners: Vec<(u64, Arc<dyn StreamListener>)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();
        for (id, listener) in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref())));
            if outcome.is_err() {
                tracing::error!(
                    target: "wardstream::listener",
                    listener = id,
                    event,
                    "listener panicked",
                );
            }
        }
    }

    pub fn state_change(&self, snapshot: &SessionSnapshot) {
        self.dispatch("state_change", |listener| listener.on_state_change(snapshot));
    }

    pub fn predictive_warning(&self, warnings: &[PredictiveWarning]) {
        self.dispatch("predictive_warning", |listener| {
            listener.on_predictive_warning(warnings)
        });
    }

    pub fn progress(&self, topic: &str, progress: &ProgressState) {
        self.dispatch("progress", |listener| listener.on_progress(topic, progress));
    }

    pub fn data(&self, topic: &str, payload: &serde_json::Value, origin: DataOrigin) {
        self.dispatch("data", |listener| listener.on_data(topic, payload, origin));
    }

    pub fn fallback_change(&self, mode: FallbackMode) {
        self.dispatch("fallback_change", |listener| listener.on_fallback_change(mode));
    }

    pub fn escalation(&self, snapshot: &SessionSnapshot) {
        self.dispatch("escalation", |listener| listener.on_escalation(snapshot));
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Unsubscribes its listener when dropped.
pub struct ListenerGuard {
    id: u64,
    listeners: Weak<RwLock<ListenerMap>>,
}

impl ListenerGuard {
    /// Keep the listener subscribed for the rest of the registry's lifetime.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().shift_remove(&self.id);
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}
