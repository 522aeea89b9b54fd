//! In-process event bus.
//!
//! A minimal publish/subscribe primitive that decouples "something happened"
//! (a hand finished, a trigger fired) from "react to it" (chained triggers,
//! status reporting).
//!
//! # Delivery guarantees
//!
//! - `emit` is synchronous: every listener registered for the event has run
//!   by the time `emit` returns, in registration order.
//! - A listener that returns an error or panics is logged and reported on the
//!   failure channel (see [`EventBus::failures`]); the remaining listeners still
//!   run and the bus stays usable.
//! - `once` listeners are detached before any listener of that emit runs, so a
//!   re-entrant `emit` of the same event from inside a listener never invokes
//!   them a second time.
//!
//! # Event Topics
//!
//! | Topic | Payload |
//! |-------|---------|
//! | `unit.complete` | `{hand, ok, duration_ms, error?}` after every run |
//! | `unit.error` | `{hand, error}` after a failed run |
//! | `trigger.fired` | `{hand, type, ...}` when a trigger starts a run |

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Emitted after every hand run settles.
pub const UNIT_COMPLETE: &str = "unit.complete";
/// Emitted after a hand run fails.
pub const UNIT_ERROR: &str = "unit.error";
/// Emitted when a trigger starts a hand run.
pub const TRIGGER_FIRED: &str = "trigger.fired";

/// Listener callback.
pub type Listener = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId(u64);

/// A listener that failed while handling an event.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerFailure {
    pub event: String,
    pub listener: ListenerId,
    pub message: String,
}

struct Registration {
    id: ListenerId,
    once: bool,
    callback: Listener,
}

/// Synchronous in-process event bus.
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
    failures: broadcast::Sender<ListenerFailure>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Registration>>> {
        // Listeners never run under the lock, so poisoning cannot leave partial state.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, event: &str, once: bool, callback: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, callback });
        tracing::trace!(event = %event, listener = id.0, once, "Listener registered");
        id
    }

    /// Register a listener for every emit of `event`.
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, false, Arc::new(callback))
    }

    /// Register a listener for the next emit of `event` only.
    pub fn once<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, true, Arc::new(callback))
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(registrations) = listeners.get_mut(event) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Emit an event to its listeners. Returns how many listeners ran.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<(ListenerId, Listener)> = {
            let mut listeners = self.lock();
            let Some(registrations) = listeners.get_mut(event) else {
                return 0;
            };
            let snapshot = registrations
                .iter()
                .map(|r| (r.id, Arc::clone(&r.callback)))
                .collect();
            registrations.retain(|r| !r.once);
            if registrations.is_empty() {
                listeners.remove(event);
            }
            snapshot
        };

        for (id, callback) in &snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(payload)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(&panic),
            };
            tracing::error!(event = %event, listener = id.0, error = %message, "Event listener failed");
            let _ = self.failures.send(ListenerFailure {
                event: event.to_string(),
                listener: *id,
                message,
            });
        }

        snapshot.len()
    }

    /// Serialize `payload` and emit it.
    pub fn emit_json<T: Serialize>(&self, event: &str, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit(event, &value),
            Err(e) => {
                tracing::error!(event = %event, error = %e, "Failed to serialize event payload");
                0
            }
        }
    }

    /// Events that currently have at least one listener, sorted.
    pub fn list_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.lock().keys().cloned().collect();
        events.sort();
        events
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Subscribe to listener failures.
    pub fn failures(&self) -> broadcast::Receiver<ListenerFailure> {
        self.failures.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}
