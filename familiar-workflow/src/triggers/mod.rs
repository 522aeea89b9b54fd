//! Event-driven triggers.
//!
//! Trigger types:
//! - `file_change`: debounced filesystem watch
//! - `webhook`: POST route on the shared webhook server
//! - `threshold`: polled metric with edge detection
//! - `hand_complete`: chain off another hand's `unit.complete`
//! - `schedule`: declared for symmetry, the cron scheduler owns it

pub mod definition;
pub mod file_watch;
pub mod manager;
pub mod threshold;
pub mod webhook;

pub use definition::{TriggerDef, TriggerKind};
pub use file_watch::{Debouncer, FileWatcher};
pub use manager::{FireResult, TriggerInfo, TriggerManager, TriggerSettings};
pub use threshold::{resolve_metric, ThresholdDetector};
pub use webhook::{webhook_router, RouteTable, WebhookRoute, WebhookServer, WebhookState};
