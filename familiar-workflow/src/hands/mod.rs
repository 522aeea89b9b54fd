//! Hands: manifest-defined autonomous units of work.
//!
//! A hand is a directory under the hands dir holding a `HAND.json`
//! manifest (phases, optional cron schedule, metrics, guardrails and
//! triggers). Runtime state for every hand lives in one JSON state file
//! owned by the [`HandRegistry`].

pub mod manifest;
pub mod registry;
pub mod runner;
pub mod state;

pub use manifest::{
    discover_hands, Guardrails, HandManifest, MetricDecl, MetricKind, OnFail, Phase, ScheduleSpec,
    MANIFEST_FILE,
};
pub use registry::{HandEntry, HandRegistry, HandSummary, RunRecord, ScheduledHand, INTERRUPTED};
pub use runner::{execute_hand, AgentRunner, HandRunner, RunOptions, RunOutcome};
pub use state::{HandState, HandStatus, StateStore};
