//! Familiar Common - Shared types and utilities for Familiar services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types
//! - Logging setup
//! - The in-process event bus
//! - Small string utilities

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use bus::{EventBus, ListenerFailure, ListenerId, TRIGGER_FIRED, UNIT_COMPLETE, UNIT_ERROR};
pub use config::{
    Config, HandsConfig, ObservabilityConfig, RunnerConfig, TriggersConfig, WorkflowConfig,
};
pub use error::{Error, Result};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::bus::EventBus;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
}
