//! Dependency-graph workflows of hand, task and condition steps.

pub mod condition;
pub mod definition;
pub mod engine;
pub mod task;

pub use definition::{
    list_templates, load_workflow, resolve_workflow, OnError, Step, StepKind, TemplateInfo,
    WorkflowDefinition,
};
pub use engine::{EngineSettings, StepStatus, StepSummary, WorkflowEngine, WorkflowSummary};
