// Workflow Automation Engine
//
// Event- and cron-driven runs over a graph of steps, each step executing an
// ordered list of typed actions.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod sandbox;
pub mod template;
pub mod triggers;

pub use actions::ActionOutcome;
pub use engine::{EngineConfig, WorkflowEngine};
pub use executor::WorkflowExecutor;
pub use sandbox::{ScriptError, ScriptSandbox};
pub use triggers::{dispatch_events, TriggerMatcher};
