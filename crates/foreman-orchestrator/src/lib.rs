//! Task planning and plan execution for Foreman.
//!
//! A task goes through context recall, planning against the capability
//! registry, on-demand capability building, concurrent execution with
//! failure isolation, and learning extraction.
//!
//! # Main types
//!
//! - [`Orchestrator`] — End-to-end pipeline for a single task.
//! - [`Planner`] — Turns a task into a validated [`Plan`].
//! - [`Executor`] — Runs a plan's steps in dependency order with a bounded worker pool.
//! - [`LearningsExtractor`] — Records insights from finished runs.
//! - [`EventBus`] — Streams [`RunEvent`]s to observers.

/// End-to-end pipeline.
pub mod engine;
/// Historical duration estimates.
pub mod estimator;
/// Run progress events.
pub mod events;
/// Concurrent plan execution.
pub mod executor;
/// Learning extraction.
pub mod extractor;
/// Plan graph checks and queries.
pub mod graph;
/// Step lifecycle transitions.
pub mod lifecycle;
/// LLM-backed planning and capability binding.
pub mod planner;
/// Task, plan, step and report types.
pub mod types;

pub use engine::{Orchestrator, RunOutcome};
pub use estimator::TimeEstimator;
pub use events::{EventBus, Phase, RunEvent};
pub use executor::{Executor, ExecutorConfig};
pub use extractor::LearningsExtractor;
pub use lifecycle::StepEvent;
pub use planner::{Planner, PlannerConfig};
pub use types::{
    ExecutionReport, InputBinding, Plan, RunStatus, Step, StepBinding, StepId, StepResult,
    StepStatus, Task,
};
