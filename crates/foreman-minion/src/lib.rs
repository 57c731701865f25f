//! Background workers ("minions") for Foreman.
//!
//! A minion is a task that runs the full orchestration pipeline on its own
//! schedule, in its own process. Its state lives in a `status.json` file
//! that the scheduler and the worker coordinate through; there is no other
//! shared state.
//!
//! # Main types
//!
//! - [`MinionRecord`] — Persisted status of one minion.
//! - [`MinionStore`] — Directory-per-minion store with locked compare-and-swap writes.
//! - [`Scheduler`] — Poll loop that fires due minions and fails silent ones.
//! - [`MinionRunner`] — Worker-side execution with heartbeats and kill detection.
//! - [`Launcher`] — Starts the worker process for a fired minion.

/// Scheduler and worker timing.
pub mod config;
/// Worker process launching.
pub mod launcher;
/// Minion records, schedules and windows.
pub mod record;
/// Worker-side run loop.
pub mod runner;
/// Poll loop.
pub mod scheduler;
/// Filesystem store.
pub mod store;
pub mod transition;

pub use config::MinionConfig;
pub use launcher::{Launcher, ProcessLauncher};
pub use record::{MinionRecord, MinionSpec, MinionStatus, Recurrence, Window};
pub use runner::{JobOutcome, MinionRunner, PipelineJob};
pub use scheduler::{PollReport, Scheduler};
pub use store::{MinionLogEntry, MinionStore};
