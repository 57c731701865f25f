//! Session history, learnings and context recall for the Foreman pipeline.
//!
//! # Main types
//!
//! - [`SessionStore`] — Per-run metadata, transcript and summary on disk.
//! - [`LearningStore`] — Topic-indexed insights with near-duplicate suppression.
//! - [`ProjectFacts`] — Markdown facts from the project context directory.
//! - [`ContextAssembler`] — Builds the bounded [`MemoryContext`] handed to the planner.

/// Context assembly.
pub mod context;
/// Project fact files.
pub mod facts;
/// Learnings store.
pub mod learnings;
/// Session store.
pub mod session;
/// Transcript events.
pub mod transcript;

pub use context::{ContextAssembler, ContextConfig, MemoryContext, Snippet, SnippetSource};
pub use facts::{ProjectFact, ProjectFacts};
pub use learnings::{Learning, LearningStore, ScoredLearning, DEFAULT_DEDUP_THRESHOLD};
pub use session::{SessionDetail, SessionMeta, SessionStatus, SessionStore};
pub use transcript::{PlanStepNote, TranscriptEntry, TranscriptEvent};
