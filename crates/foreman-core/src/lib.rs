//! Core types and error definitions for the Foreman workspace.
//!
//! This crate provides the foundational types shared across all Foreman crates,
//! including error handling, failure classification, message representations,
//! atomic file writes and the small text utilities used for matching.
//!
//! # Main types
//!
//! - [`ForemanError`] — Unified error enum for all Foreman subsystems.
//! - [`ForemanResult`] — Convenience alias for `Result<T, ForemanError>`.
//! - [`ReasonCode`] — Machine-readable reason attached to every terminal failure.
//! - [`FailureDetail`] — Reason code plus a human-readable summary.
//! - [`Message`] — A single message exchanged with the language model.
//! - [`ToolCall`] — A structured tool invocation requested by the language model.

/// Error enum, reason codes and failure classification.
pub mod error;
/// Atomic file replacement and JSONL helpers.
pub mod fs;
/// Tokenizing, slugs and word-overlap similarity.
pub mod text;

pub use error::{ErrorClass, FailureDetail, ForemanError, ForemanResult, ReasonCode};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Message types ---

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The orchestrator speaking on behalf of the user.
    User,
    /// The language model.
    Assistant,
    /// A system-level instruction.
    System,
}

/// A single message exchanged with the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

// --- Tool types ---

/// A request from the language model to invoke a specific tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model for this call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments for the tool.
    pub arguments: serde_json::Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::assistant("ok").role, Role::Assistant);
        assert_eq!(Message::system("be brief").content, "be brief");
    }
}
