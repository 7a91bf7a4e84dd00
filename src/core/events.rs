//! Events emitted by a conversation to whatever renders it.
//!
//! These flow over a channel so the renderer never blocks stream
//! consumption.

use serde_json::Value;

use crate::models::ApiErrorBody;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The stream ended and the reply was archived.
    Archived,
    /// Stopped by the user; partial text was archived.
    Aborted,
    /// The relay or the transport failed.
    Errored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    // === Turn Lifecycle ===
    TurnStarted,

    /// Narration appended to the in-progress reply
    TextDelta { content: String },

    // === Tool Events ===
    ToolCallStarted { id: String, name: String },

    /// The tool finished and its output was handed to the relay
    ToolCallFinished {
        id: String,
        name: String,
        output: Value,
        success: bool,
    },

    /// The turn is over
    TurnComplete {
        outcome: TurnOutcome,
        error: Option<ApiErrorBody>,
    },

    // === System Events ===
    /// Something went wrong outside the turn itself
    Warning { message: String },
}

impl ConversationEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        ConversationEvent::Warning {
            message: message.into(),
        }
    }
}
