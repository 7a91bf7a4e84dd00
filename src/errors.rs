//! Typed failures raised by the relay and its collaborators.

use std::time::Duration;

use thiserror::Error;

use crate::frame::FrameError;
use crate::models::ApiErrorBody;

/// Rejections from the request signature guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid password.")]
    InvalidPassword,
    #[error("Missing request signature.")]
    MissingSignature,
    #[error("Invalid signature.")]
    InvalidSignature,
    #[error("Request expired ({age:?} old, window is {window:?}).")]
    Expired { age: Duration, window: Duration },
    #[error("Request timestamp is too far in the future.")]
    FromFuture,
}

/// Failures talking to the assistant service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("assistant service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("assistant service request failed: {0}")]
    Network(String),
    #[error("failed to parse assistant service response: {0}")]
    Parse(String),
    #[error("assistant service I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Http { status: 404, .. })
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ServiceError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return ServiceError::Parse(err.to_string());
        }
        ServiceError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Parse(err.to_string())
    }
}

/// Errors raised while relaying a run to a client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: String },
    #[error("failed to start run: {0}")]
    RunStart(#[source] ServiceError),
    #[error("no active run for session '{session_id}'")]
    NoActiveRun { session_id: String },
    #[error("stream protocol error: {0}")]
    StreamProtocol(String),
    #[error("No assistant found for room '{room_id}'")]
    NoAssistantForRoom { room_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to send report: {0}")]
    Report(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<FrameError> for RelayError {
    fn from(err: FrameError) -> Self {
        RelayError::StreamProtocol(err.to_string())
    }
}

/// A tool failed in the client's execution environment. Never a protocol
/// failure: the message is forwarded to the assistant as the tool output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolExecutionError {
    pub message: String,
}

impl ToolExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The output string reported back to the assistant.
    #[must_use]
    pub fn as_tool_output(&self) -> String {
        format!("ERROR : {}", self.message)
    }
}

/// Failures seen by a relay client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay answered with a non-2xx status and an error body.
    #[error("{}", .0.message)]
    Api(ApiErrorBody),
    #[error("relay request failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] FrameError),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
