//! Shared error taxonomy across the relay server, assistant client, and
//! conversation client.

use crate::errors::{AuthError, RelayError, ServiceError};

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    InvalidInput,
    NotFound,
    Parse,
    Protocol,
    Tool,
    State,
    Internal,
}

/// Severity hint for UI and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            code: code.into(),
            message: message.into(),
        }
    }

    /// HTTP status used when this error ends a relay request.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.category {
            ErrorCategory::Authentication => 401,
            ErrorCategory::InvalidInput | ErrorCategory::Parse => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Network => 502,
            _ => 500,
        }
    }
}

impl From<&AuthError> for ErrorEnvelope {
    fn from(value: &AuthError) -> Self {
        let code = match value {
            AuthError::InvalidPassword => "auth_invalid_password",
            AuthError::MissingSignature => "auth_missing_signature",
            AuthError::InvalidSignature => "auth_invalid_signature",
            AuthError::Expired { .. } => "auth_expired",
            AuthError::FromFuture => "auth_from_future",
        };
        Self::new(
            ErrorCategory::Authentication,
            ErrorSeverity::Warning,
            false,
            code,
            value.to_string(),
        )
    }
}

impl From<&ServiceError> for ErrorEnvelope {
    fn from(value: &ServiceError) -> Self {
        match value {
            ServiceError::Http { status: 404, .. } => Self::new(
                ErrorCategory::NotFound,
                ErrorSeverity::Error,
                false,
                "service_not_found",
                value.to_string(),
            ),
            ServiceError::Http { status, .. } => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                true,
                format!("service_http_{status}"),
                value.to_string(),
            ),
            ServiceError::Network(_) => Self::new(
                ErrorCategory::Network,
                ErrorSeverity::Error,
                true,
                "service_network_error",
                value.to_string(),
            ),
            ServiceError::Parse(_) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                false,
                "service_parse_error",
                value.to_string(),
            ),
            ServiceError::Io(_) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                true,
                "service_io_error",
                value.to_string(),
            ),
        }
    }
}

impl From<&RelayError> for ErrorEnvelope {
    fn from(value: &RelayError) -> Self {
        match value {
            RelayError::Auth(err) => err.into(),
            RelayError::SessionNotFound { .. } => Self::new(
                ErrorCategory::NotFound,
                ErrorSeverity::Error,
                false,
                "session_not_found",
                value.to_string(),
            ),
            RelayError::RunStart(_) => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Error,
                true,
                "run_start_failed",
                value.to_string(),
            ),
            RelayError::NoActiveRun { .. } => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Info,
                false,
                "no_active_run",
                value.to_string(),
            ),
            RelayError::StreamProtocol(_) => Self::new(
                ErrorCategory::Protocol,
                ErrorSeverity::Error,
                true,
                "stream_protocol_error",
                value.to_string(),
            ),
            RelayError::NoAssistantForRoom { .. } => Self::new(
                ErrorCategory::NotFound,
                ErrorSeverity::Warning,
                false,
                "no_assistant_for_room",
                value.to_string(),
            ),
            RelayError::InvalidRequest(_) => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Warning,
                false,
                "invalid_request",
                value.to_string(),
            ),
            RelayError::Report(_) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                true,
                "report_failed",
                value.to_string(),
            ),
            RelayError::Service(err) => err.into(),
        }
    }
}
