//! Narrow interface to the generative-assistant service.
//!
//! The relay only needs a handful of operations: assistants (one per
//! session), threads, thread messages, runs, and file uploads. Run creation
//! and tool-output submission both answer with an event feed.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ServiceError;
use crate::models::{Role, ToolCallDescriptor, ToolOutput};

pub mod openai;
pub mod sse;

pub use openai::OpenAiAssistantClient;

/// Metadata key under which an assistant stores its conversation thread.
pub const THREAD_ID_METADATA_KEY: &str = "threadId";

/// Ordered feed of events for one run.
pub type EventFeed = Pin<Box<dyn Stream<Item = Result<AssistantEvent, ServiceError>> + Send>>;

// === Records ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantRecord {
    pub id: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AssistantRecord {
    /// Conversation thread bound to this assistant, if recorded.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.metadata
            .get(THREAD_ID_METADATA_KEY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateAssistantParams {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub tools: Vec<Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether a run in this status still occupies its thread.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::RequiresAction
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
}

/// Content of a message appended to a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    /// Text followed by a previously uploaded image file.
    TextWithImage { text: String, file_id: String },
}

// === Events ===

/// Content fragment of a `thread.message.delta` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaContent {
    Text(String),
    Unsupported { kind: String },
}

/// Typed event from a run's feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistantEvent {
    RunCreated {
        run_id: String,
    },
    MessageDelta {
        content: Vec<DeltaContent>,
    },
    RequiresAction {
        run_id: String,
        tool_calls: Vec<ToolCallDescriptor>,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        message: String,
    },
    RunCancelled {
        run_id: String,
    },
    RunExpired {
        run_id: String,
    },
    /// Lifecycle event carrying nothing a client needs.
    Ignored {
        event: String,
    },
    Error {
        message: String,
    },
    /// Event type this relay does not know about.
    Unhandled {
        event: String,
    },
}

// === Service ===

#[async_trait]
pub trait AssistantService: Send + Sync {
    async fn create_assistant(
        &self,
        params: CreateAssistantParams,
    ) -> Result<AssistantRecord, ServiceError>;

    async fn retrieve_assistant(&self, assistant_id: &str)
    -> Result<AssistantRecord, ServiceError>;

    /// Every assistant visible to the API key.
    async fn list_assistants(&self) -> Result<Vec<AssistantRecord>, ServiceError>;

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), ServiceError>;

    /// Create an empty thread and return its id.
    async fn create_thread(&self) -> Result<String, ServiceError>;

    async fn create_message(
        &self,
        thread_id: &str,
        role: Role,
        content: MessageContent,
    ) -> Result<(), ServiceError>;

    async fn list_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>, ServiceError>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ServiceError>;

    async fn create_run_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<EventFeed, ServiceError>;

    async fn submit_tool_outputs_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<EventFeed, ServiceError>;

    /// Upload a local file and return the service's file id.
    async fn upload_file(&self, path: &Path, purpose: &str) -> Result<String, ServiceError>;
}
