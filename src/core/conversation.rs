//! Conversation state machine for relay clients.
//!
//! A [`Conversation`] owns the message list, drives one run at a time
//! through a [`RelayTransport`], decodes the framed body, and hands tool
//! calls to a [`ToolExecutor`] without blocking the stream.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ByteStream, RelayTransport};
use crate::core::events::{ConversationEvent, TurnOutcome};
use crate::errors::ClientError;
use crate::executor::ToolExecutor;
use crate::frame::{Frame, FrameDecoder};
use crate::logging;
use crate::models::{
    ApiErrorBody, ChatMessage, CreateSessionRequest, ReportRequest, Role, ToolCallDescriptor,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Model families that take the system prompt as a leading message.
const SYSTEM_MESSAGE_MODEL_PREFIX: &str = "gpt";

#[derive(Debug, Clone, Default)]
pub struct ConversationSettings {
    pub model: String,
    pub system_prompt: String,
    /// Assistant greeting shown first and restored by `clear`.
    pub intro: Option<String>,
    pub room_id: Option<String>,
    pub use_tools: bool,
    /// Resume an existing relay session instead of creating one.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    AwaitingFirstToken,
    Streaming,
    /// The last turn failed; the error stays visible until dismissed or
    /// retried.
    Errored,
}

/// Stops the in-flight turn from another task.
#[derive(Clone)]
pub struct StopHandle {
    cancel_token: Arc<StdMutex<CancellationToken>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

enum StreamStep {
    Chunk(Bytes),
    Failed(ClientError),
    Ended,
    Stopped,
}

pub struct Conversation {
    transport: Arc<dyn RelayTransport>,
    executor: Arc<dyn ToolExecutor>,
    tx_event: mpsc::Sender<ConversationEvent>,
    settings: ConversationSettings,
    session_id: String,
    messages: Vec<ChatMessage>,
    /// Reply being streamed.
    current: String,
    state: ConversationState,
    error: Option<ApiErrorBody>,
    cancel_token: Arc<StdMutex<CancellationToken>>,
    tool_tasks: Vec<JoinHandle<()>>,
}

impl Conversation {
    /// Create (or resume) the relay session and return the conversation with
    /// its event receiver.
    pub async fn connect(
        transport: Arc<dyn RelayTransport>,
        executor: Arc<dyn ToolExecutor>,
        settings: ConversationSettings,
    ) -> Result<(Self, mpsc::Receiver<ConversationEvent>), ClientError> {
        let session_id = transport
            .create_session(&CreateSessionRequest {
                session_id: settings.session_id.clone(),
                model: Some(settings.model.clone()).filter(|m| !m.is_empty()),
                system_prompt: settings.system_prompt.clone(),
                use_tool: settings.use_tools,
                id: settings.room_id.clone(),
            })
            .await?;
        logging::info(format!("Connected to relay session {session_id}"));

        let (tx_event, rx_event) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut conversation = Self {
            transport,
            executor,
            tx_event,
            settings,
            session_id,
            messages: Vec::new(),
            current: String::new(),
            state: ConversationState::Idle,
            error: None,
            cancel_token: Arc::new(StdMutex::new(CancellationToken::new())),
            tool_tasks: Vec::new(),
        };
        conversation.reset_messages();
        Ok((conversation, rx_event))
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.state
    }

    #[must_use]
    pub fn error(&self) -> Option<&ApiErrorBody> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel_token: Arc::clone(&self.cancel_token),
        }
    }

    /// Append a user message and run a turn.
    pub async fn send(&mut self, text: impl Into<String>) -> TurnOutcome {
        self.messages.push(ChatMessage::user(text));
        self.run_turn().await
    }

    /// Resend the last user message, dropping the reply that followed it.
    ///
    /// Returns `None` when there is no user message to resend.
    pub async fn retry(&mut self) -> Option<TurnOutcome> {
        let len = self.messages.len();
        match self.messages.last().map(|m| m.role) {
            Some(Role::User) => {}
            Some(Role::Assistant) if len >= 2 && self.messages[len - 2].role == Role::User => {
                self.messages.pop();
            }
            _ => return None,
        }
        Some(self.run_turn().await)
    }

    /// Forget the conversation, keeping only the intro.
    pub fn clear(&mut self) {
        self.reset_messages();
        self.current.clear();
        self.error = None;
        self.state = ConversationState::Idle;
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
        if self.state == ConversationState::Errored {
            self.state = ConversationState::Idle;
        }
    }

    /// Transcript in `Role: content` lines, as attached to reports.
    #[must_use]
    pub fn chat_log(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}{}", m.role.transcript_prefix(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// System prompt followed by every message, as a JSON array.
    #[must_use]
    pub fn export_json(&self) -> Value {
        let mut entries = vec![json!({
            "role": Role::System.as_str(),
            "content": self.settings.system_prompt,
        })];
        entries.extend(
            self.messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
        );
        Value::Array(entries)
    }

    pub async fn send_report(&self, user_message: impl Into<String>) -> Result<(), ClientError> {
        self.transport
            .send_report(&ReportRequest {
                user_message: user_message.into(),
                chat_log: self.chat_log(),
                current_model: self.settings.model.clone(),
                system_prompt: self.settings.system_prompt.clone(),
            })
            .await
    }

    /// Wait until every dispatched tool has reported its output.
    pub async fn wait_for_tools(&mut self) {
        for task in self.tool_tasks.drain(..) {
            if let Err(err) = task.await {
                logging::warn(format!("Tool task failed: {err}"));
            }
        }
    }

    fn reset_messages(&mut self) {
        self.messages = self
            .settings
            .intro
            .as_ref()
            .filter(|intro| !intro.is_empty())
            .map(|intro| vec![ChatMessage::assistant(intro.clone())])
            .unwrap_or_default();
    }

    fn fresh_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Messages sent with a generate request.
    fn outbound_messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.messages.clone();
        if !self.settings.system_prompt.is_empty()
            && self.settings.model.starts_with(SYSTEM_MESSAGE_MODEL_PREFIX)
        {
            messages.insert(0, ChatMessage::system(self.settings.system_prompt.clone()));
        }
        messages
    }

    async fn emit(&self, event: ConversationEvent) {
        let _ = self.tx_event.send(event).await;
    }

    async fn run_turn(&mut self) -> TurnOutcome {
        self.error = None;
        self.current.clear();
        self.state = ConversationState::AwaitingFirstToken;
        let token = self.fresh_cancel_token();
        self.emit(ConversationEvent::TurnStarted).await;

        let transport = Arc::clone(&self.transport);
        let session_id = self.session_id.clone();
        let model = self.settings.model.clone();
        let request = self.outbound_messages();
        let started = tokio::select! {
            biased;
            () = token.cancelled() => None,
            result = transport.generate(&session_id, &model, &request) => Some(result),
        };
        let stream = match started {
            None => return self.finish_turn(TurnOutcome::Aborted, None).await,
            Some(Err(err)) => {
                return self
                    .finish_turn(TurnOutcome::Errored, Some(error_body(err)))
                    .await;
            }
            Some(Ok(stream)) => stream,
        };
        self.consume(stream, &token).await
    }

    async fn consume(&mut self, mut stream: ByteStream, token: &CancellationToken) -> TurnOutcome {
        let mut decoder = FrameDecoder::new();
        loop {
            let step = tokio::select! {
                biased;
                () = token.cancelled() => StreamStep::Stopped,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => StreamStep::Chunk(bytes),
                    Some(Err(err)) => StreamStep::Failed(err),
                    None => StreamStep::Ended,
                },
            };

            let frames = match step {
                StreamStep::Chunk(bytes) => decoder.push(&bytes),
                StreamStep::Ended => {
                    let frames = decoder.finish();
                    match frames {
                        Ok(frames) => {
                            self.apply_frames(frames).await;
                            return self.finish_turn(TurnOutcome::Archived, None).await;
                        }
                        Err(err) => Err(err),
                    }
                }
                StreamStep::Failed(err) => {
                    return self.finish_turn(TurnOutcome::Errored, Some(error_body(err))).await;
                }
                StreamStep::Stopped => {
                    logging::info("Turn stopped by user");
                    return self.finish_turn(TurnOutcome::Aborted, None).await;
                }
            };

            match frames {
                Ok(frames) => self.apply_frames(frames).await,
                Err(err) => {
                    let err = ClientError::Protocol(err);
                    return self.finish_turn(TurnOutcome::Errored, Some(error_body(err))).await;
                }
            }
        }
    }

    async fn apply_frames(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Text(text) => self.apply_text(text).await,
                Frame::ToolCall(call) => self.apply_tool_call(call).await,
            }
        }
    }

    async fn apply_text(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        // The service repeats trailing newlines as lone chunks.
        if text == "\n" && self.current.ends_with('\n') {
            return;
        }
        self.state = ConversationState::Streaming;
        self.current.push_str(&text);
        self.emit(ConversationEvent::TextDelta { content: text }).await;
    }

    async fn apply_tool_call(&mut self, call: ToolCallDescriptor) {
        if !call.is_function() {
            logging::warn(format!(
                "Ignoring tool call {} of type '{}'",
                call.id, call.call_type
            ));
            return;
        }
        self.state = ConversationState::Streaming;
        let marker = format!(" \n **Executing Function: {}** \n", call.function_name());
        self.current.push_str(&marker);
        self.emit(ConversationEvent::ToolCallStarted {
            id: call.id.clone(),
            name: call.function_name().to_string(),
        })
        .await;
        self.emit(ConversationEvent::TextDelta { content: marker })
            .await;
        self.dispatch_tool(call);
    }

    fn dispatch_tool(&mut self, call: ToolCallDescriptor) {
        let transport = Arc::clone(&self.transport);
        let executor = Arc::clone(&self.executor);
        let tx_event = self.tx_event.clone();
        let session_id = self.session_id.clone();

        self.tool_tasks.retain(|task| !task.is_finished());
        self.tool_tasks.push(tokio::spawn(async move {
            let result = executor.execute(&call).await;
            let success = result.is_ok();
            let output = result.unwrap_or_else(|err| {
                logging::warn(format!("Tool '{}' failed: {err}", call.function_name()));
                Value::String(err.as_tool_output())
            });

            if let Err(err) = transport
                .notify_call(&session_id, &call.id, output.clone())
                .await
            {
                let message = format!("Failed to report tool output {}: {err}", call.id);
                logging::warn(&message);
                let _ = tx_event.send(ConversationEvent::warning(message)).await;
            }
            let _ = tx_event
                .send(ConversationEvent::ToolCallFinished {
                    id: call.id.clone(),
                    name: call.function_name().to_string(),
                    output,
                    success,
                })
                .await;
        }));
    }

    async fn finish_turn(
        &mut self,
        outcome: TurnOutcome,
        error: Option<ApiErrorBody>,
    ) -> TurnOutcome {
        if !self.current.is_empty() {
            let reply = std::mem::take(&mut self.current);
            self.messages.push(ChatMessage::assistant(reply));
        }
        if let Some(error) = error.as_ref() {
            logging::warn(format!("Turn failed: {}", error.message));
        }
        self.state = if error.is_some() {
            ConversationState::Errored
        } else {
            ConversationState::Idle
        };
        self.error = error.clone();
        self.emit(ConversationEvent::TurnComplete { outcome, error })
            .await;
        outcome
    }
}

fn error_body(err: ClientError) -> ApiErrorBody {
    match err {
        ClientError::Api(body) => body,
        other => ApiErrorBody {
            message: other.to_string(),
            status: None,
            code: None,
        },
    }
}
