//! Session registry: sessions, their live run, and room attachments.
//!
//! The registry is the only cross-session shared state in the relay. It
//! guarantees that at most one [`RunContext`] exists per session: inserting a
//! new context replaces (and closes) any previous one under the same lock.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::assistant::{
    AssistantRecord, AssistantService, CreateAssistantParams, THREAD_ID_METADATA_KEY,
};
use crate::config::{Config, load_tool_definitions};
use crate::errors::RelayError;
use crate::frame::{Frame, FrameError};
use crate::logging;
use crate::models::{ChatMessage, ToolOutput};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// === Output sink ===

/// Item carried to the HTTP response body.
pub type SinkItem = Result<Bytes, io::Error>;

/// Single live handle that writes frames to one response body.
///
/// Closing is idempotent. A closed sink drops every later write, and a
/// writer blocked on a full channel is released by `close`.
#[derive(Clone)]
pub struct OutputSink {
    sender: Arc<Mutex<Option<mpsc::Sender<SinkItem>>>>,
    closed: CancellationToken,
}

impl OutputSink {
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SinkItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            closed: CancellationToken::new(),
        };
        (sink, rx)
    }

    /// Write raw bytes. Returns `false` once the sink is closed or the
    /// receiving side has gone away.
    pub async fn write(&self, bytes: impl Into<Bytes>) -> bool {
        self.send(Ok(bytes.into())).await
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<bool, FrameError> {
        let bytes = frame.encode()?;
        Ok(self.write(bytes).await)
    }

    /// End the body with an error visible to the reader, then close.
    pub async fn fail(&self, message: impl Into<String>) {
        let _ = self.send(Err(io::Error::other(message.into()))).await;
        self.close();
    }

    /// Close the sink. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let was_open = lock(&self.sender).take().is_some();
        self.closed.cancel();
        was_open
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn send(&self, item: SinkItem) -> bool {
        let Some(sender) = lock(&self.sender).clone() else {
            return false;
        };
        tokio::select! {
            result = sender.send(item) => result.is_ok(),
            () = self.closed.cancelled() => false,
        }
    }
}

// === Sessions ===

/// One logical conversation bound to an assistant and its thread.
#[derive(Debug)]
pub struct Session {
    /// Opaque session identifier handed to clients (the assistant id).
    pub id: String,
    pub thread_id: String,
    pub model: String,
    pub system_prompt: String,
    pub tools_enabled: bool,
    pub room_id: Option<String>,
    pub created_at: DateTime<Utc>,
    history_seeded: AtomicBool,
    /// Messages appended since the last run started; a retried start
    /// skips them instead of appending them twice.
    unanswered: Mutex<Vec<ChatMessage>>,
}

impl Session {
    /// Rebuild a session from a service-side assistant, e.g. after a restart.
    fn from_record(record: &AssistantRecord) -> Option<Self> {
        let thread_id = record.thread_id()?.to_string();
        Some(Self {
            id: record.id.clone(),
            thread_id,
            model: record.model.clone(),
            system_prompt: String::new(),
            tools_enabled: false,
            room_id: None,
            created_at: Utc
                .timestamp_opt(record.created_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            history_seeded: AtomicBool::new(true),
            unanswered: Mutex::new(Vec::new()),
        })
    }

    /// Whether the thread already holds the client's earlier history.
    #[must_use]
    pub fn history_seeded(&self) -> bool {
        self.history_seeded.load(Ordering::SeqCst)
    }

    pub fn mark_history_seeded(&self) {
        self.history_seeded.store(true, Ordering::SeqCst);
    }

    /// How many leading entries of `pending` the thread already holds from
    /// a start attempt that never produced a run: the longest prefix of
    /// `pending` that ends the appended record.
    #[must_use]
    pub fn already_appended(&self, pending: &[&ChatMessage]) -> usize {
        let unanswered = lock(&self.unanswered);
        (1..=unanswered.len().min(pending.len()))
            .rev()
            .find(|&len| {
                unanswered[unanswered.len() - len..]
                    .iter()
                    .zip(&pending[..len])
                    .all(|(appended, message)| appended == *message)
            })
            .unwrap_or(0)
    }

    pub fn record_appended(&self, message: &ChatMessage) {
        lock(&self.unanswered).push(message.clone());
    }

    /// A run started, so the appended messages are now part of its input.
    pub fn clear_appended(&self) {
        lock(&self.unanswered).clear();
    }
}

/// Parameters of a session creation request.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Existing session the client wants to resume.
    pub requested_id: Option<String>,
    pub model: Option<String>,
    pub system_prompt: String,
    pub tools_enabled: bool,
    pub room_id: Option<String>,
}

// === Runs ===

/// Outcome of recording one tool output against the pending batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolBatch {
    /// Every announced call has an output; submit these together.
    Ready(Vec<ToolOutput>),
    Waiting { missing: usize },
}

#[derive(Debug, Default)]
struct PendingTools {
    announced: Vec<String>,
    outputs: Vec<ToolOutput>,
}

/// Live state of one run, owned by the orchestrator while it streams.
pub struct RunContext {
    pub session_id: String,
    pub thread_id: String,
    generation: u64,
    run_id: Mutex<Option<String>>,
    sink: OutputSink,
    tools: Mutex<PendingTools>,
    images: Mutex<Vec<String>>,
    feed_lock: Arc<tokio::sync::Mutex<()>>,
}

impl RunContext {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn run_id(&self) -> Option<String> {
        lock(&self.run_id).clone()
    }

    pub fn set_run_id(&self, run_id: impl Into<String>) {
        *lock(&self.run_id) = Some(run_id.into());
    }

    #[must_use]
    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Serializes writers: only the holder may drain a feed into the sink.
    pub async fn lock_feed(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.feed_lock).lock_owned().await
    }

    /// Remember an uploaded image to show the assistant once the current
    /// tool-output batch has been processed.
    pub fn stash_image(&self, file_id: impl Into<String>) {
        lock(&self.images).push(file_id.into());
    }

    pub fn take_images(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.images))
    }

    /// Record the tool calls announced by a `requires_action` event.
    pub fn expect_tool_calls<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tools = lock(&self.tools);
        for id in ids {
            let id = id.into();
            if !tools.announced.contains(&id) {
                tools.announced.push(id);
            }
        }
    }

    /// Buffer one output until the announced batch is complete. Outputs for
    /// calls never announced are released immediately.
    pub fn record_tool_output(&self, output: ToolOutput) -> ToolBatch {
        let mut tools = lock(&self.tools);
        if !tools.announced.contains(&output.tool_call_id) {
            return ToolBatch::Ready(vec![output]);
        }

        tools
            .outputs
            .retain(|existing| existing.tool_call_id != output.tool_call_id);
        tools.outputs.push(output);

        let missing = tools
            .announced
            .iter()
            .filter(|id| !tools.outputs.iter().any(|o| &o.tool_call_id == *id))
            .count();
        if missing > 0 {
            return ToolBatch::Waiting { missing };
        }

        tools.announced.clear();
        ToolBatch::Ready(std::mem::take(&mut tools.outputs))
    }
}

// === Registry ===

/// Settings applied to every assistant the registry creates.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub assistant_name: String,
    pub default_model: String,
    pub default_instructions: String,
    /// Tool definitions attached when a session enables tools.
    pub tools: Vec<Value>,
    pub resource_max_age: Duration,
    pub sink_capacity: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let tools = match config.tools_file() {
            Some(path) => load_tool_definitions(&path)?,
            None => Vec::new(),
        };
        Ok(Self {
            assistant_name: config.assistant_name(),
            default_model: config.default_model(),
            default_instructions: config.default_instructions(),
            tools,
            resource_max_age: config.resource_max_age(),
            sink_capacity: config.sink_capacity(),
        })
    }
}

/// Summary of one stale-resource sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SessionRegistry {
    service: Arc<dyn AssistantService>,
    settings: RegistrySettings,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    runs: Mutex<HashMap<String, Arc<RunContext>>>,
    rooms: RwLock<HashMap<String, Vec<String>>>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new(service: Arc<dyn AssistantService>, settings: RegistrySettings) -> Self {
        Self {
            service,
            settings,
            sessions: RwLock::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<dyn AssistantService> {
        &self.service
    }

    #[must_use]
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Create a session, or resume `requested_id` when the service still
    /// knows it. Kicks off a background sweep of stale assistants.
    pub async fn create(&self, request: NewSession) -> Result<Arc<Session>, RelayError> {
        if let Some(requested) = request.requested_id.as_deref().filter(|id| !id.is_empty()) {
            match self.resolve(requested).await {
                Ok(session) => {
                    if let Some(room_id) = request.room_id.as_deref() {
                        self.attach_room(room_id, &session.id);
                    }
                    logging::info(format!("Resumed session {}", session.id));
                    return Ok(session);
                }
                Err(err) => {
                    logging::info(format!(
                        "Session {requested} cannot be resumed ({err}); creating a new one"
                    ));
                }
            }
        }

        self.spawn_sweep();

        let thread_id = self.service.create_thread().await?;
        let model = request
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());
        let instructions = if request.system_prompt.trim().is_empty() {
            self.settings.default_instructions.clone()
        } else {
            request.system_prompt.clone()
        };
        let mut metadata = Map::new();
        metadata.insert(
            THREAD_ID_METADATA_KEY.to_string(),
            Value::String(thread_id.clone()),
        );

        let record = self
            .service
            .create_assistant(CreateAssistantParams {
                name: self.settings.assistant_name.clone(),
                instructions,
                model: model.clone(),
                tools: if request.tools_enabled {
                    self.settings.tools.clone()
                } else {
                    Vec::new()
                },
                metadata,
            })
            .await?;

        let session = Arc::new(Session {
            id: record.id,
            thread_id,
            model,
            system_prompt: request.system_prompt,
            tools_enabled: request.tools_enabled,
            room_id: request.room_id.clone(),
            created_at: Utc::now(),
            history_seeded: AtomicBool::new(false),
            unanswered: Mutex::new(Vec::new()),
        });

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), Arc::clone(&session));
        if let Some(room_id) = request.room_id.as_deref() {
            self.attach_room(room_id, &session.id);
        }

        logging::info(format!(
            "Created session {} (thread {}, model {}, tools {})",
            session.id, session.thread_id, session.model, session.tools_enabled
        ));
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Local lookup, falling back to the service for sessions created by an
    /// earlier process.
    pub async fn resolve(&self, session_id: &str) -> Result<Arc<Session>, RelayError> {
        if let Some(session) = self.get(session_id) {
            return Ok(session);
        }

        let not_found = || RelayError::SessionNotFound {
            session_id: session_id.to_string(),
        };
        let record = self
            .service
            .retrieve_assistant(session_id)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    not_found()
                } else {
                    RelayError::Service(err)
                }
            })?;
        let session = Session::from_record(&record).ok_or_else(not_found)?;

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .entry(session.id.clone())
            .or_insert_with(|| Arc::new(session));
        Ok(Arc::clone(session))
    }

    pub fn attach_room(&self, room_id: &str, session_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let attached = rooms.entry(room_id.to_string()).or_default();
        if !attached.iter().any(|id| id == session_id) {
            attached.push(session_id.to_string());
        }
    }

    #[must_use]
    pub fn sessions_for_room(&self, room_id: &str) -> Vec<Arc<Session>> {
        let ids = self
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    #[must_use]
    pub fn active_run(&self, session_id: &str) -> Option<Arc<RunContext>> {
        lock(&self.runs).get(session_id).cloned()
    }

    /// Build an unregistered run context for `session` plus the receiving
    /// end of its sink.
    #[must_use]
    pub fn open_run(&self, session: &Session) -> (Arc<RunContext>, mpsc::Receiver<SinkItem>) {
        let (sink, rx) = OutputSink::channel(self.settings.sink_capacity);
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let context = Arc::new(RunContext {
            session_id: session.id.clone(),
            thread_id: session.thread_id.clone(),
            generation,
            run_id: Mutex::new(None),
            sink,
            tools: Mutex::new(PendingTools::default()),
            images: Mutex::new(Vec::new()),
            feed_lock: Arc::new(tokio::sync::Mutex::new(())),
        });
        (context, rx)
    }

    /// Make `context` the session's only run. A context that slipped in
    /// since the caller's eviction is closed and its run cancelled.
    pub fn register_run(&self, context: Arc<RunContext>) {
        let displaced = lock(&self.runs).insert(context.session_id.clone(), context);
        if let Some(previous) = displaced {
            logging::warn(format!(
                "Displacing run context {} for session {}",
                previous.generation, previous.session_id
            ));
            previous.sink.close();
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                cancel_run_logged(service.as_ref(), &previous).await;
            });
        }
    }

    /// Close and remove the session's run context, cancelling its run.
    /// Returns whether a context was evicted; calling again is a no-op.
    pub async fn evict_run(&self, session_id: &str) -> bool {
        let Some(context) = lock(&self.runs).remove(session_id) else {
            return false;
        };
        context.sink.close();
        cancel_run_logged(self.service.as_ref(), &context).await;
        logging::debug(format!(
            "Evicted run context {} for session {session_id}",
            context.generation
        ));
        true
    }

    /// Remove `context` only if it is still the session's current run.
    pub fn remove_if_current(&self, context: &RunContext) -> bool {
        let mut runs = lock(&self.runs);
        let is_current = runs
            .get(&context.session_id)
            .is_some_and(|current| current.generation == context.generation);
        if is_current {
            runs.remove(&context.session_id);
        }
        is_current
    }

    /// Delete service-side assistants older than the configured age, in the
    /// background. Failures are logged only.
    pub fn spawn_sweep(&self) {
        let service = Arc::clone(&self.service);
        let max_age = self.settings.resource_max_age;
        tokio::spawn(async move {
            let report = sweep_stale_assistants(service.as_ref(), max_age).await;
            if report != SweepReport::default() {
                logging::info(format!(
                    "Assistant sweep: deleted {}, skipped {}, failed {}",
                    report.deleted, report.skipped, report.failed
                ));
            }
        });
    }
}

async fn cancel_run_logged(service: &dyn AssistantService, context: &RunContext) {
    let Some(run_id) = context.run_id() else {
        return;
    };
    if let Err(err) = service.cancel_run(&context.thread_id, &run_id).await {
        logging::warn(format!("Failed to cancel run {run_id}: {err}"));
    }
}

pub async fn sweep_stale_assistants(
    service: &dyn AssistantService,
    max_age: Duration,
) -> SweepReport {
    let mut report = SweepReport::default();
    let assistants = match service.list_assistants().await {
        Ok(assistants) => assistants,
        Err(err) => {
            logging::warn(format!("Assistant sweep could not list assistants: {err}"));
            report.failed += 1;
            return report;
        }
    };

    let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    let cutoff = Utc::now().timestamp().saturating_sub(max_age_secs);
    for assistant in assistants
        .iter()
        .filter(|a| a.created_at > 0 && a.created_at < cutoff)
    {
        match service.delete_assistant(&assistant.id).await {
            Ok(()) => {
                logging::info(format!("Deleted stale assistant {}", assistant.id));
                report.deleted += 1;
            }
            Err(err) if err.is_not_found() => {
                logging::info(format!(
                    "Assistant {} not found, skipping deletion",
                    assistant.id
                ));
                report.skipped += 1;
            }
            Err(err) => {
                logging::warn(format!("Error deleting assistant {}: {err}", assistant.id));
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::testing::{Call, MockAssistantService};
    use serde_json::json;

    fn settings() -> RegistrySettings {
        RegistrySettings {
            assistant_name: "Relay Assistant".to_string(),
            default_model: "gpt-3.5-turbo".to_string(),
            default_instructions: "You are a personal assistant".to_string(),
            tools: vec![json!({"type": "function", "function": {"name": "click"}})],
            resource_max_age: Duration::from_secs(24 * 60 * 60),
            sink_capacity: 8,
        }
    }

    fn registry() -> (Arc<MockAssistantService>, SessionRegistry) {
        let service = Arc::new(MockAssistantService::new());
        let registry = SessionRegistry::new(service.clone(), settings());
        (service, registry)
    }

    #[tokio::test]
    async fn appended_record_covers_partial_seeding_and_retries() {
        let (_service, registry) = registry();
        let session = registry.create(NewSession::default()).await.unwrap();
        let hi = ChatMessage::assistant("Hi");
        let question = ChatMessage::user("question");

        session.record_appended(&hi);
        assert_eq!(session.already_appended(&[&hi, &question]), 1);

        session.record_appended(&question);
        assert_eq!(session.already_appended(&[&question]), 1);
        assert_eq!(session.already_appended(&[&ChatMessage::user("other")]), 0);

        session.clear_appended();
        assert_eq!(session.already_appended(&[&question]), 0);
    }

    #[tokio::test]
    async fn create_binds_thread_and_applies_defaults() {
        let (service, registry) = registry();
        let session = registry
            .create(NewSession {
                tools_enabled: true,
                room_id: Some("room-1".into()),
                ..NewSession::default()
            })
            .await
            .unwrap();

        assert_eq!(session.model, "gpt-3.5-turbo");
        assert!(registry.get(&session.id).is_some());
        assert_eq!(registry.sessions_for_room("room-1").len(), 1);
        assert!(service.calls().contains(&Call::CreateAssistant {
            model: "gpt-3.5-turbo".into(),
            tools: 1,
        }));

        let record = service.retrieve_assistant(&session.id).await.unwrap();
        assert_eq!(record.thread_id(), Some(session.thread_id.as_str()));
    }

    #[tokio::test]
    async fn tools_are_only_attached_when_enabled() {
        let (service, registry) = registry();
        registry
            .create(NewSession {
                model: Some("gpt-4o".into()),
                ..NewSession::default()
            })
            .await
            .unwrap();
        assert!(service.calls().contains(&Call::CreateAssistant {
            model: "gpt-4o".into(),
            tools: 0,
        }));
    }

    #[tokio::test]
    async fn create_resumes_a_known_session() {
        let (_service, registry) = registry();
        let first = registry.create(NewSession::default()).await.unwrap();
        let again = registry
            .create(NewSession {
                requested_id: Some(first.id.clone()),
                room_id: Some("room-2".into()),
                ..NewSession::default()
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.sessions_for_room("room-2").len(), 1);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_the_service() {
        let (service, registry) = registry();
        let mut metadata = Map::new();
        metadata.insert(THREAD_ID_METADATA_KEY.into(), json!("thread_old"));
        service.assistants.lock().unwrap().push(AssistantRecord {
            id: "asst_old".into(),
            created_at: Utc::now().timestamp(),
            name: None,
            model: "gpt-4o".into(),
            metadata,
        });

        let session = registry.resolve("asst_old").await.unwrap();
        assert_eq!(session.thread_id, "thread_old");
        assert!(session.history_seeded());

        let err = registry.resolve("asst_missing").await.unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn evict_run_is_idempotent_and_cancels() {
        let (service, registry) = registry();
        let session = registry.create(NewSession::default()).await.unwrap();
        let (context, _rx) = registry.open_run(&session);
        context.set_run_id("run_1");
        registry.register_run(Arc::clone(&context));

        assert!(registry.evict_run(&session.id).await);
        assert!(context.sink().is_closed());
        assert!(registry.active_run(&session.id).is_none());
        assert!(!registry.evict_run(&session.id).await);

        let cancels = service
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::CancelRun { .. }))
            .count();
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn remove_if_current_ignores_superseded_contexts() {
        let (_service, registry) = registry();
        let session = registry.create(NewSession::default()).await.unwrap();
        let (first, _rx1) = registry.open_run(&session);
        let (second, _rx2) = registry.open_run(&session);
        registry.register_run(Arc::clone(&first));
        registry.register_run(Arc::clone(&second));

        assert!(first.sink().is_closed());
        assert!(!registry.remove_if_current(&first));
        assert_eq!(
            registry.active_run(&session.id).map(|c| c.generation()),
            Some(second.generation())
        );
        assert!(registry.remove_if_current(&second));
        assert!(registry.active_run(&session.id).is_none());
    }

    #[tokio::test]
    async fn sink_close_is_idempotent_and_ends_the_body() {
        let (sink, mut rx) = OutputSink::channel(4);
        assert!(sink.write("hello").await);
        assert!(sink.close());
        assert!(!sink.close());
        assert!(!sink.write("late").await);

        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from("hello"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_releases_a_writer_blocked_on_a_full_sink() {
        let (sink, _rx) = OutputSink::channel(1);
        assert!(sink.write("one").await);
        let blocked = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.write("two").await })
        };
        tokio::task::yield_now().await;
        sink.close();
        assert!(!blocked.await.unwrap());
    }

    #[tokio::test]
    async fn fail_surfaces_an_error_item() {
        let (sink, mut rx) = OutputSink::channel(4);
        sink.fail("Unsupported delta type").await;
        let err = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported delta type");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn tool_outputs_are_batched_until_complete() {
        let (_service, registry) = registry();
        let session = registry.create(NewSession::default()).await.unwrap();
        let (context, _rx) = registry.open_run(&session);
        context.expect_tool_calls(["tc1", "tc2"]);

        let first = ToolOutput {
            tool_call_id: "tc1".into(),
            output: "a".into(),
        };
        let second = ToolOutput {
            tool_call_id: "tc2".into(),
            output: "b".into(),
        };
        assert_eq!(
            context.record_tool_output(first.clone()),
            ToolBatch::Waiting { missing: 1 }
        );
        assert_eq!(
            context.record_tool_output(second.clone()),
            ToolBatch::Ready(vec![first, second])
        );

        let stray = ToolOutput {
            tool_call_id: "tc9".into(),
            output: "c".into(),
        };
        assert_eq!(
            context.record_tool_output(stray.clone()),
            ToolBatch::Ready(vec![stray])
        );
    }

    #[tokio::test]
    async fn sweep_deletes_old_assistants_and_skips_missing() {
        let service = MockAssistantService::new();
        let old = Utc::now().timestamp() - 2 * 24 * 60 * 60;
        let fresh = Utc::now().timestamp();
        for (id, created_at) in [("asst_a", old), ("asst_b", old), ("asst_new", fresh)] {
            service.assistants.lock().unwrap().push(AssistantRecord {
                id: id.into(),
                created_at,
                name: None,
                model: String::new(),
                metadata: Map::new(),
            });
        }
        service.missing_on_delete.lock().unwrap().push("asst_b".into());

        let report = sweep_stale_assistants(&service, Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(
            report,
            SweepReport {
                deleted: 1,
                skipped: 1,
                failed: 0
            }
        );
        assert!(!service.calls().contains(&Call::DeleteAssistant("asst_new".into())));
    }
}
