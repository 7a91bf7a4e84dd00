//! Run orchestration: one streamed run per session, translated to frames.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::assistant::{AssistantEvent, DeltaContent, EventFeed, MessageContent};
use crate::errors::RelayError;
use crate::frame::Frame;
use crate::logging;
use crate::models::{ChatMessage, Role};
use crate::registry::{RunContext, Session, SessionRegistry, SinkItem};

/// Body stream handed to the HTTP layer for one run.
pub type RunStream = ReceiverStream<SinkItem>;

/// How a drained event feed left its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Completed,
    /// Tool calls were sent; the run resumes when their outputs arrive.
    AwaitingToolOutputs,
    Cancelled,
    Failed,
    /// The sink was closed underneath the feed (superseded or disconnected).
    Abandoned,
    /// The feed ended without a terminal event.
    Ended,
}

pub struct RunOrchestrator {
    registry: Arc<SessionRegistry>,
}

impl RunOrchestrator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start a run for `session` and return the body stream its frames are
    /// written to.
    ///
    /// Cleanup of earlier runs is best-effort. Failures to append messages
    /// or create the run surface as [`RelayError::RunStart`] and leave no
    /// run context registered.
    pub async fn start(
        &self,
        session: &Arc<Session>,
        messages: &[ChatMessage],
    ) -> Result<RunStream, RelayError> {
        let service = self.registry.service();

        match service.list_runs(&session.thread_id).await {
            Ok(runs) => {
                for run in runs.iter().filter(|run| run.status.is_active()) {
                    logging::warn(format!(
                        "Cancelling run {} (status {:?}) on thread {}",
                        run.id, run.status, session.thread_id
                    ));
                    if let Err(err) = service.cancel_run(&session.thread_id, &run.id).await {
                        logging::warn(format!("Failed to cancel stale run {}: {err}", run.id));
                    }
                }
            }
            Err(err) => logging::warn(format!(
                "Could not list runs on thread {}: {err}",
                session.thread_id
            )),
        }

        self.registry.evict_run(&session.id).await;

        let pending = pending_messages(messages, session.history_seeded());
        let skip = session.already_appended(&pending);
        for message in &pending[skip..] {
            service
                .create_message(
                    &session.thread_id,
                    message.role,
                    MessageContent::Text(message.content.clone()),
                )
                .await
                .map_err(RelayError::RunStart)?;
            session.record_appended(message);
        }
        session.mark_history_seeded();

        let feed = service
            .create_run_stream(&session.thread_id, &session.id)
            .await
            .map_err(RelayError::RunStart)?;
        session.clear_appended();

        let (context, rx) = self.registry.open_run(session);
        let feed_guard = context.lock_feed().await;
        self.registry.register_run(Arc::clone(&context));
        logging::debug(format!(
            "Run context {} registered for session {}",
            context.generation(),
            session.id
        ));

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let _feed_guard = feed_guard;
            let outcome = consume_feed(&registry, &context, feed).await;
            logging::debug(format!(
                "Run feed for session {} finished: {outcome:?}",
                context.session_id
            ));
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Append a room interaction note to every session attached to
    /// `room_id`. Returns how many sessions were notified.
    pub async fn notify_room_action(
        &self,
        room_id: &str,
        description: &str,
        reaction_expected: bool,
        context: Option<&Value>,
    ) -> Result<usize, RelayError> {
        let sessions = self.registry.sessions_for_room(room_id);
        if sessions.is_empty() {
            return Err(RelayError::NoAssistantForRoom {
                room_id: room_id.to_string(),
            });
        }

        let text = room_action_text(Utc::now(), description, reaction_expected, context);
        for session in &sessions {
            self.registry
                .service()
                .create_message(
                    &session.thread_id,
                    Role::Assistant,
                    MessageContent::Text(text.clone()),
                )
                .await?;
        }
        Ok(sessions.len())
    }
}

/// Messages of `messages` the thread has not seen yet.
///
/// A fresh thread receives the whole conversation. Afterwards the assistant's
/// own replies already live on the thread, so only the trailing user turns
/// are new. System messages become assistant instructions and are never
/// appended.
#[must_use]
pub fn pending_messages(messages: &[ChatMessage], history_seeded: bool) -> Vec<&ChatMessage> {
    if !history_seeded {
        return messages
            .iter()
            .filter(|message| message.role != Role::System)
            .collect();
    }
    let mut trailing: Vec<&ChatMessage> = messages
        .iter()
        .rev()
        .take_while(|message| message.role == Role::User)
        .collect();
    trailing.reverse();
    trailing
}

#[must_use]
pub fn room_action_text(
    now: DateTime<Utc>,
    description: &str,
    reaction_expected: bool,
    context: Option<&Value>,
) -> String {
    let mut text = format!(
        "On {} the user interacted with a button in the room.",
        now.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    if let Some(context) = context {
        text.push_str(&format!("The technical context is {context}."));
    }
    if reaction_expected {
        text.push_str(
            " In the next message I should try to give an answer or do an action according to this interaction.",
        );
    }
    text.push_str(&format!(
        "The interaction has the following description : {description}"
    ));
    text
}

// === Frame encoding ===

/// Drain `feed` into the context's sink, translating events to frames.
///
/// The caller must hold the context's feed lock. Terminal events close the
/// sink and evict the context, unless a newer run already replaced it.
pub async fn consume_feed(
    registry: &SessionRegistry,
    context: &RunContext,
    mut feed: EventFeed,
) -> FeedOutcome {
    let sink = context.sink();
    let mut awaiting_tools = false;

    while let Some(event) = feed.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                logging::warn(format!(
                    "Event feed error for session {}: {err}",
                    context.session_id
                ));
                return fail_run(registry, context, err.to_string()).await;
            }
        };

        match event {
            AssistantEvent::RunCreated { run_id } => {
                logging::debug(format!("Run {run_id} created"));
                context.set_run_id(run_id);
            }
            AssistantEvent::MessageDelta { content } => {
                for part in content {
                    match part {
                        DeltaContent::Text(text) => {
                            if text.is_empty() {
                                continue;
                            }
                            if !sink.write(text.into_bytes()).await {
                                return abandon(registry, context);
                            }
                        }
                        DeltaContent::Unsupported { kind } => {
                            return fail_run(
                                registry,
                                context,
                                format!("Unsupported delta type: {kind}"),
                            )
                            .await;
                        }
                    }
                }
            }
            AssistantEvent::RequiresAction { run_id, tool_calls } => {
                context.set_run_id(run_id);
                context.expect_tool_calls(tool_calls.iter().map(|call| call.id.clone()));
                for call in tool_calls {
                    logging::info(format!(
                        "Run requires tool call {} ({})",
                        call.id,
                        call.function_name()
                    ));
                    match sink.write_frame(&Frame::ToolCall(call)).await {
                        Ok(true) => {}
                        Ok(false) => return abandon(registry, context),
                        Err(err) => return fail_run(registry, context, err.to_string()).await,
                    }
                }
                awaiting_tools = true;
            }
            AssistantEvent::RunCompleted { run_id } => {
                logging::debug(format!("Run {run_id} completed"));
                finish(registry, context);
                return FeedOutcome::Completed;
            }
            AssistantEvent::RunFailed { run_id, message } => {
                logging::warn(format!("Run {run_id} failed: {message}"));
                return fail_run(registry, context, format!("Run failed: {message}")).await;
            }
            AssistantEvent::RunCancelled { run_id } | AssistantEvent::RunExpired { run_id } => {
                logging::info(format!("Run {run_id} ended without completing"));
                finish(registry, context);
                return FeedOutcome::Cancelled;
            }
            AssistantEvent::Error { message } => {
                logging::warn(format!("Assistant service error: {message}"));
                return fail_run(registry, context, message).await;
            }
            AssistantEvent::Ignored { .. } => {}
            AssistantEvent::Unhandled { event } => {
                logging::info(format!("Unhandled event {event}"));
            }
        }
    }

    if awaiting_tools && !sink.is_closed() {
        return FeedOutcome::AwaitingToolOutputs;
    }
    logging::warn(format!(
        "Event feed for session {} ended without a terminal event",
        context.session_id
    ));
    finish(registry, context);
    FeedOutcome::Ended
}

fn finish(registry: &SessionRegistry, context: &RunContext) {
    context.sink().close();
    registry.remove_if_current(context);
}

/// End the run with an error on its sink and drop its context.
pub async fn fail_run(
    registry: &SessionRegistry,
    context: &RunContext,
    message: String,
) -> FeedOutcome {
    context.sink().fail(message).await;
    registry.remove_if_current(context);
    FeedOutcome::Failed
}

fn abandon(registry: &SessionRegistry, context: &RunContext) -> FeedOutcome {
    if !context.sink().is_closed() {
        logging::info(format!(
            "Client for session {} went away; dropping its run context",
            context.session_id
        ));
    }
    finish(registry, context);
    FeedOutcome::Abandoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use crate::assistant::testing::{Call, MockAssistantService};
    use crate::assistant::{RunRecord, RunStatus};
    use crate::errors::ServiceError;
    use crate::models::ToolCallDescriptor;
    use crate::registry::{NewSession, RegistrySettings};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn settings() -> RegistrySettings {
        RegistrySettings {
            assistant_name: "Relay Assistant".to_string(),
            default_model: "gpt-4o".to_string(),
            default_instructions: "You are a personal assistant".to_string(),
            tools: Vec::new(),
            resource_max_age: Duration::from_secs(24 * 60 * 60),
            sink_capacity: 16,
        }
    }

    async fn setup() -> (Arc<MockAssistantService>, RunOrchestrator, Arc<Session>) {
        let service = Arc::new(MockAssistantService::new());
        let registry = Arc::new(SessionRegistry::new(service.clone(), settings()));
        let session = registry
            .create(NewSession {
                room_id: Some("room-1".into()),
                ..NewSession::default()
            })
            .await
            .unwrap();
        (service, RunOrchestrator::new(registry), session)
    }

    async fn drain(mut stream: RunStream) -> (Vec<u8>, Option<io::Error>) {
        let mut body = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(err) => return (body, Some(err)),
            }
        }
        (body, None)
    }

    fn text(value: &str) -> AssistantEvent {
        AssistantEvent::MessageDelta {
            content: vec![DeltaContent::Text(value.to_string())],
        }
    }

    fn created(run_id: &str) -> AssistantEvent {
        AssistantEvent::RunCreated {
            run_id: run_id.to_string(),
        }
    }

    fn completed(run_id: &str) -> AssistantEvent {
        AssistantEvent::RunCompleted {
            run_id: run_id.to_string(),
        }
    }

    fn appended(service: &MockAssistantService) -> Vec<(Role, String)> {
        service
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateMessage {
                    role,
                    content: MessageContent::Text(text),
                    ..
                } => Some((role, text)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn streams_text_and_completes() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![
            created("run_1"),
            AssistantEvent::Ignored {
                event: "thread.run.queued".into(),
            },
            text("Hello "),
            text("world"),
            completed("run_1"),
        ]);

        let stream = orchestrator
            .start(&session, &[ChatMessage::user("hi")])
            .await
            .unwrap();
        let (body, err) = drain(stream).await;

        assert_eq!(String::from_utf8(body).unwrap(), "Hello world");
        assert!(err.is_none());
        assert!(orchestrator.registry().active_run(&session.id).is_none());
    }

    #[tokio::test]
    async fn tool_calls_become_length_prefixed_envelopes() {
        let (service, orchestrator, session) = setup().await;
        let first = ToolCallDescriptor::function("tc1", "click", r#"{"id":"b1"}"#);
        let second = ToolCallDescriptor::function("tc2", "describe", "{}");
        service.push_run_feed(vec![
            created("run_1"),
            text("Let me click. "),
            AssistantEvent::RequiresAction {
                run_id: "run_1".into(),
                tool_calls: vec![first.clone(), second.clone()],
            },
        ]);

        let mut stream = orchestrator
            .start(&session, &[ChatMessage::user("click it")])
            .await
            .unwrap();

        let mut expected = b"Let me click. ".to_vec();
        expected.extend(Frame::ToolCall(first).encode().unwrap());
        expected.extend(Frame::ToolCall(second).encode().unwrap());

        let mut body = Vec::new();
        while body.len() < expected.len() {
            let chunk: Bytes = stream.next().await.unwrap().unwrap();
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, expected);

        let context = orchestrator.registry().active_run(&session.id).unwrap();
        assert_eq!(context.run_id().as_deref(), Some("run_1"));
        assert!(!context.sink().is_closed());
    }

    #[tokio::test]
    async fn first_run_appends_history_and_later_runs_only_new_user_turns() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![completed("run_1")]);
        service.push_run_feed(vec![completed("run_2")]);

        let history = vec![
            ChatMessage::system("Be terse"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("again"),
        ];
        drain(orchestrator.start(&session, &history).await.unwrap()).await;

        let mut next = history.clone();
        next.push(ChatMessage::assistant("sure"));
        next.push(ChatMessage::user("one"));
        next.push(ChatMessage::user("two"));
        drain(orchestrator.start(&session, &next).await.unwrap()).await;

        assert_eq!(
            appended(&service),
            vec![
                (Role::User, "hi".to_string()),
                (Role::Assistant, "hello".to_string()),
                (Role::User, "again".to_string()),
                (Role::User, "one".to_string()),
                (Role::User, "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn stale_runs_are_cancelled_and_failures_do_not_abort() {
        let (service, orchestrator, session) = setup().await;
        *service.runs.lock().unwrap() = vec![
            RunRecord {
                id: "run_q".into(),
                status: RunStatus::Queued,
            },
            RunRecord {
                id: "run_a".into(),
                status: RunStatus::RequiresAction,
            },
            RunRecord {
                id: "run_done".into(),
                status: RunStatus::Completed,
            },
        ];
        *service.fail_cancel.lock().unwrap() = true;
        service.push_run_feed(vec![text("ok"), completed("run_new")]);

        let stream = orchestrator
            .start(&session, &[ChatMessage::user("hi")])
            .await
            .unwrap();
        let (body, _) = drain(stream).await;
        assert_eq!(body, b"ok");

        let cancelled: Vec<String> = service
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CancelRun { run_id, .. } => Some(run_id),
                _ => None,
            })
            .collect();
        assert_eq!(cancelled, vec!["run_q", "run_a"]);
    }

    #[tokio::test]
    async fn restarting_a_session_closes_and_evicts_the_previous_run() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![
            created("run_1"),
            AssistantEvent::RequiresAction {
                run_id: "run_1".into(),
                tool_calls: vec![ToolCallDescriptor::function("tc1", "click", "{}")],
            },
        ]);
        let mut first_stream = orchestrator
            .start(&session, &[ChatMessage::user("one")])
            .await
            .unwrap();
        first_stream.next().await.unwrap().unwrap();
        let first = orchestrator.registry().active_run(&session.id).unwrap();

        service.push_run_feed(vec![created("run_2"), text("two"), completed("run_2")]);
        let second_stream = orchestrator
            .start(&session, &[ChatMessage::user("two")])
            .await
            .unwrap();

        assert!(first.sink().is_closed());
        assert!(first_stream.next().await.is_none());
        assert!(service.calls().contains(&Call::CancelRun {
            thread_id: session.thread_id.clone(),
            run_id: "run_1".into(),
        }));
        let current = orchestrator.registry().active_run(&session.id);
        assert!(current.is_none_or(|c| c.generation() != first.generation()));

        let (body, _) = drain(second_stream).await;
        assert_eq!(body, b"two");
    }

    #[tokio::test]
    async fn run_start_failure_leaves_no_context() {
        let (service, orchestrator, session) = setup().await;
        *service.fail_create_run.lock().unwrap() = true;

        let err = orchestrator
            .start(&session, &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RunStart(_)));
        assert!(orchestrator.registry().active_run(&session.id).is_none());
    }

    #[tokio::test]
    async fn retry_after_run_start_failure_does_not_duplicate_messages() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![completed("run_1")]);
        *service.fail_create_run.lock().unwrap() = true;

        let history = vec![
            ChatMessage::assistant("Hi"),
            ChatMessage::user("question"),
        ];
        let err = orchestrator.start(&session, &history).await.unwrap_err();
        assert!(matches!(err, RelayError::RunStart(_)));

        *service.fail_create_run.lock().unwrap() = false;
        drain(orchestrator.start(&session, &history).await.unwrap()).await;

        assert_eq!(
            appended(&service),
            vec![
                (Role::Assistant, "Hi".to_string()),
                (Role::User, "question".to_string()),
            ]
        );

        let mut next = history.clone();
        next.push(ChatMessage::assistant("answer"));
        next.push(ChatMessage::user("question"));
        service.push_run_feed(vec![completed("run_2")]);
        drain(orchestrator.start(&session, &next).await.unwrap()).await;
        assert_eq!(appended(&service).len(), 3);
    }

    #[tokio::test]
    async fn unsupported_delta_fails_the_stream() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![
            text("partial"),
            AssistantEvent::MessageDelta {
                content: vec![DeltaContent::Unsupported {
                    kind: "image_file".into(),
                }],
            },
            text("never"),
        ]);

        let stream = orchestrator
            .start(&session, &[ChatMessage::user("hi")])
            .await
            .unwrap();
        let (body, err) = drain(stream).await;
        assert_eq!(body, b"partial");
        assert!(err.unwrap().to_string().contains("Unsupported delta type"));
        assert!(orchestrator.registry().active_run(&session.id).is_none());
    }

    #[tokio::test]
    async fn failed_runs_and_feed_errors_surface_as_stream_errors() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![
            created("run_1"),
            AssistantEvent::RunFailed {
                run_id: "run_1".into(),
                message: "rate limit".into(),
            },
        ]);
        let (_, err) = drain(
            orchestrator
                .start(&session, &[ChatMessage::user("hi")])
                .await
                .unwrap(),
        )
        .await;
        assert!(err.unwrap().to_string().contains("rate limit"));

        service.push_run_feed_raw(vec![
            Ok(text("a")),
            Err(ServiceError::Network("connection reset".into())),
        ]);
        let (body, err) = drain(
            orchestrator
                .start(&session, &[ChatMessage::user("again")])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"a");
        assert!(err.unwrap().to_string().contains("connection reset"));
        assert!(orchestrator.registry().active_run(&session.id).is_none());
    }

    #[tokio::test]
    async fn unhandled_events_do_not_fail_the_run() {
        let (service, orchestrator, session) = setup().await;
        service.push_run_feed(vec![
            AssistantEvent::Unhandled {
                event: "thread.run.incomplete".into(),
            },
            text("fine"),
            completed("run_1"),
        ]);
        let (body, err) = drain(
            orchestrator
                .start(&session, &[ChatMessage::user("hi")])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"fine");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn room_actions_reach_attached_sessions() {
        let (service, orchestrator, session) = setup().await;
        let notified = orchestrator
            .notify_room_action("room-1", "Opened the door", true, Some(&json!({"button": "door"})))
            .await
            .unwrap();
        assert_eq!(notified, 1);

        let (role, text) = appended(&service).pop().unwrap();
        assert_eq!(role, Role::Assistant);
        assert!(text.contains("the user interacted with a button in the room."));
        assert!(text.contains(r#"The technical context is {"button":"door"}."#));
        assert!(text.ends_with("The interaction has the following description : Opened the door"));
        assert!(session.room_id.as_deref() == Some("room-1"));

        let err = orchestrator
            .notify_room_action("room-404", "x", false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoAssistantForRoom { .. }));
    }

    #[test]
    fn room_action_text_matches_the_documented_shape() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            room_action_text(now, "Pressed play", false, None),
            "On 2024-05-01T10:00:00.000Z the user interacted with a button in the room.The interaction has the following description : Pressed play"
        );
    }
}
