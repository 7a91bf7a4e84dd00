//! Server-sent event reassembly and assistant event mapping.

use serde_json::Value;

use super::{AssistantEvent, DeltaContent};
use crate::errors::ServiceError;
use crate::models::ToolCallDescriptor;

/// Lifecycle events that carry nothing a client needs.
pub const IGNORED_EVENTS: &[&str] = &[
    "thread.run.queued",
    "thread.run.in_progress",
    "thread.run.step.created",
    "thread.run.step.in_progress",
    "thread.run.step.delta",
    "thread.run.step.completed",
    "thread.message.created",
    "thread.message.in_progress",
    "thread.message.completed",
];

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

impl SseMessage {
    /// `done` events and `[DONE]` payloads end the feed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.event == "done" || self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser. Bytes may be split anywhere, including inside a
/// multi-byte character; lines are only decoded once complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.byte_buf.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(newline_pos) = self.byte_buf.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.byte_buf.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..newline_pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(message) = self.dispatch() {
                    messages.push(message);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                // id:, retry:
                _ => {}
            }
        }

        messages
    }

    /// Flush an event left without its terminating blank line.
    pub fn finish(&mut self) -> Option<SseMessage> {
        if !self.byte_buf.is_empty() {
            let mut tail = std::mem::take(&mut self.byte_buf);
            tail.push(b'\n');
            if let Some(message) = self.push(&tail).into_iter().next() {
                return Some(message);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Map one event from the run feed to its typed form.
pub fn parse_event(message: &SseMessage) -> Result<AssistantEvent, ServiceError> {
    let event = message.event.as_str();
    if IGNORED_EVENTS.contains(&event) {
        return Ok(AssistantEvent::Ignored {
            event: event.to_string(),
        });
    }

    match event {
        "thread.run.created" => Ok(AssistantEvent::RunCreated {
            run_id: run_id(&payload(message)?)?,
        }),
        "thread.message.delta" => {
            let payload = payload(message)?;
            let content = payload
                .pointer("/delta/content")
                .and_then(Value::as_array)
                .map(|parts| parts.iter().map(delta_content).collect())
                .unwrap_or_default();
            Ok(AssistantEvent::MessageDelta { content })
        }
        "thread.run.requires_action" => {
            let payload = payload(message)?;
            let tool_calls = payload
                .pointer("/required_action/submit_tool_outputs/tool_calls")
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            let tool_calls: Vec<ToolCallDescriptor> = serde_json::from_value(tool_calls)?;
            Ok(AssistantEvent::RequiresAction {
                run_id: run_id(&payload)?,
                tool_calls,
            })
        }
        "thread.run.completed" => Ok(AssistantEvent::RunCompleted {
            run_id: run_id(&payload(message)?)?,
        }),
        "thread.run.failed" => {
            let payload = payload(message)?;
            let message = payload
                .pointer("/last_error/message")
                .and_then(Value::as_str)
                .unwrap_or("run failed")
                .to_string();
            Ok(AssistantEvent::RunFailed {
                run_id: run_id(&payload)?,
                message,
            })
        }
        "thread.run.cancelled" => Ok(AssistantEvent::RunCancelled {
            run_id: run_id(&payload(message)?)?,
        }),
        "thread.run.expired" => Ok(AssistantEvent::RunExpired {
            run_id: run_id(&payload(message)?)?,
        }),
        "error" => {
            let message = serde_json::from_str::<Value>(&message.data)
                .ok()
                .and_then(|payload| {
                    payload
                        .pointer("/error/message")
                        .or_else(|| payload.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| message.data.clone());
            Ok(AssistantEvent::Error { message })
        }
        other => Ok(AssistantEvent::Unhandled {
            event: other.to_string(),
        }),
    }
}

fn payload(message: &SseMessage) -> Result<Value, ServiceError> {
    serde_json::from_str(&message.data).map_err(|err| {
        ServiceError::Parse(format!("invalid '{}' payload: {err}", message.event))
    })
}

fn run_id(payload: &Value) -> Result<String, ServiceError> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Parse("run event without id".to_string()))
}

fn delta_content(part: &Value) -> DeltaContent {
    let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
    match (kind, part.pointer("/text/value").and_then(Value::as_str)) {
        ("text", Some(text)) => DeltaContent::Text(text.to_string()),
        _ => DeltaContent::Unsupported {
            kind: kind.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(event: &str, data: &str) -> SseMessage {
        SseMessage {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let raw =
            "event: thread.run.created\ndata: {\"id\":\"run_1\"}\n\nevent: done\ndata: [DONE]\n\n";
        let mut decoder = SseDecoder::new();
        let mut messages = Vec::new();
        for chunk in raw.as_bytes().chunks(7) {
            messages.extend(decoder.push(chunk));
        }
        assert_eq!(
            messages,
            vec![
                message("thread.run.created", r#"{"id":"run_1"}"#),
                message("done", "[DONE]"),
            ]
        );
        assert!(messages[1].is_done());
    }

    #[test]
    fn keeps_multibyte_characters_split_between_chunks() {
        let raw = "event: x\ndata: héllo\n\n".as_bytes();
        let split = raw.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&raw[..split]).is_empty());
        assert_eq!(decoder.push(&raw[split..]), vec![message("x", "héllo")]);
    }

    #[test]
    fn crlf_comments_and_multiline_data() {
        let raw = b": keepalive\r\nevent: e\r\ndata: a\r\ndata: b\r\n\r\n";
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(raw), vec![message("e", "a\nb")]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: done\ndata: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(message("done", "[DONE]")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn maps_text_deltas() {
        let event = parse_event(&message(
            "thread.message.delta",
            r#"{"id":"msg_1","delta":{"content":[{"index":0,"type":"text","text":{"value":"Hel"}},{"index":1,"type":"image_file","image_file":{"file_id":"f"}}]}}"#,
        ))
        .unwrap();
        assert_eq!(
            event,
            AssistantEvent::MessageDelta {
                content: vec![
                    DeltaContent::Text("Hel".to_string()),
                    DeltaContent::Unsupported {
                        kind: "image_file".to_string()
                    },
                ]
            }
        );
    }

    #[test]
    fn maps_requires_action_tool_calls() {
        let event = parse_event(&message(
            "thread.run.requires_action",
            r#"{"id":"run_9","status":"requires_action","required_action":{"type":"submit_tool_outputs","submit_tool_outputs":{"tool_calls":[{"id":"tc1","type":"function","function":{"name":"foo","arguments":"{}"}}]}}}"#,
        ))
        .unwrap();
        assert_eq!(
            event,
            AssistantEvent::RequiresAction {
                run_id: "run_9".to_string(),
                tool_calls: vec![ToolCallDescriptor::function("tc1", "foo", "{}")],
            }
        );
    }

    #[test]
    fn maps_terminal_and_lifecycle_events() {
        assert_eq!(
            parse_event(&message(
                "thread.run.failed",
                r#"{"id":"run_1","last_error":{"code":"server_error","message":"boom"}}"#
            ))
            .unwrap(),
            AssistantEvent::RunFailed {
                run_id: "run_1".to_string(),
                message: "boom".to_string()
            }
        );
        assert_eq!(
            parse_event(&message("thread.run.step.delta", "{}")).unwrap(),
            AssistantEvent::Ignored {
                event: "thread.run.step.delta".to_string()
            }
        );
        assert_eq!(
            parse_event(&message("thread.run.incomplete", "{}")).unwrap(),
            AssistantEvent::Unhandled {
                event: "thread.run.incomplete".to_string()
            }
        );
        assert_eq!(
            parse_event(&message("error", r#"{"message":"rate limited"}"#)).unwrap(),
            AssistantEvent::Error {
                message: "rate limited".to_string()
            }
        );
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let err = parse_event(&message("thread.run.created", "not json")).unwrap_err();
        assert!(matches!(err, ServiceError::Parse(_)));
    }
}
