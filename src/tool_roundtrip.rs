//! Returns externally computed tool outputs to the run that asked for them.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::assistant::MessageContent;
use crate::errors::RelayError;
use crate::logging;
use crate::models::{Role, ToolOutput, tool_output_text};
use crate::orchestrator::{FeedOutcome, consume_feed, fail_run};
use crate::registry::{SessionRegistry, ToolBatch};

/// Output reported to the assistant in place of an uploaded image.
pub const IMAGE_PLACEHOLDER: &str = "image captured";
/// Text of the follow-up message that shows the assistant an uploaded image.
pub const IMAGE_MESSAGE_TEXT: &str = "Uploaded image";

const IMAGE_PURPOSE: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Held until the rest of the announced batch arrives.
    Buffered { missing: usize },
    Submitted { outputs: usize, feed: FeedOutcome },
}

pub struct ToolRoundTrip {
    registry: Arc<SessionRegistry>,
    upload_dir: PathBuf,
}

impl ToolRoundTrip {
    pub fn new(registry: Arc<SessionRegistry>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            upload_dir: upload_dir.into(),
        }
    }

    /// Submit one tool output to the session's live run and stream the
    /// resumed run into the same sink.
    ///
    /// Fails with [`RelayError::NoActiveRun`] when the run already ended;
    /// callers log that and move on.
    pub async fn submit(
        &self,
        session_id: &str,
        tool_call_id: &str,
        output: &Value,
    ) -> Result<SubmitOutcome, RelayError> {
        let no_active_run = || RelayError::NoActiveRun {
            session_id: session_id.to_string(),
        };
        let context = self
            .registry
            .active_run(session_id)
            .ok_or_else(no_active_run)?;

        let mut text = tool_output_text(output);
        if text.starts_with("data:image") {
            text = match self.upload_image(&text).await {
                Ok(file_id) => {
                    logging::info(format!(
                        "Uploaded image {file_id} for tool call {tool_call_id}"
                    ));
                    context.stash_image(file_id);
                    IMAGE_PLACEHOLDER.to_string()
                }
                Err(err) => {
                    logging::warn(format!("Image output of {tool_call_id} rejected: {err}"));
                    format!("ERROR : {err}")
                }
            };
        }

        let outputs = match context.record_tool_output(ToolOutput {
            tool_call_id: tool_call_id.to_string(),
            output: text,
        }) {
            ToolBatch::Waiting { missing } => {
                logging::debug(format!(
                    "Holding output for {tool_call_id}; {missing} tool call(s) outstanding"
                ));
                return Ok(SubmitOutcome::Buffered { missing });
            }
            ToolBatch::Ready(outputs) => outputs,
        };

        let _feed_guard = context.lock_feed().await;
        if context.sink().is_closed() {
            return Err(no_active_run());
        }
        let service = self.registry.service();
        let resumed = match context.run_id() {
            Some(run_id) => service
                .submit_tool_outputs_stream(&context.thread_id, &run_id, &outputs)
                .await
                .map_err(RelayError::from),
            None => Err(RelayError::StreamProtocol("run id not yet known".to_string())),
        };
        let feed = match resumed {
            Ok(feed) => feed,
            Err(err) => {
                logging::error(format!(
                    "Submitting tool outputs for session {session_id} failed: {err}"
                ));
                fail_run(&self.registry, &context, err.to_string()).await;
                return Err(err);
            }
        };
        let outcome = consume_feed(&self.registry, &context, feed).await;

        for file_id in context.take_images() {
            if let Err(err) = service
                .create_message(
                    &context.thread_id,
                    Role::User,
                    MessageContent::TextWithImage {
                        text: IMAGE_MESSAGE_TEXT.to_string(),
                        file_id: file_id.clone(),
                    },
                )
                .await
            {
                logging::warn(format!("Failed to attach image {file_id}: {err}"));
            }
        }

        Ok(SubmitOutcome::Submitted {
            outputs: outputs.len(),
            feed: outcome,
        })
    }

    /// Decode a `data:image/...;base64,` URI, persist it briefly, and upload
    /// it to the assistant service's file store.
    async fn upload_image(&self, data_uri: &str) -> Result<String, RelayError> {
        let (extension, bytes) = decode_image_uri(data_uri)?;
        let file = write_temp_image(&self.upload_dir, &extension, &bytes)
            .map_err(|err| RelayError::Service(err.into()))?;
        let file_id = self
            .registry
            .service()
            .upload_file(file.path(), IMAGE_PURPOSE)
            .await?;
        Ok(file_id)
    }
}

/// Split a base64 image data URI into a file extension and its bytes.
pub fn decode_image_uri(data_uri: &str) -> Result<(String, Vec<u8>), RelayError> {
    let invalid =
        |reason: &str| RelayError::InvalidRequest(format!("invalid image data: {reason}"));
    let (header, payload) = data_uri
        .split_once(',')
        .ok_or_else(|| invalid("missing payload"))?;
    let extension = header
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split(';').next())
        .filter(|subtype| !subtype.is_empty() && subtype.chars().all(char::is_alphanumeric))
        .unwrap_or("png")
        .to_string();
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|err| invalid(&err.to_string()))?;
    Ok((extension, bytes))
}

fn write_temp_image(
    dir: &Path,
    extension: &str,
    bytes: &[u8],
) -> std::io::Result<tempfile::NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("image-")
        .suffix(&format!(".{extension}"))
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}
