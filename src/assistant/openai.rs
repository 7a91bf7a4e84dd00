//! HTTP client for the OpenAI Assistants API (v2).

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::sse::{SseDecoder, parse_event};
use super::{
    AssistantRecord, AssistantService, CreateAssistantParams, EventFeed, MessageContent,
    RunRecord,
};
use crate::config::{Config, RetryPolicy};
use crate::errors::ServiceError;
use crate::logging;
use crate::models::{Role, ToolOutput};

const ASSISTANTS_BETA: &str = "assistants=v2";
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct ListPage<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

/// Assistant service backed by the Assistants HTTP API.
#[derive(Clone)]
pub struct OpenAiAssistantClient {
    http_client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OpenAiAssistantClient {
    pub fn new(api_key: &str, base_url: &str, retry: RetryPolicy) -> Result<Self, ServiceError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|err| ServiceError::Network(format!("invalid API key header: {err}")))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static(ASSISTANTS_BETA));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        let base_url = config.base_url();
        let retry = config.retry_policy();

        logging::info(format!("Assistant service base URL: {base_url}"));
        logging::info(format!(
            "Retry policy: enabled={}, max_retries={}, initial_delay={}s, max_delay={}s",
            retry.enabled, retry.max_retries, retry.initial_delay, retry.max_delay
        ));

        Ok(Self::new(&api_key, &base_url, retry)?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let url = self.url(path);
        let response = send_with_retry(&self.retry, || self.http_client.get(&url)).await?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ServiceError> {
        let url = self.url(path);
        let response =
            send_with_retry(&self.retry, || self.http_client.post(&url).json(body)).await?;
        read_json(response).await
    }

    async fn post_stream(&self, path: &str, body: &Value) -> Result<EventFeed, ServiceError> {
        let url = self.url(path);
        let response =
            send_with_retry(&self.retry, || self.http_client.post(&url).json(body)).await?;
        let response = ensure_success(response).await?;
        Ok(event_feed(response))
    }
}

#[async_trait]
impl AssistantService for OpenAiAssistantClient {
    async fn create_assistant(
        &self,
        params: CreateAssistantParams,
    ) -> Result<AssistantRecord, ServiceError> {
        let body = json!({
            "name": params.name,
            "instructions": params.instructions,
            "model": params.model,
            "tools": params.tools,
            "metadata": params.metadata,
        });
        self.post_json("assistants", &body).await
    }

    async fn retrieve_assistant(
        &self,
        assistant_id: &str,
    ) -> Result<AssistantRecord, ServiceError> {
        self.get_json(&format!("assistants/{assistant_id}")).await
    }

    async fn list_assistants(&self) -> Result<Vec<AssistantRecord>, ServiceError> {
        let mut assistants = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut path = format!("assistants?limit={LIST_PAGE_SIZE}&order=asc");
            if let Some(cursor) = after.as_deref() {
                path.push_str("&after=");
                path.push_str(cursor);
            }
            let page: ListPage<AssistantRecord> = self.get_json(&path).await?;
            let last_id = page
                .last_id
                .clone()
                .or_else(|| page.data.last().map(|a| a.id.clone()));
            assistants.extend(page.data);
            match last_id {
                Some(cursor) if page.has_more => after = Some(cursor),
                _ => break,
            }
        }
        Ok(assistants)
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), ServiceError> {
        let url = self.url(&format!("assistants/{assistant_id}"));
        let response = send_with_retry(&self.retry, || self.http_client.delete(&url)).await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn create_thread(&self) -> Result<String, ServiceError> {
        let thread: IdOnly = self.post_json("threads", &json!({})).await?;
        Ok(thread.id)
    }

    async fn create_message(
        &self,
        thread_id: &str,
        role: Role,
        content: MessageContent,
    ) -> Result<(), ServiceError> {
        let content = match content {
            MessageContent::Text(text) => json!(text),
            MessageContent::TextWithImage { text, file_id } => json!([
                { "type": "text", "text": text },
                { "type": "image_file", "image_file": { "file_id": file_id } },
            ]),
        };
        let body = json!({ "role": role.as_str(), "content": content });
        let _: IdOnly = self
            .post_json(&format!("threads/{thread_id}/messages"), &body)
            .await?;
        Ok(())
    }

    async fn list_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>, ServiceError> {
        let page: ListPage<RunRecord> = self
            .get_json(&format!("threads/{thread_id}/runs?limit={LIST_PAGE_SIZE}"))
            .await?;
        Ok(page.data)
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ServiceError> {
        let _: IdOnly = self
            .post_json(
                &format!("threads/{thread_id}/runs/{run_id}/cancel"),
                &json!({}),
            )
            .await?;
        Ok(())
    }

    async fn create_run_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<EventFeed, ServiceError> {
        let body = json!({ "assistant_id": assistant_id, "stream": true });
        self.post_stream(&format!("threads/{thread_id}/runs"), &body)
            .await
    }

    async fn submit_tool_outputs_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<EventFeed, ServiceError> {
        let body = json!({ "tool_outputs": outputs, "stream": true });
        self.post_stream(
            &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            &body,
        )
        .await
    }

    async fn upload_file(&self, path: &Path, purpose: &str) -> Result<String, ServiceError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let url = self.url("files");
        let response = send_with_retry(&self.retry, || {
            let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
            let form = reqwest::multipart::Form::new()
                .text("purpose", purpose.to_string())
                .part("file", part);
            self.http_client.post(&url).multipart(form)
        })
        .await?;
        let file: IdOnly = read_json(response).await?;
        Ok(file.id)
    }
}

// === Response helpers ===

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ServiceError::Http {
        status: status.as_u16(),
        message: error_message(&text),
    })
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ServiceError> {
    let response = ensure_success(response).await?;
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

/// Pull `error.message` out of an API error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn event_feed(response: reqwest::Response) -> EventFeed {
    let byte_stream = response.bytes_stream();

    let stream = async_stream::stream! {
        use futures_util::StreamExt;

        let mut decoder = SseDecoder::new();
        let mut byte_stream = std::pin::pin!(byte_stream);
        let mut done = false;

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(ServiceError::Network(format!("Stream read error: {e}")));
                    done = true;
                    break;
                }
            };

            for message in decoder.push(&chunk) {
                if message.is_done() {
                    done = true;
                    break;
                }
                yield parse_event(&message);
            }
            if done {
                break;
            }
        }

        if !done
            && let Some(message) = decoder.finish()
            && !message.is_done()
        {
            yield parse_event(&message);
        }
    };

    Box::pin(stream)
}

// === Retry Helpers ===

async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut build: F,
) -> Result<reqwest::Response, ServiceError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        let result = build().send().await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                // Non-retryable errors go back to the caller (404 drives fallbacks)
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || !policy.enabled || attempt >= policy.max_retries {
                    return Ok(response);
                }

                logging::warn(format!(
                    "Retryable HTTP {} (attempt {} of {})",
                    status.as_u16(),
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
            Err(err) => {
                if !policy.enabled || attempt >= policy.max_retries {
                    return Err(err.into());
                }
                logging::warn(format!(
                    "Request error: {} (attempt {} of {})",
                    err,
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}
