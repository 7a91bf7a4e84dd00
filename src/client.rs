//! HTTP client for the relay's `/api/*` endpoints.
//!
//! Used by the `chat` command and anything else that wants to drive a
//! conversation through a running relay.

use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::auth::generate_signature;
use crate::config::Config;
use crate::errors::ClientError;
use crate::logging;
use crate::models::{
    ApiErrorBody, ApiErrorResponse, ChatMessage, CreateSessionRequest, CreateSessionResponse,
    GenerateRequest, NotifyCallRequest, ReportRequest, ReportResponse,
};
use crate::utils::{now_millis, truncate_text};

/// Raw response body of a generate call.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;

/// What a conversation needs from the relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Create or resume a session, returning its id.
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<String, ClientError>;

    /// Start a run and return the framed response body.
    async fn generate(
        &self,
        session_id: &str,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ByteStream, ClientError>;

    async fn notify_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
        output: Value,
    ) -> Result<(), ClientError>;

    async fn send_report(&self, report: &ReportRequest) -> Result<(), ClientError>;
}

// === Types ===

/// reqwest-backed [`RelayTransport`].
#[must_use]
#[derive(Clone)]
pub struct RelayClient {
    http_client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
    password: Option<String>,
}

impl RelayClient {
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to build relay HTTP client")?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.filter(|s| !s.is_empty()),
            password: password.filter(|p| !p.is_empty()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.client_base_url(),
            config.secret_key.clone(),
            config.site_password.clone(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self.http_client.post(self.url(path)).json(body).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(api_error(response).await)
    }
}

/// Turn a non-2xx response into [`ClientError::Api`], falling back to the
/// raw body when it is not a relay error envelope.
async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body = match serde_json::from_str::<ApiErrorResponse>(&text) {
        Ok(parsed) => parsed.error,
        Err(_) => ApiErrorBody {
            message: if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                truncate_text(text.trim(), 500)
            },
            status: Some(status.as_u16()),
            code: None,
        },
    };
    ClientError::Api(body)
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<String, ClientError> {
        let response = self.post("/api/create", request).await?;
        let created: CreateSessionResponse = response.json().await?;
        logging::debug(format!("Relay session {}", created.id));
        Ok(created.id)
    }

    async fn generate(
        &self,
        session_id: &str,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ByteStream, ClientError> {
        let time = now_millis();
        let last = messages
            .last()
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        let sign = self
            .secret
            .as_deref()
            .map(|secret| generate_signature(secret, time, last))
            .unwrap_or_default();

        let request = GenerateRequest {
            model: Some(model.to_string()),
            messages: messages.to_vec(),
            system: None,
            time,
            pass: self.password.clone(),
            assistant_id: session_id.to_string(),
            sign,
        };
        let response = self.post("/api/generate", &request).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ClientError::from));
        Ok(Box::pin(stream))
    }

    async fn notify_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
        output: Value,
    ) -> Result<(), ClientError> {
        let request = NotifyCallRequest {
            assistant_id: Some(session_id.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
            output,
        };
        self.post("/api/notifyCall", &request).await?;
        Ok(())
    }

    async fn send_report(&self, report: &ReportRequest) -> Result<(), ClientError> {
        let response = self
            .http_client
            .post(self.url("/api/sendReport"))
            .json(report)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ReportResponse>(&text) {
            Ok(ReportResponse { success: true, .. }) => Ok(()),
            Ok(ReportResponse { error, .. }) => Err(ClientError::Api(ApiErrorBody {
                message: error.unwrap_or_else(|| "report was not sent".to_string()),
                status: Some(status.as_u16()),
                code: None,
            })),
            Err(_) if status == StatusCode::OK => Ok(()),
            Err(_) => Err(ClientError::Api(ApiErrorBody {
                message: truncate_text(text.trim(), 500),
                status: Some(status.as_u16()),
                code: None,
            })),
        }
    }
}
