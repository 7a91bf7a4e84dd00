//! Abuse reports delivered by email.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::json;

use crate::config::ReportSettings;
use crate::errors::RelayError;
use crate::models::ReportRequest;

pub const CHAT_LOG_FILENAME: &str = "chat_log.txt";

#[async_trait]
pub trait ReportMailer: Send + Sync {
    async fn send_report(&self, report: &ReportRequest) -> Result<(), RelayError>;
}

/// Plain-text body of a report email.
#[must_use]
pub fn report_body(report: &ReportRequest) -> String {
    format!(
        "A user has reported an issue with the AI Assistant:\n\n\
         --- User Message ---\n\n\
         {}\n\n\
         ---------------------\n\n\
         Model: {}\n\
         System Prompt: {}\n",
        report.user_message, report.current_model, report.system_prompt
    )
}

/// Sends reports through the SendGrid v3 mail API.
pub struct SendGridMailer {
    http_client: reqwest::Client,
    settings: ReportSettings,
}

impl SendGridMailer {
    pub fn new(settings: ReportSettings) -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
                .map_err(|err| RelayError::Report(format!("invalid mail API key: {err}")))?,
        );
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| RelayError::Report(err.to_string()))?;
        Ok(Self {
            http_client,
            settings,
        })
    }
}

#[async_trait]
impl ReportMailer for SendGridMailer {
    async fn send_report(&self, report: &ReportRequest) -> Result<(), RelayError> {
        let body = json!({
            "personalizations": [{ "to": [{ "email": self.settings.to }] }],
            "from": { "email": self.settings.from },
            "subject": self.settings.subject,
            "content": [{ "type": "text/plain", "value": report_body(report) }],
            "attachments": [{
                "filename": CHAT_LOG_FILENAME,
                "content": STANDARD.encode(report.chat_log.as_bytes()),
                "type": "text/plain",
                "disposition": "attachment",
            }],
        });

        let url = format!("{}/v3/mail/send", self.settings.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| RelayError::Report(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(RelayError::Report(format!("mail API returned HTTP {status}: {text}")))
    }
}
