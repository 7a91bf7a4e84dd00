//! HTTP surface of the relay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::assistant::{AssistantService, OpenAiAssistantClient};
use crate::auth::SignatureGuard;
use crate::config::Config;
use crate::error_taxonomy::ErrorEnvelope;
use crate::errors::RelayError;
use crate::logging;
use crate::models::{
    ApiErrorBody, ApiErrorResponse, CreateSessionRequest, CreateSessionResponse, GenerateRequest,
    NotifyCallRequest, ReportRequest, ReportResponse, RoomActionRequest,
};
use crate::orchestrator::RunOrchestrator;
use crate::registry::{NewSession, RegistrySettings, SessionRegistry};
use crate::report::{ReportMailer, SendGridMailer};
use crate::tool_roundtrip::ToolRoundTrip;
use crate::utils::now_millis;

const SERVICE_NAME: &str = "assistant-relay";

#[derive(Clone)]
pub struct RuntimeApiState {
    registry: Arc<SessionRegistry>,
    orchestrator: Arc<RunOrchestrator>,
    roundtrip: Arc<ToolRoundTrip>,
    guard: Arc<SignatureGuard>,
    mailer: Option<Arc<dyn ReportMailer>>,
}

impl RuntimeApiState {
    pub fn new(
        service: Arc<dyn AssistantService>,
        settings: RegistrySettings,
        guard: SignatureGuard,
        mailer: Option<Arc<dyn ReportMailer>>,
        upload_dir: PathBuf,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(service, settings));
        Self {
            orchestrator: Arc::new(RunOrchestrator::new(Arc::clone(&registry))),
            roundtrip: Arc::new(ToolRoundTrip::new(Arc::clone(&registry), upload_dir)),
            registry,
            guard: Arc::new(guard),
            mailer,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let service: Arc<dyn AssistantService> =
            Arc::new(OpenAiAssistantClient::from_config(config)?);
        let settings = RegistrySettings::from_config(config)?;
        let guard = SignatureGuard::new(
            config.secret_key.clone(),
            config.site_password.clone(),
            config.signature_window(),
        );
        if !guard.enforces_signature() {
            logging::warn("No secret key configured; request signatures are not checked");
        }
        let mailer: Option<Arc<dyn ReportMailer>> = match config.report_settings() {
            Some(settings) => Some(Arc::new(SendGridMailer::new(settings)?)),
            None => None,
        };
        Ok(Self::new(service, settings, guard, mailer, config.upload_dir()))
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeApiOptions {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Start the relay server.
pub async fn run_http_server(config: Config, options: RuntimeApiOptions) -> Result<()> {
    if options.port == 0 {
        bail!("Port must be > 0");
    }

    let state = RuntimeApiState::from_config(&config)?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", options.host, options.port)
        .parse()
        .with_context(|| format!("Invalid bind address '{}:{}'", options.host, options.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    logging::info(format!("Assistant relay listening on http://{addr}"));
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Relay server error: {e}"))
}

pub fn build_router(state: RuntimeApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/create", post(create_session))
        .route("/api/generate", post(generate))
        .route("/api/notifyCall", post(notify_call))
        .route("/api/sendReport", post(send_report))
        .route("/api/roomAction", post(room_action))
        .layer(cors_layer())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
    })
}

async fn create_session(
    State(state): State<RuntimeApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session = state
        .registry
        .create(NewSession {
            requested_id: req.session_id,
            model: req.model,
            system_prompt: req.system_prompt,
            tools_enabled: req.use_tool,
            room_id: req.id.filter(|id| !id.is_empty()),
        })
        .await?;
    Ok(Json(CreateSessionResponse {
        id: session.id.clone(),
    }))
}

async fn generate(
    State(state): State<RuntimeApiState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    state.guard.verify(
        req.time,
        req.last_message_content(),
        &req.sign,
        req.pass.as_deref(),
        now_millis(),
    )?;
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    let session = state.registry.resolve(&req.assistant_id).await?;
    let stream = state.orchestrator.start(&session, &req.messages).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}

async fn notify_call(
    State(state): State<RuntimeApiState>,
    Json(req): Json<NotifyCallRequest>,
) -> Result<StatusCode, ApiError> {
    let (Some(session_id), Some(tool_call_id)) = (
        req.assistant_id.filter(|id| !id.is_empty()),
        req.tool_call_id.filter(|id| !id.is_empty()),
    ) else {
        logging::warn("notifyCall without assistantId or toolCallId");
        return Err(ApiError::bad_request(
            "assistantId and toolCallId are required",
        ));
    };

    let roundtrip = Arc::clone(&state.roundtrip);
    tokio::spawn(async move {
        match roundtrip.submit(&session_id, &tool_call_id, &req.output).await {
            Ok(outcome) => logging::debug(format!(
                "Tool output {tool_call_id} for session {session_id}: {outcome:?}"
            )),
            Err(err @ RelayError::NoActiveRun { .. }) => {
                logging::info(format!("Dropping tool output {tool_call_id}: {err}"));
            }
            Err(err) => {
                logging::warn(format!("Error submitting tool output {tool_call_id}: {err}"));
            }
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn send_report(
    State(state): State<RuntimeApiState>,
    Json(req): Json<ReportRequest>,
) -> (StatusCode, Json<ReportResponse>) {
    let result = match state.mailer.as_ref() {
        Some(mailer) => mailer.send_report(&req).await,
        None => Err(RelayError::Report("report delivery is not configured".into())),
    };
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ReportResponse {
                success: true,
                error: None,
            }),
        ),
        Err(err) => {
            logging::warn(format!("Failed to send report: {err}"));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReportResponse {
                    success: false,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

async fn room_action(
    State(state): State<RuntimeApiState>,
    Json(req): Json<RoomActionRequest>,
) -> Result<StatusCode, ApiError> {
    let notified = state
        .orchestrator
        .notify_room_action(
            &req.room_id,
            &req.description,
            req.reaction_expected,
            req.context.as_ref(),
        )
        .await?;
    logging::info(format!(
        "Room {} action delivered to {notified} session(s)",
        req.room_id
    ));
    Ok(StatusCode::NO_CONTENT)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("invalid_request".to_string()),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let envelope = ErrorEnvelope::from(&err);
        let status = StatusCode::from_u16(envelope.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            logging::error(format!("Request failed: {err}"));
        }
        Self {
            status,
            message: envelope.message,
            code: Some(envelope.code),
        }
    }
}

impl From<crate::errors::AuthError> for ApiError {
    fn from(err: crate::errors::AuthError) -> Self {
        RelayError::Auth(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorResponse {
                error: ApiErrorBody {
                    message: self.message,
                    status: Some(self.status.as_u16()),
                    code: self.code,
                },
            }),
        )
            .into_response()
    }
}
