//! Axum adapter for the ingestion pipeline: health route + JSON `/ingest`.

use std::sync::Arc;

use anyhow::Context;
use ascucha_core::{ChatOrigin, InboundMessage, IngestMode, IngestOutcome, Sender};
use ascucha_ingest::{IngestConfig, RoutingEngine};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ascucha-web";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
    pub allowed_chat_id: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("ASCUCHA_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            allowed_chat_id: std::env::var("ASCUCHA_ALLOWED_CHAT_ID")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RoutingEngine>,
    pub allowed_chat_id: Option<String>,
}

impl AppState {
    pub fn new(engine: Arc<RoutingEngine>, allowed_chat_id: Option<String>) -> Self {
        Self {
            engine,
            allowed_chat_id,
        }
    }

    fn chat_allowed(&self, chat_id: Option<i64>) -> bool {
        match &self.allowed_chat_id {
            None => true,
            Some(allowed) => chat_id.is_some_and(|id| id.to_string() == *allowed),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    #[serde(default)]
    pub html_text: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: IngestMode,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub chat: Option<ChatOrigin>,
    #[serde(default)]
    pub message_id: Option<i64>,
}

fn default_mode() -> IngestMode {
    IngestMode::Command
}

impl IngestRequest {
    pub fn into_message(self) -> InboundMessage {
        let (source_chat_label, message_permalink) = match (&self.chat, self.message_id) {
            (Some(chat), Some(id)) => (chat.label(), chat.permalink(id)),
            (Some(chat), None) => (chat.label(), String::new()),
            (None, _) => (String::new(), String::new()),
        };
        InboundMessage {
            sender_display_name: self.sender.display_name(),
            text: self.text,
            html_text: self.html_text.unwrap_or_default(),
            source_chat_label,
            message_permalink,
            mode: self.mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReply {
    #[serde(flatten)]
    pub outcome: IngestOutcome,
    pub reply: Option<String>,
}

/// Fixed chat replies. `command` is the configured command token.
pub fn reply_text(outcome: &IngestOutcome, command: &str) -> Option<String> {
    match outcome {
        IngestOutcome::UsageError => Some(format!("Uso: {command} URL")),
        IngestOutcome::UnrecognizedPlatform { url } => {
            Some(format!("No reconozco la plataforma del URL {url}."))
        }
        IngestOutcome::DuplicateUrl { repaired, .. } => {
            let mut text = "Ya estaba registrado ✅ (duplicado por URL).".to_string();
            if !repaired.is_empty() {
                text.push_str(&format!(" Completado en {}.", repaired.join(", ")));
            }
            Some(text)
        }
        IngestOutcome::Recorded {
            destinations,
            failed,
        } => {
            let mut text = format!("Anotado en {} ✅", destinations.join(", "));
            if !failed.is_empty() {
                text.push_str(&format!(" (pendiente: {})", failed.join(", ")));
            }
            Some(text)
        }
        IngestOutcome::Ignored => None,
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/ingest", post(ingest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env();
    let engine = RoutingEngine::from_config(&IngestConfig::from_env()).await?;
    serve(AppState::new(Arc::new(engine), web.allowed_chat_id), web.port).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "ingest": "/ingest"}))
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Response {
    if !state.chat_allowed(request.chat_id) {
        return Json(IngestReply {
            outcome: IngestOutcome::Ignored,
            reply: None,
        })
        .into_response();
    }

    let message = request.into_message();
    match state.engine.ingest(&message).await {
        Ok(outcome) => {
            let reply = reply_text(&outcome, &state.engine.parser().config().command);
            Json(IngestReply { outcome, reply }).into_response()
        }
        Err(err) => {
            error!(error = %err, "ingest failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}
