//! Axum HTTP ingress: the AI webhook, a health endpoint, and a service
//! banner, with body limits and request timeouts at the router layer.

use crate::db::{NewTurn, SaveOutcome, Store};
use crate::directory::Directory;
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Per-request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

const SERVICE_NAME: &str = "replyq";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub directory: Arc<dyn Directory>,
}

// ── Webhook payload ──────────────────────────────────────────────

/// Event shape posted by the chat server.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "instanceName")]
    pub instance_name: String,
    pub event: WebhookEvent,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "Info")]
    pub info: EventInfo,
    #[serde(rename = "Message", default)]
    pub message: EventMessage,
}

#[derive(Debug, Deserialize)]
pub struct EventInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Sender")]
    pub sender: String,
    #[serde(rename = "Chat")]
    pub chat: String,
    #[serde(rename = "Type")]
    pub msg_type: String,
    #[serde(rename = "PushName", default)]
    pub push_name: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "IsFromMe", default)]
    pub is_from_me: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "extendedTextMessage", default)]
    pub extended_text: Option<ExtendedText>,
    #[serde(default)]
    pub conversation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: String,
}

impl WebhookPayload {
    /// Message text: quoted/extended messages carry it under
    /// `extendedTextMessage`, plain ones under `conversation`.
    pub fn body_text(&self) -> &str {
        if let Some(extended) = &self.event.message.extended_text {
            if !extended.text.is_empty() {
                return &extended.text;
            }
        }
        self.event.message.conversation.as_deref().unwrap_or("")
    }
}

/// Strip the device suffix from a JID:
/// `"628123:24@s.whatsapp.net"` → `"628123@s.whatsapp.net"`.
pub fn normalize_jid(jid: &str) -> String {
    let Some((local, rest)) = jid.split_once(':') else {
        return jid.to_string();
    };
    match rest.rfind('@') {
        Some(at) => format!("{local}{}", &rest[at..]),
        None => jid.to_string(),
    }
}

// ── Server ───────────────────────────────────────────────────────

/// Build the ingress router with its middleware stack.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_home))
        .route("/health", get(handle_health))
        .route("/webhook/ai", post(handle_ai_webhook))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
}

/// Run the HTTP ingress until `shutdown` resolves, then drain.
pub async fn run_gateway(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = router(state);

    crate::health::mark_component_ok("gateway");
    tracing::info!("gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_home() -> impl IntoResponse {
    Json(json!({
        "status": "running",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "mode": "ai-bot",
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "time": Utc::now().to_rfc3339(),
        "runtime": crate::health::snapshot_json(),
    }))
}

fn drop_with(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "message": message })))
}

/// POST /webhook/ai: the intake pipeline. Every non-error short-circuit
/// answers 2xx so the chat server does not re-deliver.
async fn handle_ai_webhook(
    State(state): State<AppState>,
    body: Result<Json<WebhookPayload>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(payload) = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("invalid webhook payload: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid payload" })),
            );
        }
    };

    let body_text = payload.body_text().to_string();
    let session_token = payload.instance_name;
    let info = payload.event.info;

    tracing::info!(
        session = %session_token,
        from = %info.sender,
        msg_type = %info.msg_type,
        from_me = info.is_from_me,
        "webhook received"
    );

    if info.is_from_me {
        return drop_with("Skipped: own message");
    }

    let from = normalize_jid(&info.sender);

    if info.msg_type != "text" || body_text.trim().is_empty() {
        tracing::debug!(msg_type = %info.msg_type, "non-text message ignored");
        return drop_with("Non-text message ignored");
    }

    let session = match state.directory.resolve_session(&session_token).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::warn!(session = %session_token, "session not found");
            return drop_with("Session not found");
        }
        Err(e) => {
            tracing::warn!(session = %session_token, "failed to resolve session: {e:#}");
            return drop_with("Session not found");
        }
    };

    if !session.bot_active {
        tracing::debug!(session = %session_token, "bot inactive");
        return drop_with("Bot inactive");
    }
    if !session.subscription_active {
        tracing::debug!(session = %session_token, "subscription inactive");
        return drop_with("Subscription inactive");
    }

    let turn = NewTurn {
        message_id: info.id.clone(),
        session_tok: session_token.clone(),
        from_jid: from.clone(),
        to_jid: info.chat.clone(),
        body: body_text.clone(),
        push_name: info.push_name.clone(),
        timestamp: info.timestamp,
    };

    match state.store.save_inbound_turn(&turn).await {
        Ok(SaveOutcome::Inserted) => {}
        Ok(SaveOutcome::Duplicate) => {
            tracing::info!(message_id = %info.id, "duplicate message skipped");
            return drop_with("Duplicate message");
        }
        Err(e) => {
            tracing::error!("failed to save chat message: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to save message" })),
            );
        }
    }

    if let Err(e) = state.store.prune_turns(&session_token, &from).await {
        tracing::error!("failed to prune turn window: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to save message" })),
        );
    }

    // Permanent history is off the critical path.
    {
        let store = state.store.clone();
        let session_tok = session_token.clone();
        let sender = from.clone();
        let recipient = info.chat.clone();
        let text = body_text.clone();
        let push_name = info.push_name.clone();
        let timestamp = info.timestamp;
        tokio::spawn(async move {
            if let Err(e) = store
                .append_history(
                    &session_tok,
                    &sender,
                    &recipient,
                    &text,
                    &push_name,
                    timestamp,
                    false,
                )
                .await
            {
                tracing::warn!("failed to save to chat history: {e:#}");
            }
        });
    }

    let job_id = match state
        .store
        .enqueue_job(&session_token, &info.id, &session.user_id, &body_text)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("failed to enqueue job: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to enqueue job" })),
            );
        }
    };

    // The insert trigger has already fired the queue notification.
    tracing::info!(job_id, message_id = %info.id, "job queued");

    (
        StatusCode::OK,
        Json(json!({
            "status": "queued",
            "message_id": info.id,
            "job_id": job_id,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_device_suffix_is_stripped() {
        assert_eq!(
            normalize_jid("6281233784490:24@s.whatsapp.net"),
            "6281233784490@s.whatsapp.net"
        );
    }

    #[test]
    fn jid_without_suffix_is_unchanged() {
        assert_eq!(
            normalize_jid("6281233784490@s.whatsapp.net"),
            "6281233784490@s.whatsapp.net"
        );
    }

    #[test]
    fn jid_with_colon_but_no_domain_is_unchanged() {
        assert_eq!(normalize_jid("broken:value"), "broken:value");
    }

    #[test]
    fn payload_parses_conversation_body() {
        let json = r#"{
            "instanceName": "sess-1",
            "event": {
                "Info": {
                    "ID": "m1",
                    "Sender": "628123:2@s.whatsapp.net",
                    "Chat": "628123@s.whatsapp.net",
                    "Type": "text",
                    "PushName": "Budi",
                    "Timestamp": "2025-01-15T10:30:00Z",
                    "IsFromMe": false
                },
                "Message": {"conversation": "halo"}
            }
        }"#;
        let payload: WebhookPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.instance_name, "sess-1");
        assert_eq!(payload.event.info.id, "m1");
        assert_eq!(payload.body_text(), "halo");
        assert!(!payload.event.info.is_from_me);
    }

    #[test]
    fn extended_text_wins_over_conversation() {
        let json = r#"{
            "instanceName": "sess-1",
            "event": {
                "Info": {
                    "ID": "m2",
                    "Sender": "628@s.whatsapp.net",
                    "Chat": "628@s.whatsapp.net",
                    "Type": "text",
                    "Timestamp": "2025-01-15T10:30:00Z"
                },
                "Message": {
                    "extendedTextMessage": {"text": "balasan berkutip"},
                    "conversation": "fallback"
                }
            }
        }"#;
        let payload: WebhookPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.body_text(), "balasan berkutip");
    }

    #[test]
    fn empty_extended_text_falls_back_to_conversation() {
        let json = r#"{
            "instanceName": "sess-1",
            "event": {
                "Info": {
                    "ID": "m3",
                    "Sender": "628@s.whatsapp.net",
                    "Chat": "628@s.whatsapp.net",
                    "Type": "text",
                    "Timestamp": "2025-01-15T10:30:00Z"
                },
                "Message": {
                    "extendedTextMessage": {"text": ""},
                    "conversation": "isi pesan"
                }
            }
        }"#;
        let payload: WebhookPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.body_text(), "isi pesan");
    }

    #[test]
    fn missing_message_block_yields_empty_body() {
        let json = r#"{
            "instanceName": "sess-1",
            "event": {
                "Info": {
                    "ID": "m4",
                    "Sender": "628@s.whatsapp.net",
                    "Chat": "628@s.whatsapp.net",
                    "Type": "image",
                    "Timestamp": "2025-01-15T10:30:00Z"
                }
            }
        }"#;
        let payload: WebhookPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.body_text(), "");
    }
}
