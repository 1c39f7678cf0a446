//! Outbound chat-server calls: reply delivery, typing indicators, and
//! mark-read. Replies go through the internal gateway (which owns session
//! validation and message tracking); presence and mark-read talk to the
//! chat server directly.

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Reply delivery failed. The worker treats this as transient and retries
/// the job; the provider gave no delivery confirmation, so a duplicate send
/// on retry is possible (at-most-once is not exactly-once).
#[derive(Debug, Error)]
#[error("chat gateway returned {status}")]
pub struct SendFailed {
    pub status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Composing,
    Stop,
}

impl TypingState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Composing => "composing",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Serialize)]
struct SendTextRequest<'a> {
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    to: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct TypingStateRequest<'a> {
    #[serde(rename = "Phone")]
    phone: &'a str,
    #[serde(rename = "State")]
    state: &'a str,
}

#[derive(Debug, Serialize)]
struct MarkReadRequest<'a> {
    #[serde(rename = "Id")]
    ids: &'a [String],
    #[serde(rename = "ChatPhone")]
    chat_phone: &'a str,
}

#[derive(Clone)]
pub struct ChatServerClient {
    gateway_url: String,
    server_url: Option<String>,
    client: Client,
}

impl ChatServerClient {
    pub fn new(gateway_url: &str, server_url: Option<&str>) -> Self {
        Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            server_url: server_url.map(|u| u.trim_end_matches('/').to_string()),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Deliver a reply through the internal gateway.
    pub async fn send_text(&self, session_token: &str, to: &str, text: &str) -> Result<()> {
        let url = format!("{}/wa/chat/send/text", self.gateway_url);
        let payload = SendTextRequest {
            session_id: session_token,
            to,
            text,
        };

        let response = self
            .client
            .post(&url)
            .header("token", session_token)
            .json(&payload)
            .send()
            .await
            .context("failed to reach chat gateway")?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendFailed {
                status: status.as_u16(),
            }
            .into());
        }
        Ok(())
    }

    /// Best-effort typing indicator ("composing" before the model call,
    /// "stop" after).
    pub async fn set_typing(
        &self,
        session_token: &str,
        phone: &str,
        state: TypingState,
    ) -> Result<()> {
        let Some(server_url) = &self.server_url else {
            bail!("WHATSAPP_SERVER_API not configured");
        };

        let url = format!("{server_url}/chat/presence");
        let payload = TypingStateRequest {
            phone,
            state: state.as_str(),
        };

        let response = self
            .client
            .post(&url)
            .header("token", session_token)
            .json(&payload)
            .send()
            .await
            .context("failed to send typing state")?;

        if !response.status().is_success() {
            bail!("typing state request failed with status {}", response.status());
        }
        Ok(())
    }

    /// Best-effort mark-read on the chat server.
    pub async fn mark_read(
        &self,
        session_token: &str,
        message_ids: &[String],
        chat_phone: &str,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let Some(server_url) = &self.server_url else {
            bail!("WHATSAPP_SERVER_API not configured");
        };

        let url = format!("{server_url}/chat/markread");
        let payload = MarkReadRequest {
            ids: message_ids,
            chat_phone,
        };

        let response = self
            .client
            .post(&url)
            .header("token", session_token)
            .json(&payload)
            .send()
            .await
            .context("failed to send markread request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("chat server markread returned {status}: {body}");
        }
        Ok(())
    }
}
