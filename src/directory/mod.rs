//! The session/bot/usage directory: a narrow facade over the transactional
//! platform, reachable either through its HTTP API or by reading its
//! database directly.
//!
//! Everything the dispatcher knows about users, subscriptions, and bot
//! configuration flows through these four operations.

use crate::config::{Config, DataAccessMode};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub mod api;
pub mod db;

pub use api::ApiDirectory;
pub use db::DbDirectory;

/// Who owns a chat session and whether dispatch is allowed for it.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "botActive")]
    pub bot_active: bool,
    #[serde(rename = "subscriptionActive")]
    pub subscription_active: bool,
    #[serde(rename = "sessionToken")]
    pub session_token: String,
}

/// A knowledge-base document attached to a bot.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
    pub kind: String,
}

/// Bot configuration used for prompt assembly.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotSettings {
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: String,
    #[serde(rename = "fallbackText", default)]
    pub fallback_text: String,
    #[serde(default)]
    pub documents: Vec<Document>,
}

/// One usage-log entry, appended after every terminal job outcome.
#[derive(Debug, Clone)]
pub struct UsageLog {
    pub user_id: String,
    pub session_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub status: String,
    pub error_reason: String,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Map a session token to its owner. `Ok(None)` means the session is
    /// unknown to the platform.
    async fn resolve_session(&self, token: &str) -> Result<Option<SessionInfo>>;

    async fn get_bot_settings(&self, user_id: &str, session_token: &str) -> Result<BotSettings>;

    async fn log_usage(&self, entry: &UsageLog) -> Result<()>;

    async fn check_health(&self) -> Result<()>;
}

/// Build the directory backend selected by `DATA_ACCESS_MODE`. Direct mode
/// connects to the transactional database and fails fast if the platform
/// schema is missing.
pub async fn create_directory(config: &Config) -> Result<Arc<dyn Directory>> {
    match config.data_access_mode {
        DataAccessMode::Api => {
            tracing::info!(url = %config.transactional_api_url, "directory: API mode");
            Ok(Arc::new(ApiDirectory::new(config)))
        }
        DataAccessMode::Direct => {
            let pool =
                crate::db::connect(&config.transactional_database.url(), "transactional").await?;
            let directory = DbDirectory::new(pool).await?;
            tracing::info!("directory: direct DB mode, all required tables verified");
            Ok(Arc::new(directory))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_info_deserializes_platform_shape() {
        let json = r#"{
            "userId": "u1",
            "botActive": true,
            "subscriptionActive": false,
            "sessionToken": "sess-1"
        }"#;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.user_id, "u1");
        assert!(info.bot_active);
        assert!(!info.subscription_active);
    }

    #[test]
    fn bot_settings_defaults_for_missing_fields() {
        let settings: BotSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.system_prompt.is_empty());
        assert!(settings.documents.is_empty());
    }

    #[test]
    fn bot_settings_with_documents() {
        let json = r#"{
            "systemPrompt": "Be nice",
            "documents": [
                {"title": "Pricing", "content": "...", "kind": "pricing"}
            ]
        }"#;
        let settings: BotSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.system_prompt, "Be nice");
        assert_eq!(settings.documents.len(), 1);
        assert_eq!(settings.documents[0].kind, "pricing");
    }
}
