//! HTTP directory backend, talking to the transactional platform API.

use super::{BotSettings, Directory, SessionInfo, UsageLog};
use crate::config::Config;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

pub struct ApiDirectory {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

/// Platform response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
}

impl ApiDirectory {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.transactional_api_url.trim_end_matches('/').to_string(),
            api_key: config.internal_api_key.clone(),
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }
}

#[async_trait]
impl Directory for ApiDirectory {
    async fn resolve_session(&self, token: &str) -> Result<Option<SessionInfo>> {
        let url = format!("{}/whatsapp/session/resolve?token={token}", self.base_url);
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .context("failed to call session resolve API")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("session resolve API returned {status}: {body}");
        }

        let envelope: Envelope<SessionInfo> = response
            .json()
            .await
            .context("failed to decode session resolve response")?;

        if !envelope.success {
            return Ok(None);
        }
        Ok(envelope.data)
    }

    async fn get_bot_settings(&self, user_id: &str, session_token: &str) -> Result<BotSettings> {
        let url = format!(
            "{}/whatsapp/bot/settings?userId={user_id}&sessionToken={session_token}",
            self.base_url
        );
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .context("failed to call bot settings API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("bot settings API returned {status}: {body}");
        }

        let envelope: Envelope<BotSettings> = response
            .json()
            .await
            .context("failed to decode bot settings response")?;

        if !envelope.success {
            bail!("bot settings API returned success=false");
        }
        envelope
            .data
            .ok_or_else(|| anyhow::anyhow!("bot settings API returned no data"))
    }

    async fn log_usage(&self, entry: &UsageLog) -> Result<()> {
        let url = format!("{}/customer/ai/usage", self.base_url);
        let payload = serde_json::json!({
            "userId": entry.user_id,
            "sessionId": entry.session_id,
            "inputTokens": entry.input_tokens,
            "outputTokens": entry.output_tokens,
            "totalTokens": entry.total_tokens,
            "latencyMs": entry.latency_ms,
            "status": entry.status,
            "errorReason": entry.error_reason,
        });

        let response = self
            .with_auth(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .context("failed to call usage log API")?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            bail!("usage log API returned {status}: {body}");
        }
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        // Any HTTP response at all means the API is up; a dummy token is
        // expected to 404.
        let url = format!("{}/whatsapp/session/resolve?token=healthcheck", self.base_url);
        self.client
            .get(&url)
            .send()
            .await
            .context("transactional API not reachable")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn api(base: &str, key: Option<&str>) -> ApiDirectory {
        let cfg = Config::from_lookup(|name| match name {
            "TRANSACTIONAL_API_URL" => Some(base.to_string()),
            "INTERNAL_API_KEY" => key.map(ToString::to_string),
            _ => None,
        })
        .unwrap();
        ApiDirectory::new(&cfg)
    }

    #[test]
    fn strips_trailing_slash() {
        let dir = api("http://api.internal/", None);
        assert_eq!(dir.base_url, "http://api.internal");
    }

    #[test]
    fn envelope_with_data_parses() {
        let json = r#"{"success": true, "data": {"userId": "u1", "botActive": true,
                       "subscriptionActive": true, "sessionToken": "s1"}}"#;
        let env: Envelope<SessionInfo> = serde_json::from_str(json).unwrap();
        assert!(env.success);
        assert_eq!(env.data.unwrap().user_id, "u1");
    }

    #[test]
    fn envelope_failure_parses_without_data() {
        let json = r#"{"success": false}"#;
        let env: Envelope<SessionInfo> = serde_json::from_str(json).unwrap();
        assert!(!env.success);
        assert!(env.data.is_none());
    }

    #[tokio::test]
    async fn unreachable_api_surfaces_error() {
        let dir = api("http://127.0.0.1:1", Some("key"));
        assert!(dir.resolve_session("tok").await.is_err());
        assert!(dir.check_health().await.is_err());
    }
}
