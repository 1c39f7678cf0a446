//! Hourly OpenRouter balance check. Observability only: low balances are
//! logged, never acted on.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;

const CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
const WARN_BELOW_USD: f64 = 5.0;
const CRITICAL_BELOW_USD: f64 = 1.0;
const HIGH_DAILY_USAGE_USD: f64 = 1.0;

#[derive(Debug, Deserialize)]
pub struct CreditInfo {
    pub data: CreditData,
}

#[derive(Debug, Deserialize)]
pub struct CreditData {
    pub limit_remaining: Option<f64>,
    #[serde(default)]
    pub usage_daily: f64,
    #[serde(default)]
    pub usage_weekly: f64,
    #[serde(default)]
    pub usage_monthly: f64,
    #[serde(default)]
    pub is_free_tier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceLevel {
    Ok,
    Warning,
    Critical,
}

pub fn classify_balance(remaining_usd: f64) -> BalanceLevel {
    if remaining_usd < CRITICAL_BELOW_USD {
        BalanceLevel::Critical
    } else if remaining_usd < WARN_BELOW_USD {
        BalanceLevel::Warning
    } else {
        BalanceLevel::Ok
    }
}

pub struct CreditMonitor {
    api_key: String,
    client: Client,
}

impl CreditMonitor {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub async fn check(&self) -> Result<CreditInfo> {
        let response = self
            .client
            .get("https://openrouter.ai/api/v1/auth/key")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .context("credit check request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("credit API returned {}", response.status());
        }

        response
            .json::<CreditInfo>()
            .await
            .context("failed to decode credit info")
    }

    fn report(info: &CreditInfo) {
        let data = &info.data;
        if let Some(remaining) = data.limit_remaining {
            match classify_balance(remaining) {
                BalanceLevel::Critical => tracing::error!(
                    remaining_usd = remaining,
                    "credit balance critical"
                ),
                BalanceLevel::Warning => tracing::warn!(
                    remaining_usd = remaining,
                    "credit balance running low"
                ),
                BalanceLevel::Ok => tracing::info!(
                    remaining_usd = remaining,
                    daily_usd = data.usage_daily,
                    weekly_usd = data.usage_weekly,
                    monthly_usd = data.usage_monthly,
                    "credit balance"
                ),
            }
        }

        if data.usage_daily > HIGH_DAILY_USAGE_USD {
            tracing::warn!(daily_usd = data.usage_daily, "high daily model usage");
        }
    }

    /// Check immediately, then hourly until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.check().await {
            Ok(info) => {
                crate::health::mark_component_ok("credit-monitor");
                Self::report(&info);
            }
            Err(e) => {
                crate::health::mark_component_error("credit-monitor", format!("{e:#}"));
                tracing::warn!("initial credit check failed: {e:#}");
            }
        }

        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        interval.tick().await; // the immediate first tick was handled above

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => match self.check().await {
                    Ok(info) => {
                        crate::health::mark_component_ok("credit-monitor");
                        Self::report(&info);
                    }
                    Err(e) => {
                        crate::health::mark_component_error("credit-monitor", format!("{e:#}"));
                        tracing::warn!("credit check failed: {e:#}");
                    }
                },
            }
        }

        tracing::info!("credit monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_thresholds() {
        assert_eq!(classify_balance(10.0), BalanceLevel::Ok);
        assert_eq!(classify_balance(5.0), BalanceLevel::Ok);
        assert_eq!(classify_balance(4.99), BalanceLevel::Warning);
        assert_eq!(classify_balance(1.0), BalanceLevel::Warning);
        assert_eq!(classify_balance(0.99), BalanceLevel::Critical);
        assert_eq!(classify_balance(0.0), BalanceLevel::Critical);
    }

    #[test]
    fn credit_info_deserializes_api_shape() {
        let json = r#"{
            "data": {
                "label": "sk-or-...",
                "limit": 20.0,
                "limit_remaining": 3.25,
                "usage": 16.75,
                "usage_daily": 0.4,
                "usage_weekly": 2.1,
                "usage_monthly": 9.8,
                "is_free_tier": false
            }
        }"#;
        let info: CreditInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.data.limit_remaining, Some(3.25));
        assert!(!info.data.is_free_tier);
    }

    #[test]
    fn missing_limit_fields_are_tolerated() {
        let info: CreditInfo = serde_json::from_str(r#"{"data": {}}"#).unwrap();
        assert!(info.data.limit_remaining.is_none());
        assert_eq!(info.data.usage_daily, 0.0);
    }
}
