//! Model backends and the guard around them.

pub mod breaker;
pub mod error;
pub mod gemini;
pub mod openrouter;
pub mod traits;

pub use breaker::{BreakerState, CircuitBreaker};
pub use error::{ErrorKind, ModelError};
pub use traits::{ChatOutcome, ModelClient};

use crate::config::{AiBackend, AiConfig};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Build the configured model backend.
pub fn create_model_client(ai: &AiConfig) -> Result<Arc<dyn ModelClient>> {
    match ai.backend {
        AiBackend::OpenRouter => {
            let client = openrouter::OpenRouterClient::new(ai)
                .context("failed to initialize OpenRouter backend")?;
            Ok(Arc::new(client))
        }
        AiBackend::Gemini => {
            let client =
                gemini::GeminiClient::new(ai).context("failed to initialize Gemini backend")?;
            Ok(Arc::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn factory_reports_missing_key_for_selected_backend() {
        let ai = Config::from_lookup(|_| None).unwrap().ai;
        let err = create_model_client(&ai).unwrap_err();
        assert!(format!("{err:#}").contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn factory_builds_openrouter_when_key_present() {
        let ai = Config::from_lookup(|key| {
            (key == "OPENROUTER_API_KEY").then(|| "or-key".to_string())
        })
        .unwrap()
        .ai;
        let client = create_model_client(&ai).unwrap();
        assert_eq!(client.provider_name(), "openrouter");
    }

    #[test]
    fn factory_builds_gemini_when_selected() {
        let ai = Config::from_lookup(|key| match key {
            "AI_PROVIDER" => Some("gemini".to_string()),
            "GEMINI_API_KEY" => Some("g-key".to_string()),
            _ => None,
        })
        .unwrap()
        .ai;
        let client = create_model_client(&ai).unwrap();
        assert_eq!(client.provider_name(), "gemini");
    }
}
