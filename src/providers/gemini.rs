//! Google Gemini backend (`generateContent` API).

use super::error::{ErrorKind, ModelError};
use super::traits::{ChatOutcome, ModelClient};
use crate::config::AiConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: i64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: i64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiClient {
    pub fn new(ai: &AiConfig) -> anyhow::Result<Self> {
        let api_key = ai
            .gemini_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY not set in environment"))?;

        let client = Client::builder()
            .timeout(ai.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        tracing::info!(
            model = %ai.gemini_model,
            timeout_ms = ai.timeout.as_millis() as u64,
            "Gemini client initialized"
        );

        Ok(Self {
            api_key,
            model: ai.gemini_model.clone(),
            base_url: GEMINI_BASE_URL.to_string(),
            client,
        })
    }

    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn ask(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ChatOutcome, ModelError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".into()),
                parts: vec![Part {
                    text: user_message.to_string(),
                }],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            }),
            generation_config: GenerationConfig {
                temperature: 0.3,
                max_output_tokens: 8192,
            },
        };

        let started = Instant::now();
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url,
            self.model_path(),
            self.api_key
        );

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::timeout()
            } else {
                ModelError::from_message(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GenerateContentResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .map_or(body, |e| e.message);
            return Err(ModelError::from_status(status.as_u16(), message));
        }

        let result: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_message(e.to_string()))?;

        if let Some(err) = result.error {
            return Err(ModelError::from_message(err.message));
        }

        let text = result
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ModelError::new(ErrorKind::Other, 500, "empty response from Gemini"))?;

        let usage = result.usage_metadata.unwrap_or(UsageMetadata {
            prompt_token_count: 0,
            candidates_token_count: 0,
        });

        tracing::info!(
            model = %self.model,
            latency_ms = started.elapsed().as_millis() as u64,
            input_tokens = usage.prompt_token_count,
            output_tokens = usage.candidates_token_count,
            "Gemini call succeeded"
        );

        Ok(ChatOutcome {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        })
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiBackend, Config};

    fn ai_config(key: Option<&str>) -> AiConfig {
        let mut cfg = Config::from_lookup(|_| None).unwrap().ai;
        cfg.backend = AiBackend::Gemini;
        cfg.gemini_api_key = key.map(ToString::to_string);
        cfg
    }

    #[test]
    fn requires_api_key() {
        let err = GeminiClient::new(&ai_config(None)).unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn model_path_prefixes_bare_names() {
        let client = GeminiClient::new(&ai_config(Some("g-key"))).unwrap();
        assert_eq!(client.model_path(), "models/gemini-2.5-flash");

        let mut cfg = ai_config(Some("g-key"));
        cfg.gemini_model = "models/gemini-1.5-pro".into();
        let client = GeminiClient::new(&cfg).unwrap();
        assert_eq!(client.model_path(), "models/gemini-1.5-pro");
    }

    #[test]
    fn request_serializes_system_instruction() {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".into()),
                parts: vec![Part {
                    text: "halo".into(),
                }],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: "Be helpful".into(),
                }],
            }),
            generation_config: GenerationConfig {
                temperature: 0.3,
                max_output_tokens: 8192,
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"systemInstruction\""));
        assert!(json.contains("\"maxOutputTokens\":8192"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn response_with_usage_deserializes() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "Halo juga!"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 5}
        }"#;
        let resp: GenerateContentResponse = serde_json::from_str(json).unwrap();
        let usage = resp.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 12);
        assert_eq!(usage.candidates_token_count, 5);
    }

    #[test]
    fn error_body_deserializes() {
        let json = r#"{"error": {"message": "API key not valid"}}"#;
        let resp: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.unwrap().message, "API key not valid");
    }
}
