use super::error::ModelError;
use async_trait::async_trait;

/// A successful model call: the reply text plus token counts reported by the
/// provider's own metadata.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait ModelClient: Send + Sync + std::fmt::Debug {
    /// Send one prompt and wait for the full reply. The caller owns the hard
    /// deadline; implementations set a matching HTTP client timeout.
    async fn ask(&self, system_prompt: &str, user_message: &str)
        -> Result<ChatOutcome, ModelError>;

    fn provider_name(&self) -> &'static str;

    fn model_name(&self) -> &str;
}
