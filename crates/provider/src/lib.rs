pub mod anthropic;
pub mod types;

mod error;
mod sse;

pub use error::ProviderError;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn supported_models(&self) -> &[ModelInfo];

    fn model_for_tier(&self, tier: ModelTier) -> Option<&ModelInfo> {
        let models = self.supported_models();
        models
            .iter()
            .find(|m| m.tier == tier)
            .or_else(|| models.first())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

/// Builds the configured provider. Only the Anthropic-style backend is
/// wired today (Dialect A in the tool-call decoder is literally Anthropic's
/// streaming format); the `Provider` trait exists so additional backends can
/// be added without touching the agent core.
pub fn create_provider(config: &lingcode_config::Config) -> Result<Box<dyn Provider>> {
    match config.provider.default.as_str() {
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::from_config(config)?)),
        other => Err(anyhow::anyhow!("unsupported provider: {other}")),
    }
}
