// Common traits for LLM clients
// These define the interface every provider integration must satisfy

use super::TokenUsage;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-invocation options. Everything is optional; a client applies its own
/// defaults for anything unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl InvokeOptions {
    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: None,
        }
    }
}

/// Core trait every LLM client must implement.
///
/// Invocation errors should be raised as the LLM kinds of
/// [`crate::OrchestratorError`] (`LlmApi`, `LlmRateLimit`,
/// `LlmAuthentication`) so the retry handler can classify them.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Send a prompt and return the completion text.
    async fn invoke(&self, prompt: &str, options: Option<InvokeOptions>) -> Result<String>;

    /// Token usage of the most recent invocation.
    fn get_token_usage(&self) -> TokenUsage;

    /// Estimated cost in dollars for the given usage.
    fn estimate_cost(&self, usage: &TokenUsage) -> f64;
}

/// Factory through which the agent pool obtains a client for a named agent
/// role. Injected at pool construction; the pool never constructs clients
/// itself.
#[async_trait]
pub trait LLMClientFactory: Send + Sync {
    async fn create_client(&self, agent_name: &str) -> Result<Arc<dyn LLMClient>>;
}
