// Scripted test doubles for the LLM contract
// Used by this crate's test suites and available to downstream consumers

//! # Testing Support
//!
//! [`MockLLMClient`] replays a scripted sequence of responses (or failures)
//! and records every prompt it receives, so tests can drive the decision
//! engine, the agent pool, and full workflow runs without a provider.

use crate::llm::{InvokeOptions, LLMClient, LLMClientFactory, TokenUsage};
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Return this text
    Text(String),
    /// Fail with this error message as an `LlmApi` error
    Failure(String),
    /// Fail with a rate-limit error (retryable)
    RateLimited(String),
}

/// Scripted LLM client. Responses are consumed in order; once the script is
/// exhausted the client keeps returning the last entry (or a fixed fallback
/// when the script is empty).
pub struct MockLLMClient {
    responses: Mutex<Vec<MockResponse>>,
    position: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    usage: TokenUsage,
    cost_per_token: f64,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            position: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            usage: TokenUsage::new(100, 50),
            cost_per_token: 0.00001,
        }
    }

    /// Script a single fixed reply.
    pub fn with_response(text: impl Into<String>) -> Self {
        let client = Self::new();
        client.push_response(MockResponse::Text(text.into()));
        client
    }

    /// Script a sequence of replies, consumed in order.
    pub fn with_script(responses: Vec<MockResponse>) -> Self {
        let client = Self::new();
        *client.responses.lock().unwrap() = responses;
        client
    }

    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().unwrap().push(response);
    }

    /// Override the reported token usage.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    /// Every prompt received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }
}

impl Default for MockLLMClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn invoke(&self, prompt: &str, _options: Option<InvokeOptions>) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let index = self.position.fetch_add(1, Ordering::SeqCst);

        let responses = self.responses.lock().unwrap();
        let response = if responses.is_empty() {
            MockResponse::Text("mock response".to_string())
        } else {
            responses[index.min(responses.len() - 1)].clone()
        };
        drop(responses);

        match response {
            MockResponse::Text(text) => Ok(text),
            MockResponse::Failure(message) => Err(OrchestratorError::LlmApi(message)),
            MockResponse::RateLimited(message) => Err(OrchestratorError::LlmRateLimit(message)),
        }
    }

    fn get_token_usage(&self) -> TokenUsage {
        self.usage
    }

    fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        f64::from(usage.total_tokens) * self.cost_per_token
    }
}

/// Factory handing out clones of a shared script, or per-agent clients when
/// configured with `for_agent`.
pub struct MockClientFactory {
    default_client: Arc<MockLLMClient>,
    per_agent: Mutex<std::collections::HashMap<String, Arc<MockLLMClient>>>,
    fail_for: Mutex<std::collections::HashSet<String>>,
}

impl MockClientFactory {
    pub fn new(default_client: Arc<MockLLMClient>) -> Self {
        Self {
            default_client,
            per_agent: Mutex::new(std::collections::HashMap::new()),
            fail_for: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Use a dedicated client for one agent role.
    pub fn for_agent(&self, name: impl Into<String>, client: Arc<MockLLMClient>) {
        self.per_agent.lock().unwrap().insert(name.into(), client);
    }

    /// Make client creation fail for one agent role.
    pub fn fail_creation_for(&self, name: impl Into<String>) {
        self.fail_for.lock().unwrap().insert(name.into());
    }
}

#[async_trait]
impl LLMClientFactory for MockClientFactory {
    async fn create_client(&self, agent_name: &str) -> Result<Arc<dyn LLMClient>> {
        if self.fail_for.lock().unwrap().contains(agent_name) {
            return Err(OrchestratorError::AgentPool(format!(
                "failed to create LLM client for agent '{agent_name}'"
            )));
        }
        if let Some(client) = self.per_agent.lock().unwrap().get(agent_name) {
            return Ok(client.clone() as Arc<dyn LLMClient>);
        }
        Ok(self.default_client.clone() as Arc<dyn LLMClient>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_is_consumed_in_order_then_last_entry_repeats() {
        let client = MockLLMClient::with_script(vec![
            MockResponse::Text("one".to_string()),
            MockResponse::Text("two".to_string()),
        ]);
        assert_eq!(client.invoke("a", None).await.unwrap(), "one");
        assert_eq!(client.invoke("b", None).await.unwrap(), "two");
        assert_eq!(client.invoke("c", None).await.unwrap(), "two");
        assert_eq!(client.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_llm_errors() {
        let client =
            MockLLMClient::with_script(vec![MockResponse::RateLimited("slow down".to_string())]);
        let err = client.invoke("p", None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LlmRateLimit(_)));
    }
}
