// LLM client contract - the provider-opaque seam of the core

//! # LLM Contract Module
//!
//! The orchestration core never talks to a provider SDK directly. Agents are
//! bound to anything implementing [`LLMClient`], and the agent pool obtains
//! clients through an injected [`LLMClientFactory`]. Provider, model, and
//! authentication are entirely the collaborator's business.

pub mod cost;
pub mod traits;

pub use cost::{Budget, BudgetStatus, CostTracker};
pub use traits::{InvokeOptions, LLMClient, LLMClientFactory};

use serde::{Deserialize, Serialize};

/// Token counts reported by a client after an invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}
