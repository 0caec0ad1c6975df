// Retry and error handling: classification, backoff, escalation

//! # Retry / Error Handler
//!
//! Every error in the core is one tag of [`OrchestratorError`]; this module
//! holds the pure functions over that tag ([`classify`], [`normalize`],
//! [`escalation_for`]) plus the [`RetryHandler`] that replays transient
//! failures with exponential backoff and jitter, keeps per-kind error
//! metrics, and renders persistent failures through the `on_escalation`
//! hook.
//!
//! Classification rules:
//! - messages containing `ECONNRESET`, `ETIMEDOUT`, or `ECONNREFUSED`
//!   normalise to the transient kind
//! - messages containing `EACCES` or `EPERM` normalise to the fatal kind
//! - domain kinds (worktree, state validation, template, variable, agent
//!   pool) are never retried and surface verbatim

use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Broad class of an error kind; the retry decision is `Transient` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff
    Transient,
    /// Never retried; surfaces immediately
    Fatal,
    /// Business-rule failure surfaced verbatim, no retry
    Domain,
}

/// Severity attached to a rendered failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EscalationLevel {
    Warning,
    Error,
    Critical,
}

/// User-visible failure rendering, delivered through the `on_escalation`
/// hook. This is the single surface through which failures become visible.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEscalation {
    pub level: EscalationLevel,
    pub message: String,
    pub suggested_actions: Vec<String>,
}

/// Per error-kind counters.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetric {
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_jitter: bool,
    /// Uniform jitter factor range is `[1 - p, 1 + p]`
    pub jitter_percent: f64,
    /// Allow one recovery attempt (provider fallback / wait-out) per
    /// operation before normal backoff resumes
    pub enable_recovery: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_jitter: true,
            jitter_percent: 0.2,
            enable_recovery: false,
        }
    }
}

/// Normalise raw transport errors onto the taxonomy by message content.
pub fn normalize(error: OrchestratorError) -> OrchestratorError {
    let message = error.to_string();
    if ["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED"]
        .iter()
        .any(|marker| message.contains(marker))
    {
        return OrchestratorError::Retryable(message);
    }
    if ["EACCES", "EPERM"].iter().any(|marker| message.contains(marker)) {
        return OrchestratorError::Fatal(message);
    }
    error
}

/// Pure classification over the (normalised) error tag.
pub fn classify(error: &OrchestratorError) -> ErrorClass {
    use OrchestratorError as E;
    let message = error.to_string();
    if ["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED"]
        .iter()
        .any(|marker| message.contains(marker))
    {
        return ErrorClass::Transient;
    }
    if ["EACCES", "EPERM"].iter().any(|marker| message.contains(marker)) {
        return ErrorClass::Fatal;
    }
    match error {
        E::Retryable(_)
        | E::LlmRateLimit(_)
        | E::LlmApi(_)
        | E::ResourceExhausted(_)
        | E::Timeout(_) => ErrorClass::Transient,
        E::Fatal(_) | E::LlmAuthentication(_) | E::Cancelled(_) | E::WorkflowParse(_) => {
            ErrorClass::Fatal
        }
        _ => ErrorClass::Domain,
    }
}

/// Escalation level and suggested actions for an error, rendered by the
/// caller's `on_escalation` hook.
pub fn escalation_for(error: &OrchestratorError) -> ErrorEscalation {
    use OrchestratorError as E;
    let (level, suggested_actions) = match error {
        E::LlmAuthentication(_) => (
            EscalationLevel::Critical,
            vec!["check credentials".to_string(), "verify the provider API key".to_string()],
        ),
        E::Fatal(_) | E::Cancelled(_) => (
            EscalationLevel::Critical,
            vec!["inspect the orchestrator log".to_string()],
        ),
        E::LlmRateLimit(_) => (
            EscalationLevel::Error,
            vec!["check API rate limit".to_string(), "reduce maxConcurrentAgents".to_string()],
        ),
        E::ResourceExhausted(_) => (
            EscalationLevel::Warning,
            vec!["wait and retry".to_string(), "raise the resource budget".to_string()],
        ),
        _ => (
            EscalationLevel::Error,
            vec!["inspect the orchestrator log".to_string()],
        ),
    };
    ErrorEscalation {
        level,
        message: error.to_string(),
        suggested_actions,
    }
}

type ShouldRetry = Arc<dyn Fn(&OrchestratorError) -> bool + Send + Sync>;
type OnRetry = Arc<dyn Fn(&OrchestratorError, u32, u64) + Send + Sync>;
type OnEscalation = Arc<dyn Fn(ErrorEscalation) + Send + Sync>;

/// Per-call overrides for [`RetryHandler::execute_with_retry`].
#[derive(Default, Clone)]
pub struct RetryOptions {
    /// Veto retrying an otherwise-transient error
    pub should_retry: Option<ShouldRetry>,
    /// Fired before each backoff sleep with (error, attempt, delay_ms)
    pub on_retry: Option<OnRetry>,
}

/// Classifies errors, retries transient ones with exponential backoff and
/// jitter, and escalates persistent failures.
pub struct RetryHandler {
    config: RetryConfig,
    metrics: DashMap<&'static str, ErrorMetric>,
    on_escalation: Option<OnEscalation>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: DashMap::new(),
            on_escalation: None,
        }
    }

    /// Install the single user-visible failure surface.
    pub fn with_escalation_hook(mut self, hook: OnEscalation) -> Self {
        self.on_escalation = Some(hook);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The deterministic (non-jittered) delay sequence, for observability.
    pub fn get_retry_sequence(&self) -> Vec<u64> {
        (0..self.config.max_retries)
            .map(|attempt| self.base_delay(attempt))
            .collect()
    }

    fn base_delay(&self, attempt: u32) -> u64 {
        let exponential = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        (exponential.min(self.config.max_delay_ms as f64)) as u64
    }

    fn jittered_delay(&self, attempt: u32) -> u64 {
        let base = self.base_delay(attempt) as f64;
        if !self.config.enable_jitter {
            return base as u64;
        }
        let p = self.config.jitter_percent;
        let factor = rand::thread_rng().gen_range((1.0 - p)..=(1.0 + p));
        (base * factor) as u64
    }

    fn record(&self, error: &OrchestratorError) {
        let now = Utc::now();
        self.metrics
            .entry(error.kind_name())
            .and_modify(|metric| {
                metric.count += 1;
                metric.last_seen = now;
            })
            .or_insert(ErrorMetric {
                count: 1,
                first_seen: now,
                last_seen: now,
            });
    }

    fn escalate(&self, error: &OrchestratorError) {
        if let Some(hook) = &self.on_escalation {
            hook(escalation_for(error));
        }
    }

    /// Run `operation`, retrying transient failures up to `max_retries`
    /// times with backoff. Fatal and domain errors re-raise immediately;
    /// exhaustion re-raises with a message containing
    /// `Operation failed after N retries`.
    pub async fn execute_with_retry<T, F, Fut>(&self, name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retry_opts(name, operation, RetryOptions::default())
            .await
    }

    pub async fn execute_with_retry_opts<T, F, Fut>(
        &self,
        name: &str,
        operation: F,
        options: RetryOptions,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut recovery_spent = false;
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(raw) => {
                    let error = normalize(raw);
                    self.record(&error);

                    // One-shot recovery before normal backoff resumes
                    if self.config.enable_recovery && !recovery_spent {
                        match &error {
                            OrchestratorError::LlmApi(message) => {
                                recovery_spent = true;
                                warn!(operation = name, %message, "attempting provider fallback recovery");
                                continue;
                            }
                            OrchestratorError::ResourceExhausted(message) => {
                                recovery_spent = true;
                                warn!(operation = name, %message, "resource exhausted; waiting out the window");
                                sleep(Duration::from_millis(self.config.max_delay_ms)).await;
                                continue;
                            }
                            _ => {}
                        }
                    }

                    let retry_allowed = classify(&error) == ErrorClass::Transient
                        && options.should_retry.as_ref().map_or(true, |f| f(&error));

                    if !retry_allowed {
                        self.escalate(&error);
                        return Err(error);
                    }
                    if attempt >= self.config.max_retries {
                        let exhausted = OrchestratorError::Retryable(format!(
                            "Operation failed after {} retries: {error}",
                            self.config.max_retries
                        ));
                        self.escalate(&exhausted);
                        return Err(exhausted);
                    }

                    let delay = self.jittered_delay(attempt);
                    attempt += 1;
                    if let Some(on_retry) = &options.on_retry {
                        on_retry(&error, attempt, delay);
                    }
                    debug!(
                        operation = name,
                        attempt,
                        delay_ms = delay,
                        error = %error,
                        "retrying after transient failure"
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Wrap any operation in a deadline. A breach raises a retryable
    /// timeout; errors the operation itself produced keep their own kind.
    pub async fn execute_with_timeout<T, Fut>(&self, operation: Fut, ms: u64) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match timeout(Duration::from_millis(ms), operation).await {
            Ok(result) => result,
            Err(_) => {
                let error = OrchestratorError::Timeout(ms);
                self.record(&error);
                Err(error)
            }
        }
    }

    /// Snapshot of the per-kind error counters.
    pub fn get_error_metrics(&self) -> HashMap<String, ErrorMetric> {
        self.metrics
            .iter()
            .map(|entry| ((*entry.key()).to_string(), *entry.value()))
            .collect()
    }

    pub fn reset_error_metrics(&self) {
        self.metrics.clear();
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
