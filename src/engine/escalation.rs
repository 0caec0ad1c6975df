// Durable escalation queue - the human-in-the-loop channel

//! # Escalation Queue
//!
//! One JSON file per escalation under the configured directory, named
//! `<id>.json` with ids of the form `esc-<uuid>`. Writes go through
//! tmp + rename so a crash can never leave a half-written record. The
//! directory is created lazily.
//!
//! A paused workflow waits on [`EscalationQueue::wait_for_resolution`],
//! which wakes promptly on [`EscalationQueue::respond`] via an internal
//! notifier and falls back to polling well inside the 1 s bound.

use crate::engine::state::write_atomic;
use crate::models::{Escalation, EscalationRequest, EscalationStatus};
use crate::{OrchestratorError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Optional filters for [`EscalationQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct EscalationFilter {
    pub status: Option<EscalationStatus>,
    pub workflow_id: Option<String>,
}

/// Aggregate view over the whole store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationMetrics {
    pub total: usize,
    pub resolved: usize,
    /// Mean resolution time in ms over resolved escalations; 0 when none
    pub average_resolution_time_ms: f64,
    /// workflowId -> escalation count, across all statuses
    pub category_breakdown: HashMap<String, u64>,
}

/// Durable, human-visible store of unresolved questions.
pub struct EscalationQueue {
    dir: PathBuf,
    resolved_notify: Notify,
}

impl EscalationQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            resolved_notify: Notify::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write_record(&self, escalation: &Escalation) -> Result<()> {
        let json = serde_json::to_string_pretty(escalation)?;
        write_atomic(&self.record_path(&escalation.id), &json).await
    }

    /// Persist a new pending escalation and announce it. Returns the id.
    pub async fn add(&self, request: EscalationRequest) -> Result<String> {
        let escalation = Escalation::from_request(request);
        self.write_record(&escalation).await?;
        info!(
            id = %escalation.id,
            workflow = %escalation.workflow_id,
            confidence = escalation.confidence,
            "escalation requires human attention: {}",
            escalation.question
        );
        Ok(escalation.id)
    }

    /// Read one escalation; a missing record raises.
    pub async fn get_by_id(&self, id: &str) -> Result<Escalation> {
        let path = self.record_path(id);
        let text = fs::read_to_string(&path).await.map_err(|e| {
            OrchestratorError::Fatal(format!("escalation {id} not found: {e}"))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Enumerate the store, newest unordered, applying the optional filter.
    /// Unparseable files are skipped with a warning rather than failing the
    /// whole listing.
    pub async fn list(&self, filter: Option<EscalationFilter>) -> Result<Vec<Escalation>> {
        let mut escalations = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(escalations),
            Err(e) => {
                return Err(OrchestratorError::Fatal(format!(
                    "cannot list escalations in {}: {e}",
                    self.dir.display()
                )))
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            OrchestratorError::Fatal(format!("cannot enumerate escalation directory: {e}"))
        })? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), %e, "skipping unreadable escalation file");
                    continue;
                }
            };
            match serde_json::from_str::<Escalation>(&text) {
                Ok(escalation) => escalations.push(escalation),
                Err(e) => warn!(path = %path.display(), %e, "skipping corrupt escalation file"),
            }
        }

        if let Some(filter) = filter {
            escalations.retain(|e| {
                filter.status.map_or(true, |s| e.status == s)
                    && filter
                        .workflow_id
                        .as_ref()
                        .map_or(true, |w| &e.workflow_id == w)
            });
        }
        Ok(escalations)
    }

    /// Apply a human response. Rejects records that are not pending; the
    /// error message contains `not pending`.
    pub async fn respond(&self, id: &str, text: impl Into<String>) -> Result<Escalation> {
        let mut escalation = self.get_by_id(id).await?;
        if escalation.status != EscalationStatus::Pending {
            return Err(OrchestratorError::Fatal(format!(
                "escalation {id} is not pending"
            )));
        }
        escalation.resolve(text.into());
        self.write_record(&escalation).await?;
        self.resolved_notify.notify_waiters();
        info!(id = %escalation.id, "escalation resolved");
        Ok(escalation)
    }

    /// Aggregate metrics over the whole store.
    pub async fn get_metrics(&self) -> Result<EscalationMetrics> {
        let escalations = self.list(None).await?;
        let total = escalations.len();
        let resolved: Vec<_> = escalations
            .iter()
            .filter(|e| e.status == EscalationStatus::Resolved)
            .collect();
        let average_resolution_time_ms = if resolved.is_empty() {
            0.0
        } else {
            let sum: i64 = resolved.iter().filter_map(|e| e.resolution_time).sum();
            sum as f64 / resolved.len() as f64
        };
        let mut category_breakdown: HashMap<String, u64> = HashMap::new();
        for escalation in &escalations {
            *category_breakdown
                .entry(escalation.workflow_id.clone())
                .or_default() += 1;
        }
        Ok(EscalationMetrics {
            total,
            resolved: resolved.len(),
            average_resolution_time_ms,
            category_breakdown,
        })
    }

    /// Suspend until the escalation is resolved (returning it with the
    /// response) or the token is cancelled. Wakes on `respond` and polls as
    /// a backstop, well inside the 1 s bound.
    pub async fn wait_for_resolution(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Escalation> {
        loop {
            let escalation = self.get_by_id(id).await?;
            if escalation.status == EscalationStatus::Resolved {
                return Ok(escalation);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled(format!(
                        "cancelled while waiting on escalation {id}"
                    )));
                }
                _ = self.resolved_notify.notified() => {}
                _ = sleep(Duration::from_millis(500)) => {}
            }
        }
    }
}
