// Budget tracking for agent spend

//! # Cost Tracking
//!
//! The agent pool accumulates estimated spend per agent role; this module
//! adds the budget layer on top: per-workflow and daily limits with a
//! warning threshold, checked before each invocation. Exceeding a limit
//! surfaces as [`crate::OrchestratorError::ResourceExhausted`], which the
//! retry handler's recovery path knows how to wait out.

use crate::{OrchestratorError, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// A spend limit in dollars with a fractional warning threshold.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub limit: f64,
    /// Fraction of the limit at which [`BudgetStatus::is_warning`] trips
    pub warning_threshold: f64,
}

impl Budget {
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            warning_threshold: 0.8,
        }
    }
}

/// Result of a budget check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub spent: f64,
    pub limit: f64,
    pub percentage_used: f64,
    pub is_warning: bool,
    pub is_exceeded: bool,
}

#[derive(Debug, Default)]
struct SpendLedger {
    by_workflow: HashMap<String, f64>,
    daily_total: f64,
    day: Option<(i32, u32, u32)>,
}

impl SpendLedger {
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = (now.year(), now.month(), now.day());
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily_total = 0.0;
        }
    }
}

/// Tracks spend per workflow and per day against optional budgets.
#[derive(Debug, Default)]
pub struct CostTracker {
    daily_budget: Option<Budget>,
    workflow_budget: Option<Budget>,
    ledger: RwLock<SpendLedger>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_daily_budget(mut self, budget: Budget) -> Self {
        self.daily_budget = Some(budget);
        self
    }

    pub fn with_workflow_budget(mut self, budget: Budget) -> Self {
        self.workflow_budget = Some(budget);
        self
    }

    /// Record spend attributed to a workflow.
    pub async fn record(&self, workflow_id: &str, cost: f64) {
        let mut ledger = self.ledger.write().await;
        ledger.roll_day(Utc::now());
        ledger.daily_total += cost;
        *ledger.by_workflow.entry(workflow_id.to_string()).or_default() += cost;
    }

    /// Check both budgets for a workflow, raising `ResourceExhausted` when
    /// either is exceeded and logging a warning past the threshold.
    pub async fn check(&self, workflow_id: &str) -> Result<()> {
        let (daily, workflow) = {
            let mut ledger = self.ledger.write().await;
            ledger.roll_day(Utc::now());
            (
                ledger.daily_total,
                ledger.by_workflow.get(workflow_id).copied().unwrap_or(0.0),
            )
        };

        if let Some(budget) = &self.daily_budget {
            let status = status_for(daily, budget);
            if status.is_exceeded {
                return Err(OrchestratorError::ResourceExhausted(format!(
                    "daily LLM budget exhausted: ${daily:.4} of ${:.4}",
                    budget.limit
                )));
            }
            if status.is_warning {
                warn!(
                    spent = daily,
                    limit = budget.limit,
                    "daily budget warning: {:.1}% used",
                    status.percentage_used * 100.0
                );
            }
        }
        if let Some(budget) = &self.workflow_budget {
            let status = status_for(workflow, budget);
            if status.is_exceeded {
                return Err(OrchestratorError::ResourceExhausted(format!(
                    "workflow '{workflow_id}' LLM budget exhausted: ${workflow:.4} of ${:.4}",
                    budget.limit
                )));
            }
            if status.is_warning {
                warn!(
                    workflow = workflow_id,
                    spent = workflow,
                    limit = budget.limit,
                    "workflow budget warning: {:.1}% used",
                    status.percentage_used * 100.0
                );
            }
        }
        Ok(())
    }

    /// Current status against the daily budget, if one is set.
    pub async fn daily_status(&self) -> Option<BudgetStatus> {
        let budget = self.daily_budget.as_ref()?;
        let mut ledger = self.ledger.write().await;
        ledger.roll_day(Utc::now());
        Some(status_for(ledger.daily_total, budget))
    }

    /// Spend per workflow so far.
    pub async fn spend_by_workflow(&self) -> HashMap<String, f64> {
        self.ledger.read().await.by_workflow.clone()
    }
}

fn status_for(spent: f64, budget: &Budget) -> BudgetStatus {
    let percentage_used = if budget.limit > 0.0 {
        spent / budget.limit
    } else {
        1.0
    };
    BudgetStatus {
        spent,
        limit: budget.limit,
        percentage_used,
        is_warning: percentage_used >= budget.warning_threshold,
        is_exceeded: spent >= budget.limit,
    }
}
