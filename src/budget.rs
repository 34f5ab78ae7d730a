//! Per-run budget enforcement.
//!
//! The guard is the single enforcement point: step executors never
//! self-limit. The engine wrapper calls [`BudgetGuard::tick`] after each
//! step and forces the route to `end` when any ceiling is breached.
//!
//! Elapsed seconds are measured from `RunState.started_at`, which is
//! persisted in the checkpoint, so the time ceiling is a true run-lifetime
//! budget that survives process restarts.

use chrono::Utc;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::state::RunState;

/// Outcome of one budget check.
#[derive(Clone, Debug, PartialEq)]
pub enum BudgetStatus {
    Within,
    Exceeded {
        /// Human-readable description of the offending totals, suitable
        /// for the episodic log.
        reason: String,
    },
}

impl BudgetStatus {
    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        matches!(self, BudgetStatus::Exceeded { .. })
    }
}

/// Token / wall-clock / USD ceilings for one run.
#[derive(Clone, Debug)]
pub struct BudgetGuard {
    max_tokens: u64,
    max_seconds: f64,
    max_usd: Option<f64>,
}

impl BudgetGuard {
    pub fn new(max_tokens: u64, max_seconds: f64, max_usd: Option<f64>) -> Self {
        Self {
            max_tokens,
            max_seconds,
            max_usd,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.budget_tokens,
            config.budget_seconds,
            config.budget_usd,
        )
    }

    /// Ceilings for a specific run: the task spec may override the global
    /// defaults (`budget_tokens`, `budget_seconds`, `budget_usd` keys).
    pub fn for_run(config: &OrchestratorConfig, state: &RunState) -> Self {
        let task = &state.task;
        Self::new(
            task.get("budget_tokens")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(config.budget_tokens),
            task.get("budget_seconds")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(config.budget_seconds),
            task.get("budget_usd")
                .and_then(serde_json::Value::as_f64)
                .or(config.budget_usd),
        )
    }

    /// Add step usage to the run's totals and check every ceiling.
    ///
    /// Totals are clamped non-decreasing: the recorded elapsed seconds
    /// never move backwards even if the clock does.
    pub fn tick(&self, state: &mut RunState, tokens_used: u64, usd_used: f64) -> BudgetStatus {
        state.budget_tokens = state.budget_tokens.saturating_add(tokens_used);
        state.budget_usd += usd_used.max(0.0);

        let elapsed = (Utc::now() - state.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        state.budget_seconds = state.budget_seconds.max(elapsed);

        let mut breaches = Vec::new();
        if state.budget_tokens > self.max_tokens {
            breaches.push(format!(
                "tokens {} > {}",
                state.budget_tokens, self.max_tokens
            ));
        }
        if state.budget_seconds > self.max_seconds {
            breaches.push(format!(
                "seconds {:.1} > {:.1}",
                state.budget_seconds, self.max_seconds
            ));
        }
        if let Some(max_usd) = self.max_usd {
            if state.budget_usd > max_usd {
                breaches.push(format!("usd {:.4} > {:.4}", state.budget_usd, max_usd));
            }
        }

        if breaches.is_empty() {
            BudgetStatus::Within
        } else {
            let reason = format!("budget exceeded: {}", breaches.join(", "));
            warn!(run_id = %state.run_id, %reason, "forcing run to end");
            BudgetStatus::Exceeded { reason }
        }
    }
}
