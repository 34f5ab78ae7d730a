//! The state machine core.
//!
//! [`GraphEngine`] drives a run through its step executors, wrapping every
//! step with episodic logging, checkpointing, and budget enforcement. Step
//! executors are pure `RunState → RunState` functions behind the
//! [`StepExecutor`] trait, registered in an explicit [`StepRegistry`] that
//! is constructed once at startup and injected — there is no process-wide
//! mutable registry.

mod graph;
mod steps;

pub use graph::GraphEngine;
pub use steps::StepRegistry;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::warn;

use crate::providers::{
    ChatMessage, Completion, CompletionOutput, SearchIndex, retry_complete, token_floor,
};
use crate::routes::Route;
use crate::state::RunState;

/// What a step executor produced.
///
/// `NotImplemented` is a first-class outcome so callers cannot mistake a
/// stub for a step that ran and did something useful; the engine logs it
/// distinctly and still honors the returned route.
#[derive(Debug)]
pub enum StepOutcome {
    Ran(RunState),
    NotImplemented(RunState),
}

impl StepOutcome {
    pub fn into_state(self) -> RunState {
        match self {
            StepOutcome::Ran(state) | StepOutcome::NotImplemented(state) => state,
        }
    }
}

/// One step of the run state machine.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Role tag recorded on episodic events for this step.
    fn role(&self) -> &'static str;

    async fn run(&self, state: RunState, ctx: &StepContext) -> StepOutcome;
}

/// Tokens and cost consumed during one step invocation.
#[derive(Default)]
pub struct UsageMeter {
    inner: Mutex<(u64, f64)>,
}

impl UsageMeter {
    pub fn record(&self, tokens: u64, usd: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.0 = inner.0.saturating_add(tokens);
            inner.1 += usd.max(0.0);
        }
    }

    /// Current totals, resetting the meter for the next step.
    pub fn take(&self) -> (u64, f64) {
        match self.inner.lock() {
            Ok(mut inner) => std::mem::take(&mut *inner),
            Err(_) => (0, 0.0),
        }
    }
}

/// Execution context handed to step executors: the collaborator seams plus
/// the per-step usage meter the budget guard reads.
#[derive(Clone)]
pub struct StepContext {
    pub completion: Arc<dyn Completion>,
    pub search: Arc<dyn SearchIndex>,
    pub usage: Arc<UsageMeter>,
    pub provider_attempts: u32,
}

impl StepContext {
    /// Run a completion call with bounded retries and the deterministic
    /// fallback, recording usage (word-count floor when the provider
    /// reports none).
    pub async fn complete(&self, messages: &[ChatMessage]) -> String {
        let out = retry_complete(&*self.completion, messages, self.provider_attempts, || {
            CompletionOutput {
                text: "provider unavailable; deterministic fallback response".into(),
                tokens: None,
                cost_usd: None,
            }
        })
        .await;
        let tokens = out.tokens.unwrap_or_else(|| token_floor(&out.text));
        self.usage.record(tokens, out.cost_usd.unwrap_or(0.0));
        out.text
    }

    /// Query the search index, absorbing transient errors into an empty
    /// result so the state machine keeps moving.
    pub async fn search_query(&self, text: &str, limit: usize) -> Vec<crate::providers::Snippet> {
        match self.search.query(text, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "search query failed, treating as empty");
                Vec::new()
            }
        }
    }

    /// Live-search escape hatch with the same absorb-errors contract.
    pub async fn search_live(&self, text: &str, limit: usize) -> Vec<crate::providers::Snippet> {
        match self.search.live_search(text, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "live search failed, treating as empty");
                Vec::new()
            }
        }
    }
}

/// Sentinel used when a route has no registered executor; the engine
/// fail-closes the run to `end` rather than raising.
pub(crate) fn fail_closed(mut state: RunState) -> RunState {
    state.route = Route::End;
    state
}
