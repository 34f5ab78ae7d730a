//! The engine loop and the uniform step wrapper.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::budget::BudgetGuard;
use crate::checkpoint::CheckpointStore;
use crate::config::OrchestratorConfig;
use crate::episodic::EpisodicLog;
use crate::providers::{Completion, SearchIndex};
use crate::routes::{Route, next_route};
use crate::state::RunState;

use super::{StepContext, StepOutcome, StepRegistry, UsageMeter, fail_closed};

/// Drives a run through its steps until it terminates, pauses for external
/// input, or exhausts this turn's transition allowance.
///
/// The engine holds no execution state across a process boundary: every
/// resumed execution reloads the full [`RunState`] from the checkpoint
/// store, and every step is bracketed by checkpoint writes.
pub struct GraphEngine {
    checkpoints: Arc<dyn CheckpointStore>,
    episodic: Arc<EpisodicLog>,
    registry: StepRegistry,
    completion: Arc<dyn Completion>,
    search: Arc<dyn SearchIndex>,
    config: OrchestratorConfig,
}

impl GraphEngine {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        episodic: Arc<EpisodicLog>,
        registry: StepRegistry,
        completion: Arc<dyn Completion>,
        search: Arc<dyn SearchIndex>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            checkpoints,
            episodic,
            registry,
            completion,
            search,
            config,
        }
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Execute steps from the state's current route until `end`,
    /// `turnitin_pause`, or the per-turn transition allowance runs out
    /// (so a worker requeues instead of holding the job).
    #[instrument(skip(self, state), fields(run_id = %state.run_id))]
    pub async fn run(&self, mut state: RunState) -> RunState {
        let mut transitions = 0;
        while state.route.is_executable() && transitions < self.config.max_steps_per_turn {
            state = self.execute_step(state.route, state).await;
            transitions += 1;
        }
        debug!(route = %state.route, transitions, "turn finished");
        state
    }

    /// The uniform wrapper around one step, in order: budget seeding,
    /// pre-step event, pre-step checkpoint, usage reset, execution, usage
    /// accounting, budget tick (exceed forces `end`), transition
    /// resolution, post-step checkpoint.
    async fn execute_step(&self, route: Route, state: RunState) -> RunState {
        let Some(executor) = self.registry.executor_for(route) else {
            warn!(%route, "no executor registered, failing closed to end");
            return fail_closed(state);
        };

        let guard = BudgetGuard::for_run(&self.config, &state);
        let run_id = state.run_id.clone();
        let role = executor.role();

        self.episodic
            .append(&run_id, Some(route.as_str()), role, format!("entering {route}"))
            .await;
        self.save_best_effort(&state).await;

        let usage = Arc::new(UsageMeter::default());
        let ctx = StepContext {
            completion: self.completion.clone(),
            search: self.search.clone(),
            usage: usage.clone(),
            provider_attempts: self.config.provider_attempts,
        };

        let outcome = executor.run(state, &ctx).await;
        if let StepOutcome::NotImplemented(ref s) = outcome {
            self.episodic
                .append(
                    &run_id,
                    Some(route.as_str()),
                    role,
                    format!("step not implemented, routing to {}", s.route),
                )
                .await;
        }
        let mut state = outcome.into_state();

        let (tokens, usd) = usage.take();
        if let crate::budget::BudgetStatus::Exceeded { reason } =
            guard.tick(&mut state, tokens, usd)
        {
            self.episodic
                .append(&run_id, Some(route.as_str()), "budget", reason)
                .await;
            state.route = Route::End;
        } else if !state.route.is_pause() {
            state.route = next_route(route, state.route);
        }

        self.save_best_effort(&state).await;
        state
    }

    /// Checkpoint writes are best effort: the run continues in memory for
    /// the rest of this turn even if the store is down (it just will not
    /// survive a crash). Reads on resume are the caller's fatal path.
    async fn save_best_effort(&self, state: &RunState) {
        if let Err(e) = self.checkpoints.put(state).await {
            warn!(run_id = %state.run_id, error = %e, "checkpoint write failed, continuing");
        }
    }
}
