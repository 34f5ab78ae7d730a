//! The orchestrator facade: the narrow surface the surrounding web
//! application calls (start, snapshot, resume, webhook, event stream).

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::db::StoreError;
use crate::engine::{GraphEngine, StepRegistry};
use crate::episodic::{EpisodicEvent, EpisodicLog};
use crate::hitl::{HitlError, TurnitinCoordinator, WebhookOutcome};
use crate::providers::{ArtifactClient, Completion, SearchIndex};
use crate::queue::{JobQueue, NewJob};
use crate::routes::Route;
use crate::state::{RunSnapshot, RunState};

#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error("run not found: {run_id}")]
    #[diagnostic(
        code(runloom::api::run_not_found),
        help("No checkpoint exists for this run id; there is nothing to resume.")
    )]
    RunNotFound { run_id: String },

    #[error("invalid webhook body: {0}")]
    #[diagnostic(code(runloom::api::invalid_webhook))]
    InvalidWebhook(String),

    #[error(transparent)]
    #[diagnostic(code(runloom::api::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(runloom::api::hitl))]
    Hitl(#[from] HitlError),
}

/// Body of the similarity-report webhook.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookRequest {
    pub cycle_id: i64,
    pub report_url: String,
    pub observed_similarity: f64,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Response to a webhook delivery.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct WebhookReceipt {
    /// `enqueued` on first delivery, `ok` on an idempotent replay.
    pub status: &'static str,
    pub job_id: i64,
}

/// Everything a worker or API layer needs, wired once at startup.
pub struct Orchestrator {
    engine: GraphEngine,
    checkpoints: Arc<dyn CheckpointStore>,
    episodic: Arc<EpisodicLog>,
    queue: Arc<JobQueue>,
    coordinator: Arc<TurnitinCoordinator>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire the full core onto one SQLite pool and the three collaborator
    /// seams.
    pub fn new(
        pool: SqlitePool,
        config: OrchestratorConfig,
        completion: Arc<dyn Completion>,
        search: Arc<dyn SearchIndex>,
        artifacts: Arc<dyn ArtifactClient>,
    ) -> Self {
        let episodic = Arc::new(EpisodicLog::new(pool.clone()));
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(SqliteCheckpointStore::new(pool.clone()));
        let coordinator = Arc::new(TurnitinCoordinator::new(
            pool.clone(),
            episodic.clone(),
            artifacts,
            config.default_target_similarity,
        ));
        let registry = StepRegistry::standard(coordinator.clone());
        let engine = GraphEngine::new(
            checkpoints.clone(),
            episodic.clone(),
            registry,
            completion,
            search,
            config.clone(),
        );
        let queue = Arc::new(JobQueue::new(pool, config.clone()));
        Self {
            engine,
            checkpoints,
            episodic,
            queue,
            coordinator,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<TurnitinCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Seed a fresh run: checkpoint at `plan` with zeroed budgets, a
    /// `run_created` audit event, and a queued job whose payload carries
    /// the desired starting route.
    #[instrument(skip(self, task), err)]
    pub async fn start_run(
        &self,
        journey: &str,
        task: FxHashMap<String, Value>,
        user_id: Option<&str>,
    ) -> Result<RunState, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let state = RunState::new(run_id.clone(), task);

        // Seeding must fail loudly; without the first checkpoint there is
        // no run to schedule.
        self.checkpoints.put(&state).await?;
        self.episodic
            .append(&run_id, None, "system", format!("run_created ({journey})"))
            .await;

        let mut job = NewJob::new(run_id.clone(), journey)
            .with_payload_entry("route", Value::String(Route::Act.as_str().into()));
        if let Some(user_id) = user_id {
            job = job.with_user(user_id);
        }
        let job_id = self.queue.enqueue(job).await?;
        info!(%run_id, job_id, journey, "run started");
        Ok(state)
    }

    /// Reduced view of the current checkpoint, or `None` if the run is
    /// unknown.
    #[instrument(skip(self), err)]
    pub async fn snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>, OrchestratorError> {
        Ok(self
            .checkpoints
            .get(run_id)
            .await?
            .map(|state| RunSnapshot::from(&state)))
    }

    /// Load the checkpoint, overwrite the route, and run the engine
    /// synchronously. Fails loudly when no checkpoint exists.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, run_id: &str, route: Route) -> Result<RunState, OrchestratorError> {
        self.resume_with(run_id, Some(route)).await
    }

    /// Resume used by workers: `route` comes from the job payload when
    /// present, otherwise the checkpointed route stands.
    pub(crate) async fn resume_with(
        &self,
        run_id: &str,
        route: Option<Route>,
    ) -> Result<RunState, OrchestratorError> {
        let mut state = self
            .checkpoints
            .get(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if let Some(route) = route {
            state.route = route;
        }
        Ok(self.engine.run(state).await)
    }

    /// Validate and consume a similarity-report webhook. Idempotent: a
    /// duplicate delivery returns the original job id with status `ok`.
    #[instrument(skip(self, request), fields(cycle_id = request.cycle_id), err)]
    pub async fn webhook(
        &self,
        request: WebhookRequest,
    ) -> Result<WebhookReceipt, OrchestratorError> {
        if request.report_url.trim().is_empty() {
            return Err(OrchestratorError::InvalidWebhook(
                "report_url must be non-empty".into(),
            ));
        }
        if !request.observed_similarity.is_finite()
            || !(0.0..=1.0).contains(&request.observed_similarity)
        {
            return Err(OrchestratorError::InvalidWebhook(format!(
                "observed_similarity {} outside [0, 1]",
                request.observed_similarity
            )));
        }

        let outcome = self
            .coordinator
            .webhook(
                request.cycle_id,
                &request.report_url,
                request.observed_similarity,
            )
            .await?;
        Ok(match outcome {
            WebhookOutcome::Enqueued { job_id } => WebhookReceipt {
                status: "enqueued",
                job_id,
            },
            WebhookOutcome::AlreadyProcessed { job_id } => WebhookReceipt {
                status: "ok",
                job_id,
            },
        })
    }

    /// Episodic events beyond `after_id`, for long-poll bridging.
    pub async fn events_after(
        &self,
        run_id: &str,
        after_id: i64,
    ) -> Result<Vec<EpisodicEvent>, OrchestratorError> {
        Ok(self.episodic.events_after(run_id, after_id).await?)
    }

    /// Live tail of episodic events.
    pub fn subscribe_events(&self) -> flume::Receiver<EpisodicEvent> {
        self.episodic.subscribe()
    }

    pub(crate) fn episodic(&self) -> &Arc<EpisodicLog> {
        &self.episodic
    }
}
