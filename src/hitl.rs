//! Human-in-the-loop (Turnitin) coordination.
//!
//! The handoff path is deliberately fail-safe in the conservative
//! direction: every external call is wrapped so a vendor outage still
//! pauses the run — waiting indefinitely beats failing open past a
//! compliance gate. The webhook path is idempotent: `resume_job_id` on the
//! cycle row is set at most once, inside the same transaction that flips
//! the cycle to `report_ready`, so duplicate deliveries observe the stored
//! job id and enqueue nothing.

use miette::Diagnostic;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::db::StoreError;
use crate::episodic::EpisodicLog;
use crate::providers::ArtifactClient;
use crate::queue::{NewJob, insert_job};
use crate::routes::Route;
use crate::state::RunState;

#[derive(Debug, Error, Diagnostic)]
pub enum HitlError {
    #[error("unknown review cycle: {cycle_id}")]
    #[diagnostic(
        code(runloom::hitl::unknown_cycle),
        help("The webhook referenced a cycle this store never created.")
    )]
    UnknownCycle { cycle_id: i64 },

    #[error(transparent)]
    #[diagnostic(code(runloom::hitl::store))]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for HitlError {
    fn from(e: sqlx::Error) -> Self {
        HitlError::Store(StoreError::Sqlx(e))
    }
}

/// Review cycle lifecycle: `awaiting_report` → `report_ready`, exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStatus {
    AwaitingReport,
    ReportReady,
}

impl CycleStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::AwaitingReport => "awaiting_report",
            CycleStatus::ReportReady => "report_ready",
        }
    }
}

/// One HITL round for a run.
#[derive(Clone, Debug)]
pub struct TurnitinCycle {
    pub id: i64,
    pub run_id: String,
    pub artifact_id: String,
    pub status: CycleStatus,
    pub target_similarity: f64,
    pub observed_similarity: Option<f64>,
    pub report_path: Option<String>,
    pub resume_job_id: Option<i64>,
}

/// Result of a webhook delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// First delivery: a resume job was enqueued.
    Enqueued { job_id: i64 },
    /// Duplicate delivery: the previously enqueued job id is returned.
    AlreadyProcessed { job_id: i64 },
}

impl WebhookOutcome {
    #[must_use]
    pub fn job_id(&self) -> i64 {
        match self {
            WebhookOutcome::Enqueued { job_id } | WebhookOutcome::AlreadyProcessed { job_id } => {
                *job_id
            }
        }
    }
}

pub struct TurnitinCoordinator {
    pool: SqlitePool,
    episodic: Arc<EpisodicLog>,
    artifacts: Arc<dyn ArtifactClient>,
    default_target_similarity: Option<f64>,
}

impl TurnitinCoordinator {
    pub fn new(
        pool: SqlitePool,
        episodic: Arc<EpisodicLog>,
        artifacts: Arc<dyn ArtifactClient>,
        default_target_similarity: Option<f64>,
    ) -> Self {
        Self {
            pool,
            episodic,
            artifacts,
            default_target_similarity,
        }
    }

    /// Effective similarity target for a run: task spec first, then the
    /// global default. `None` means no review policy is configured.
    pub fn target_for(&self, state: &RunState) -> Option<f64> {
        state
            .task_target_similarity()
            .or(self.default_target_similarity)
    }

    /// Create the external review artifact and the pending cycle row, then
    /// pause the run. Never raises: a failed vendor call still pauses.
    #[instrument(skip(self, state), fields(run_id = %state.run_id))]
    pub async fn handoff(&self, mut state: RunState) -> RunState {
        let target = self.target_for(&state).unwrap_or(0.2);
        let title = state.goal().unwrap_or("untitled run").to_string();

        let artifact_id = match self.artifacts.create_artifact(&state.run_id, &title).await {
            Ok(artifact) => artifact.artifact_id,
            Err(e) => {
                warn!(error = %e, "artifact creation failed, pausing anyway");
                format!("pending-{}", uuid::Uuid::new_v4())
            }
        };

        match self.insert_cycle(&state.run_id, &artifact_id, target).await {
            Ok(cycle_id) => {
                self.episodic
                    .append(
                        &state.run_id,
                        Some("turnitin"),
                        "turnitin",
                        format!("cycle {cycle_id} awaiting report (artifact {artifact_id}, target {target})"),
                    )
                    .await;
                state.note(format!("awaiting similarity report, cycle {cycle_id}"));
            }
            Err(e) => {
                // Conservative: the run still pauses so a human can step in.
                warn!(error = %e, "cycle insert failed, pausing anyway");
            }
        }

        state.route = Route::TurnitinPause;
        state
    }

    async fn insert_cycle(
        &self,
        run_id: &str,
        artifact_id: &str,
        target: f64,
    ) -> Result<i64, StoreError> {
        let done = sqlx::query(
            r#"
            INSERT INTO turnitin_cycles (run_id, artifact_id, status, target_similarity)
            VALUES (?1, ?2, 'awaiting_report', ?3)
            "#,
        )
        .bind(run_id)
        .bind(artifact_id)
        .bind(target)
        .execute(&self.pool)
        .await?;
        Ok(done.last_insert_rowid())
    }

    /// Consume a report webhook. Idempotent per cycle: the first delivery
    /// flips the cycle to `report_ready` and enqueues exactly one resume
    /// job; replays return the stored job id without enqueuing.
    #[instrument(skip(self), err)]
    pub async fn webhook(
        &self,
        cycle_id: i64,
        report_url: &str,
        observed_similarity: f64,
    ) -> Result<WebhookOutcome, HitlError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, run_id, artifact_id, status, target_similarity,
                   observed_similarity, report_path, resume_job_id
            FROM turnitin_cycles WHERE id = ?1
            "#,
        )
        .bind(cycle_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(HitlError::UnknownCycle { cycle_id })?;
        let cycle = row_to_cycle(&row);

        if cycle.status == CycleStatus::ReportReady {
            if let Some(job_id) = cycle.resume_job_id {
                if cycle.report_path.as_deref() == Some(report_url)
                    && cycle.observed_similarity == Some(observed_similarity)
                {
                    // Duplicate delivery of the same report: no-op.
                    return Ok(WebhookOutcome::AlreadyProcessed { job_id });
                }
                // Different payload for an already-consumed cycle; keep the
                // original resume rather than double-driving the run.
                warn!(
                    cycle_id,
                    "webhook replay with different payload, keeping original resume job"
                );
                return Ok(WebhookOutcome::AlreadyProcessed { job_id });
            }
        }

        let resume = NewJob::resume(cycle.run_id.clone(), Route::Act);
        let job_id = insert_job(&mut *tx, &resume).await?;

        sqlx::query(
            r#"
            UPDATE turnitin_cycles
            SET status = 'report_ready', observed_similarity = ?1,
                report_path = ?2, resume_job_id = ?3
            WHERE id = ?4
            "#,
        )
        .bind(observed_similarity)
        .bind(report_url)
        .bind(job_id)
        .bind(cycle_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.episodic
            .append(
                &cycle.run_id,
                Some("turnitin"),
                "turnitin",
                format!(
                    "cycle {cycle_id} report ready (similarity {observed_similarity}), resume job {job_id}"
                ),
            )
            .await;
        Ok(WebhookOutcome::Enqueued { job_id })
    }

    /// Most recent `report_ready` cycle for a run, if any. Consulted by
    /// the Reflect step to decide whether review already passed.
    #[instrument(skip(self), err)]
    pub async fn latest_ready_cycle(
        &self,
        run_id: &str,
    ) -> Result<Option<TurnitinCycle>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, artifact_id, status, target_similarity,
                   observed_similarity, report_path, resume_job_id
            FROM turnitin_cycles
            WHERE run_id = ?1 AND status = 'report_ready'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_cycle(&r)))
    }
}

fn row_to_cycle(row: &SqliteRow) -> TurnitinCycle {
    let status: String = row.get("status");
    TurnitinCycle {
        id: row.get("id"),
        run_id: row.get("run_id"),
        artifact_id: row.get("artifact_id"),
        status: if status == "report_ready" {
            CycleStatus::ReportReady
        } else {
            CycleStatus::AwaitingReport
        },
        target_similarity: row.get("target_similarity"),
        observed_similarity: row.get("observed_similarity"),
        report_path: row.get("report_path"),
        resume_job_id: row.get("resume_job_id"),
    }
}
