//! Durable job queue / scheduler over the `job_queue` table.
//!
//! Workers claim one job at a time inside a single transaction: the oldest
//! due `queued` row by priority is selected, the per-user running cap is
//! checked, and the claim is committed with a conditional update. SQLite
//! has no `FOR UPDATE SKIP LOCKED`, so the claim is optimistic instead:
//! `UPDATE … WHERE id = ? AND state = 'queued'` — a worker that loses the
//! race sees zero affected rows and simply reports "no work", never
//! blocking on the winner. Any number of workers may run identical loops;
//! correctness relies solely on this transaction, not on coordination.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::OrchestratorConfig;
use crate::db::StoreError;
use crate::routes::Route;

/// Queue states a job moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    WaitingHuman,
    Done,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::WaitingHuman => "waiting_human",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "waiting_human" => Some(JobState::WaitingHuman),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// A schedulable unit of work referencing a run.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: i64,
    pub run_id: String,
    pub user_id: Option<String>,
    pub journey: String,
    pub priority: i64,
    pub state: JobState,
    pub attempts: i64,
    pub scheduled_at: DateTime<Utc>,
    pub payload: FxHashMap<String, Value>,
}

impl Job {
    /// Desired starting route carried in the payload, fail-closed.
    pub fn desired_route(&self) -> Option<Route> {
        self.payload
            .get("route")
            .and_then(Value::as_str)
            .map(Route::parse_or_end)
    }
}

/// Parameters for a job to insert.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub run_id: String,
    pub user_id: Option<String>,
    pub journey: String,
    pub priority: i64,
    pub payload: FxHashMap<String, Value>,
    pub delay: Duration,
}

impl NewJob {
    pub fn new(run_id: impl Into<String>, journey: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: None,
            journey: journey.into(),
            priority: 100,
            payload: FxHashMap::default(),
            delay: Duration::ZERO,
        }
    }

    /// Resume job carrying the desired starting route.
    pub fn resume(run_id: impl Into<String>, route: Route) -> Self {
        let mut job = Self::new(run_id, "resume");
        job.payload
            .insert("route".to_string(), Value::String(route.as_str().into()));
        job
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_payload_entry(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }
}

/// Insert a job row on any executor. Exposed within the crate so the
/// webhook handler can enqueue inside its own idempotency transaction.
pub(crate) async fn insert_job<'e, E>(executor: E, job: &NewJob) -> Result<i64, StoreError>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let scheduled_at =
        Utc::now() + ChronoDuration::milliseconds(job.delay.as_millis().min(i64::MAX as u128) as i64);
    let payload = serde_json::to_string(&job.payload)?;
    let done = sqlx::query(
        r#"
        INSERT INTO job_queue (run_id, user_id, journey, priority, state, attempts, scheduled_at, payload)
        VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6)
        "#,
    )
    .bind(&job.run_id)
    .bind(&job.user_id)
    .bind(&job.journey)
    .bind(job.priority)
    .bind(scheduled_at.to_rfc3339())
    .bind(&payload)
    .execute(executor)
    .await?;
    Ok(done.last_insert_rowid())
}

pub struct JobQueue {
    pool: SqlitePool,
    config: OrchestratorConfig,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: OrchestratorConfig) -> Self {
        Self { pool, config }
    }

    #[instrument(skip(self, job), fields(run_id = %job.run_id, journey = %job.journey), err)]
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        let id = insert_job(&self.pool, &job).await?;
        debug!(job_id = id, "job enqueued");
        Ok(id)
    }

    /// Claim the oldest due queued job, honoring the per-user running cap.
    ///
    /// Returns `None` when the queue is empty, the only candidate's user is
    /// at the cap (the candidate is released, not held), or another worker
    /// won the claim race.
    #[instrument(skip(self), err)]
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query(
            r#"
            SELECT id, run_id, user_id, journey, priority, state, attempts, scheduled_at, payload
            FROM job_queue
            WHERE state = 'queued' AND scheduled_at <= ?1
            ORDER BY priority ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let job = row_to_job(&row)?;

        if let Some(user_id) = &job.user_id {
            let running: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM job_queue WHERE user_id = ?1 AND state = 'running'",
            )
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            if running >= self.config.user_concurrency_cap {
                // Cap met: release the candidate rather than blocking.
                debug!(user_id, running, "user concurrency cap met, releasing candidate");
                return Ok(None);
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'running', claimed_by = ?1, claimed_at = ?2
            WHERE id = ?3 AND state = 'queued'
            "#,
        )
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Another worker claimed it between our read and write.
            return Ok(None);
        }
        tx.commit().await?;

        info!(job_id = job.id, run_id = %job.run_id, worker_id, "job claimed");
        Ok(Some(Job {
            state: JobState::Running,
            ..job
        }))
    }

    /// Reclassify a claimed job from the route its turn ended on:
    /// pause → `waiting_human`, end → `done`, anything else → requeued
    /// immediately so the run keeps progressing in short turns.
    #[instrument(skip(self), err)]
    pub async fn reclassify(&self, job_id: i64, resulting_route: Route) -> Result<JobState, StoreError> {
        let next = if resulting_route.is_pause() {
            JobState::WaitingHuman
        } else if resulting_route.is_end() {
            JobState::Done
        } else {
            JobState::Queued
        };
        sqlx::query(
            r#"
            UPDATE job_queue
            SET state = ?1, scheduled_at = ?2, claimed_by = NULL, claimed_at = NULL
            WHERE id = ?3
            "#,
        )
        .bind(next.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(next)
    }

    /// Requeue after a resume failure with exponential backoff and jitter,
    /// or mark `failed` once attempts are exhausted.
    #[instrument(skip(self), err)]
    pub async fn requeue_after_failure(&self, job: &Job) -> Result<JobState, StoreError> {
        let attempts = job.attempts + 1;
        if attempts >= self.config.max_attempts {
            sqlx::query(
                "UPDATE job_queue SET state = 'failed', attempts = ?1, claimed_by = NULL, claimed_at = NULL WHERE id = ?2",
            )
            .bind(attempts)
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            return Ok(JobState::Failed);
        }

        let delay = self.config.backoff_delay(attempts);
        let jitter_ms = if delay.as_millis() >= 5 {
            rand::rng().random_range(0..=delay.as_millis() as u64 / 5)
        } else {
            0
        };
        let next_at = Utc::now()
            + ChronoDuration::milliseconds(delay.as_millis() as i64 + jitter_ms as i64);
        sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'queued', attempts = ?1, scheduled_at = ?2, claimed_by = NULL, claimed_at = NULL
            WHERE id = ?3
            "#,
        )
        .bind(attempts)
        .bind(next_at.to_rfc3339())
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(JobState::Queued)
    }

    /// Requeue `running` jobs whose claim is older than the configured
    /// lease. Returns the number of jobs reaped. Intended for an operator
    /// cron or a dedicated reaper task, not the worker hot path.
    #[instrument(skip(self), err)]
    pub async fn reap_stale(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - ChronoDuration::milliseconds(self.config.running_lease.as_millis() as i64);
        let done = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'queued', attempts = attempts + 1,
                scheduled_at = ?1, claimed_by = NULL, claimed_at = NULL
            WHERE state = 'running' AND claimed_at IS NOT NULL AND claimed_at <= ?2
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() > 0 {
            info!(reaped = done.rows_affected(), "requeued stale running jobs");
        }
        Ok(done.rows_affected())
    }

    /// Fetch one job by id.
    pub async fn job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, user_id, journey, priority, state, attempts, scheduled_at, payload
            FROM job_queue WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let state_str: String = row.get("state");
    let scheduled_at_str: String = row.get("scheduled_at");
    let payload_str: String = row.get("payload");
    Ok(Job {
        id: row.get("id"),
        run_id: row.get("run_id"),
        user_id: row.get("user_id"),
        journey: row.get("journey"),
        priority: row.get("priority"),
        state: JobState::parse(&state_str)
            .ok_or_else(|| StoreError::Backend(format!("unknown job state: {state_str}")))?,
        attempts: row.get("attempts"),
        scheduled_at: DateTime::parse_from_rfc3339(&scheduled_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        payload: serde_json::from_str(&payload_str)?,
    })
}
