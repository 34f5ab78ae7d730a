//! Append-only per-run episodic log.
//!
//! Every engine step, budget breach, scheduling failure, and review cycle
//! transition leaves an event here. The log is an audit/replay source, not
//! a control surface: nothing in the engine reads it back to make
//! decisions. Ordering within one turn follows append order; across turns
//! handled by different workers only the insertion timestamp orders events.
//!
//! Appends are best-effort by design: a run must keep making progress even
//! if the audit trail is briefly unavailable, so [`EpisodicLog::append`]
//! never surfaces storage errors to the caller (it warns and returns).
//! Live consumers can [`EpisodicLog::subscribe`] to a flume tail instead
//! of polling.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{instrument, warn};

use crate::db::StoreError;

/// One audit event: `{run_id, step_id?, role, content, created_at}`.
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodicEvent {
    pub id: i64,
    pub run_id: String,
    pub step_id: Option<String>,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub struct EpisodicLog {
    pool: SqlitePool,
    tail_tx: flume::Sender<EpisodicEvent>,
    tail_rx: flume::Receiver<EpisodicEvent>,
}

impl EpisodicLog {
    /// Capacity of the live-tail buffer; events beyond it are dropped for
    /// slow or absent subscribers (the table remains the durable record).
    const TAIL_CAPACITY: usize = 1024;

    pub fn new(pool: SqlitePool) -> Self {
        let (tail_tx, tail_rx) = flume::bounded(Self::TAIL_CAPACITY);
        Self {
            pool,
            tail_tx,
            tail_rx,
        }
    }

    /// Append an event. Best-effort: failures are logged, never raised.
    #[instrument(skip(self, content))]
    pub async fn append(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        role: &str,
        content: impl Into<String>,
    ) {
        let content = content.into();
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO episodic_logs (run_id, step_id, role, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .bind(role)
        .bind(&content)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(e) => {
                warn!(run_id, role, error = %e, "episodic append failed, continuing");
                return;
            }
        };

        // Tail delivery is fire-and-forget; drop when the buffer is full.
        let _ = self.tail_tx.try_send(EpisodicEvent {
            id,
            run_id: run_id.to_string(),
            step_id: step_id.map(str::to_string),
            role: role.to_string(),
            content,
            created_at,
        });
    }

    /// Events for `run_id` with id greater than `after_id`, oldest first.
    ///
    /// This is the polling read behind the event-stream endpoint; pass the
    /// last seen id to long-poll for new entries.
    #[instrument(skip(self), err)]
    pub async fn events_after(
        &self,
        run_id: &str,
        after_id: i64,
    ) -> Result<Vec<EpisodicEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, step_id, role, content, created_at
            FROM episodic_logs
            WHERE run_id = ?1 AND id > ?2
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let created_at_str: String = row.get("created_at");
                EpisodicEvent {
                    id: row.get("id"),
                    run_id: row.get("run_id"),
                    step_id: row.get("step_id"),
                    role: row.get("role"),
                    content: row.get("content"),
                    created_at: DateTime::parse_from_rfc3339(&created_at_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect())
    }

    /// Live tail of appended events. Any number of subscribers may hold a
    /// receiver; each event is delivered to one of them (flume mpmc).
    pub fn subscribe(&self) -> flume::Receiver<EpisodicEvent> {
        self.tail_rx.clone()
    }
}
