//! Durable run-state snapshots.
//!
//! The checkpoint is the sole resumption point for a run: `put` writes a
//! full snapshot (never a diff), `get` reads the latest. For a single
//! `run_id` last-writer-wins is acceptable because the job queue's claim
//! lock guarantees at most one worker executes a run at a time; writes for
//! different runs are independent.
//!
//! Failure contract: callers treat a failed `put` as best effort (warn and
//! continue in memory), while a failed `get` on resume is fatal — there is
//! nothing to resume from. [`GraphEngine`](crate::engine::GraphEngine)
//! honors this split; the store itself reports every error.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::instrument;

use crate::db::StoreError;
use crate::state::RunState;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest snapshot for `run_id`, or `None` if the run was never seeded.
    async fn get(&self, run_id: &str) -> Result<Option<RunState>, StoreError>;

    /// Overwrite the snapshot for `state.run_id`.
    async fn put(&self, state: &RunState) -> Result<(), StoreError>;

    /// All known run ids, most recently updated first.
    async fn list_runs(&self) -> Result<Vec<String>, StoreError>;
}

/// Volatile store for tests and single-process development.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    snapshots: Mutex<HashMap<String, RunState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Backend("checkpoint map poisoned".into()))?
            .get(run_id)
            .cloned())
    }

    async fn put(&self, state: &RunState) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .map_err(|_| StoreError::Backend("checkpoint map poisoned".into()))?
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Backend("checkpoint map poisoned".into()))?
            .keys()
            .cloned()
            .collect())
    }
}

/// SQLite-backed store over the `checkpoints` table.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self), err)]
    async fn get(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        let row = sqlx::query("SELECT payload FROM checkpoints WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, state), fields(run_id = %state.run_id), err)]
    async fn put(&self, state: &RunState) -> Result<(), StoreError> {
        let payload = serde_json::to_string(state)?;

        // Delete-then-insert inside one transaction rather than relying on
        // the engine's upsert dialect; keeps the write portable to stores
        // without atomic upsert.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoints WHERE run_id = ?1")
            .bind(&state.run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (run_id, payload, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(&state.run_id)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT run_id FROM checkpoints ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("run_id"))
            .collect())
    }
}
