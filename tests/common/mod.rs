#![allow(dead_code)]

use rustc_hash::FxHashMap;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use runloom::api::Orchestrator;
use runloom::config::OrchestratorConfig;
use runloom::providers::{MemorySearchIndex, NullArtifactClient, Snippet, StaticCompletion};

/// A fully wired orchestrator over a throwaway file-backed SQLite database.
///
/// File-backed rather than `:memory:` so every pooled connection (and
/// every concurrent claimer in the scheduler tests) sees the same schema.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(25),
        retry_base: Duration::from_millis(50),
        retry_cap: Duration::from_millis(500),
        provider_attempts: 1,
        ..OrchestratorConfig::default()
    }
}

/// Fixed live-search results so research steps always find sources.
pub fn live_snippets() -> Vec<Snippet> {
    vec![
        Snippet {
            text: "reef systems under thermal stress".into(),
            source: "https://example.org/reefs".into(),
            score: 0.92,
        },
        Snippet {
            text: "ocean acidification field data".into(),
            source: "https://example.org/acidification".into(),
            score: 0.87,
        },
        Snippet {
            text: "carbonate chemistry survey".into(),
            source: "https://example.org/carbonate".into(),
            score: 0.81,
        },
    ]
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: OrchestratorConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("runloom-test.db").display());
    let pool = runloom::db::connect(&url).await.expect("connect test db");
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        config,
        Arc::new(StaticCompletion::single("step complete")),
        Arc::new(MemorySearchIndex::with_live_results(live_snippets())),
        Arc::new(NullArtifactClient),
    ));
    Harness {
        orchestrator,
        pool,
        _dir: dir,
    }
}

pub fn goal_task(goal: &str) -> FxHashMap<String, serde_json::Value> {
    let mut task = FxHashMap::default();
    task.insert("goal".to_string(), serde_json::json!(goal));
    task
}

pub fn goal_task_with(
    goal: &str,
    extra: &[(&str, serde_json::Value)],
) -> FxHashMap<String, serde_json::Value> {
    let mut task = goal_task(goal);
    for (k, v) in extra {
        task.insert((*k).to_string(), v.clone());
    }
    task
}
