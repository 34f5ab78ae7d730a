//! # Runloom: Resumable Autonomous Run Orchestration
//!
//! Runloom drives long-running autonomous "runs" (plan, act, reflect,
//! expand, repair) as a checkpointed state machine over SQLite, with a
//! durable job queue for scheduling, hard budget ceilings, an append-only
//! episodic audit log, and an idempotent human-in-the-loop similarity
//! review cycle.
//!
//! ## Core Concepts
//!
//! - **Routes**: The closed set of steps a run moves through; unknown
//!   route strings fail closed to `end`
//! - **RunState**: The full checkpoint payload — task, plan, notes, last
//!   observation, budget totals
//! - **Engine**: Executes steps behind the [`engine::StepExecutor`] trait,
//!   wrapping each one with logging, checkpointing, and budget enforcement
//! - **Queue**: Transactionally claimed jobs with per-user concurrency
//!   caps, backoff retries, and a stale-claim lease
//! - **HITL**: The review handoff pauses a run; the report webhook resumes
//!   it exactly once no matter how often it is delivered
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rustc_hash::FxHashMap;
//! use runloom::api::Orchestrator;
//! use runloom::config::OrchestratorConfig;
//! use runloom::providers::{MemorySearchIndex, NullArtifactClient, StaticCompletion};
//! use runloom::worker::Worker;
//!
//! # async fn demo() -> miette::Result<()> {
//! let pool = runloom::db::connect("sqlite://runloom.db").await?;
//! let orchestrator = Arc::new(Orchestrator::new(
//!     pool,
//!     OrchestratorConfig::from_env(),
//!     Arc::new(StaticCompletion::default()),
//!     Arc::new(MemorySearchIndex::default()),
//!     Arc::new(NullArtifactClient),
//! ));
//!
//! let mut task = FxHashMap::default();
//! task.insert("goal".into(), serde_json::json!("survey recent work on X"));
//! let state = orchestrator.start_run("essay", task, Some("user-1")).await?;
//! println!("started {}", state.run_id);
//!
//! let worker = Worker::new(orchestrator, "worker-1").spawn();
//! # worker.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`routes`] - The closed route set and the transition table
//! - [`state`] - The checkpoint payload and its builder
//! - [`engine`] - The step machine and the standard step executors
//! - [`budget`] - Per-run token / wall-clock / USD ceilings
//! - [`queue`] - The durable job queue and scheduler
//! - [`worker`] - Poll-claim-process worker loops
//! - [`hitl`] - Turnitin handoff and the idempotent report webhook
//! - [`episodic`] - Append-only audit log with a live tail
//! - [`checkpoint`] - Checkpoint store trait plus memory/SQLite impls
//! - [`providers`] - Completion, search, and artifact seams with offline
//!   implementations
//! - [`api`] - The [`api::Orchestrator`] facade the outer application calls
//! - [`config`] - Tunables, overridable via `RUNLOOM_*` env vars
//! - [`db`] - Pool construction and embedded migrations
//! - [`telemetry`] - Tracing bootstrap

pub mod api;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod engine;
pub mod episodic;
pub mod hitl;
pub mod providers;
pub mod queue;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod worker;

pub use api::{Orchestrator, OrchestratorError, WebhookReceipt, WebhookRequest};
pub use routes::Route;
pub use state::{RunSnapshot, RunState};
