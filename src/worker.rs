//! Queue workers.
//!
//! A worker is a poll loop over [`JobQueue::claim`]: claim one job, resume
//! the run from its checkpoint, reclassify the job from the route the turn
//! ended on, sleep when the queue is idle. Workers hold no state of their
//! own, so any number of them can run against the same database.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{Orchestrator, OrchestratorError};
use crate::queue::Job;

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    worker_id: String,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>, worker_id: impl Into<String>) -> Self {
        Self {
            orchestrator,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process at most one job. Returns `true` when a job was
    /// claimed, so callers can poll hot while work is available.
    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn tick(&self) -> Result<bool, OrchestratorError> {
        let Some(job) = self.orchestrator.queue().claim(&self.worker_id).await? else {
            return Ok(false);
        };
        self.process(job).await;
        Ok(true)
    }

    /// Run one claimed job through a turn. Resume failures (including a
    /// missing checkpoint) are recorded and sent back through the queue's
    /// backoff path rather than raised; the claim must always be resolved.
    async fn process(&self, job: Job) {
        let route = job.desired_route();
        debug!(job_id = job.id, run_id = %job.run_id, ?route, "processing job");

        match self.orchestrator.resume_with(&job.run_id, route).await {
            Ok(state) => {
                match self
                    .orchestrator
                    .queue()
                    .reclassify(job.id, state.route)
                    .await
                {
                    Ok(next) => {
                        debug!(job_id = job.id, route = %state.route, next = next.as_str(), "job reclassified")
                    }
                    Err(e) => {
                        // Left `running`; the stale-lease reaper recovers it.
                        error!(job_id = job.id, error = %e, "reclassify failed")
                    }
                }
            }
            Err(e) => {
                warn!(job_id = job.id, run_id = %job.run_id, error = %e, "resume failed, requeueing");
                self.orchestrator
                    .episodic()
                    .append(
                        &job.run_id,
                        None,
                        "scheduler",
                        format!("job {} resume failed: {e}", job.id),
                    )
                    .await;
                if let Err(e) = self.orchestrator.queue().requeue_after_failure(&job).await {
                    error!(job_id = job.id, error = %e, "requeue after failure failed");
                }
            }
        }
    }

    /// Run the poll loop on a fresh task until the returned handle is shut
    /// down. Polls hot while jobs keep arriving, sleeps `poll_interval`
    /// when the queue is idle, and reaps stale claims on each idle pass.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let poll_interval = self.orchestrator.config().poll_interval;
        let handle = tokio::spawn(async move {
            info!(worker_id = %self.worker_id, "worker started");
            loop {
                let worked = match self.tick().await {
                    Ok(worked) => worked,
                    Err(e) => {
                        error!(worker_id = %self.worker_id, error = %e, "claim failed");
                        false
                    }
                };
                if worked {
                    // More work may be due; check for shutdown and go again.
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    continue;
                }
                if let Err(e) = self.orchestrator.queue().reap_stale().await {
                    warn!(worker_id = %self.worker_id, error = %e, "stale reap failed");
                }
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            info!(worker_id = %self.worker_id, "worker stopped");
        });
        WorkerHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle to a spawned worker loop.
pub struct WorkerHandle {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the loop to drain its current job.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}
