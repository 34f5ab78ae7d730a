//! Worker loop: claim, resume, reclassify, and failure handling.

use runloom::queue::{JobState, NewJob};
use runloom::worker::Worker;
use runloom::Route;

mod common;
use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tick_drives_a_run_to_completion_across_turns() {
    let h = harness().await;
    let state = h
        .orchestrator
        .start_run("essay", goal_task("renewable microgrids"), Some("user-1"))
        .await
        .expect("start");
    let worker = Worker::new(h.orchestrator.clone(), "worker-t");

    // first turn claims the seeded job; keep ticking until the queue drains
    assert!(worker.tick().await.expect("tick"));
    for _ in 0..10 {
        if !worker.tick().await.expect("tick") {
            break;
        }
    }
    assert!(!worker.tick().await.expect("tick"), "queue should be empty");

    let snapshot = h
        .orchestrator
        .snapshot(&state.run_id)
        .await
        .expect("snapshot")
        .expect("known run");
    assert_eq!(snapshot.route, Route::End);

    let job = h
        .orchestrator
        .queue()
        .job(1)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(job.state, JobState::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_checkpoint_requeues_with_backoff_and_audit() {
    let h = harness().await;
    let queue = h.orchestrator.queue();
    let id = queue
        .enqueue(NewJob::resume("ghost-run", Route::Act))
        .await
        .expect("enqueue");

    let worker = Worker::new(h.orchestrator.clone(), "worker-m");
    assert!(worker.tick().await.expect("tick"));

    let job = queue.job(id).await.expect("fetch").expect("exists");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1);

    let events = h
        .orchestrator
        .events_after("ghost-run", 0)
        .await
        .expect("events");
    assert!(
        events
            .iter()
            .any(|e| e.role == "scheduler" && e.content.contains("resume failed"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_worker_processes_jobs_and_shuts_down() {
    let h = harness().await;
    let state = h
        .orchestrator
        .start_run("essay", goal_task("glacier retreat"), None)
        .await
        .expect("start");

    let handle = Worker::new(h.orchestrator.clone(), "worker-s").spawn();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let snapshot = h
            .orchestrator
            .snapshot(&state.run_id)
            .await
            .expect("snapshot")
            .expect("known run");
        if snapshot.route == Route::End {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not finish in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_runs_are_parked_as_waiting_human() {
    let h = harness().await;
    let task = goal_task_with(
        "gated essay",
        &[("target_similarity", serde_json::json!(0.15))],
    );
    let state = h
        .orchestrator
        .start_run("essay", task, None)
        .await
        .expect("start");

    let worker = Worker::new(h.orchestrator.clone(), "worker-p");
    // drain: plan/act/reflect/turnitin ends in a pause
    while worker.tick().await.expect("tick") {}

    let snapshot = h
        .orchestrator
        .snapshot(&state.run_id)
        .await
        .expect("snapshot")
        .expect("known run");
    assert_eq!(snapshot.route, Route::TurnitinPause);

    let job = h
        .orchestrator
        .queue()
        .job(1)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(job.state, JobState::WaitingHuman);
}
