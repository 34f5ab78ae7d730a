//! Claim semantics, per-user caps, retries, and the stale-claim reaper.

use chrono::{Duration as ChronoDuration, Utc};
use runloom::config::OrchestratorConfig;
use runloom::queue::{JobState, NewJob};
use runloom::Route;
use sqlx::Row;

mod common;
use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_job_is_claimed_by_exactly_one_worker() {
    let h = harness().await;
    let queue = h.orchestrator.queue().clone();
    queue
        .enqueue(NewJob::new("run-claim", "essay"))
        .await
        .expect("enqueue");

    let mut handles = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            // a losing transaction may surface a busy/conflict error under
            // contention; that still counts as "did not claim"
            matches!(queue.claim(&format!("worker-{i}")).await, Ok(Some(_)))
        }));
    }
    let mut claimed = 0;
    for handle in handles {
        if handle.await.expect("join") {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);

    let job = queue.job(1).await.expect("fetch").expect("exists");
    assert_eq!(job.state, JobState::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn claim_prefers_priority_then_age() {
    let h = harness().await;
    let queue = h.orchestrator.queue();
    let low = queue
        .enqueue(NewJob::new("run-low", "essay").with_priority(200))
        .await
        .expect("enqueue low");
    let high = queue
        .enqueue(NewJob::new("run-high", "essay").with_priority(10))
        .await
        .expect("enqueue high");

    let first = queue.claim("w").await.expect("claim").expect("job");
    assert_eq!(first.id, high);
    let second = queue.claim("w").await.expect("claim").expect("job");
    assert_eq!(second.id, low);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_concurrency_cap_releases_the_candidate() {
    let config = OrchestratorConfig {
        user_concurrency_cap: 1,
        ..test_config()
    };
    let h = harness_with(config).await;
    let queue = h.orchestrator.queue();
    let first = queue
        .enqueue(NewJob::new("run-1", "essay").with_user("alice"))
        .await
        .expect("enqueue 1");
    queue
        .enqueue(NewJob::new("run-2", "essay").with_user("alice"))
        .await
        .expect("enqueue 2");

    let claimed = queue.claim("w1").await.expect("claim").expect("job");
    assert_eq!(claimed.id, first);

    // alice is at her cap; the second job is released, not held
    assert!(queue.claim("w2").await.expect("claim").is_none());

    // finishing the first job frees the slot
    queue
        .reclassify(first, Route::End)
        .await
        .expect("reclassify");
    assert!(queue.claim("w2").await.expect("claim").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reclassify_maps_routes_to_job_states() {
    let h = harness().await;
    let queue = h.orchestrator.queue();

    for (route, expected) in [
        (Route::End, JobState::Done),
        (Route::TurnitinPause, JobState::WaitingHuman),
        (Route::Act, JobState::Queued),
    ] {
        let id = queue
            .enqueue(NewJob::new("run-rc", "essay"))
            .await
            .expect("enqueue");
        queue.claim("w").await.expect("claim").expect("job");
        let next = queue.reclassify(id, route).await.expect("reclassify");
        assert_eq!(next, expected);
        let job = queue.job(id).await.expect("fetch").expect("exists");
        assert_eq!(job.state, expected);
        if expected == JobState::Queued {
            // leave no live candidate behind for the next iteration
            queue.claim("w").await.expect("claim").expect("requeued job");
            queue.reclassify(id, Route::End).await.expect("finish");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_resume_backs_off_then_fails_permanently() {
    let config = OrchestratorConfig {
        max_attempts: 2,
        ..test_config()
    };
    let h = harness_with(config).await;
    let queue = h.orchestrator.queue();
    queue
        .enqueue(NewJob::new("run-fail", "essay"))
        .await
        .expect("enqueue");

    let job = queue.claim("w").await.expect("claim").expect("job");
    let state = queue.requeue_after_failure(&job).await.expect("requeue");
    assert_eq!(state, JobState::Queued);
    let retried = queue.job(job.id).await.expect("fetch").expect("exists");
    assert_eq!(retried.attempts, 1);
    assert!(retried.scheduled_at > Utc::now());

    // second failure hits max_attempts
    let state = queue
        .requeue_after_failure(&retried)
        .await
        .expect("requeue");
    assert_eq!(state, JobState::Failed);
    let dead = queue.job(job.id).await.expect("fetch").expect("exists");
    assert_eq!(dead.state, JobState::Failed);
    assert!(queue.claim("w").await.expect("claim").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backed_off_jobs_are_not_claimable_early() {
    let h = harness().await;
    let queue = h.orchestrator.queue();
    queue
        .enqueue(NewJob::new("run-later", "essay"))
        .await
        .expect("enqueue");
    let job = queue.claim("w").await.expect("claim").expect("job");
    queue.requeue_after_failure(&job).await.expect("requeue");

    assert!(queue.claim("w").await.expect("claim").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_claims_are_reaped_fresh_ones_kept() {
    let h = harness().await;
    let queue = h.orchestrator.queue();
    let stale = queue
        .enqueue(NewJob::new("run-stale", "essay"))
        .await
        .expect("enqueue stale");
    let fresh = queue
        .enqueue(NewJob::new("run-fresh", "essay"))
        .await
        .expect("enqueue fresh");
    queue.claim("w1").await.expect("claim").expect("stale job");
    queue.claim("w2").await.expect("claim").expect("fresh job");

    // age the first claim beyond the lease
    let old = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
    sqlx::query("UPDATE job_queue SET claimed_at = ?1 WHERE id = ?2")
        .bind(&old)
        .bind(stale)
        .execute(&h.pool)
        .await
        .expect("backdate");

    let reaped = queue.reap_stale().await.expect("reap");
    assert_eq!(reaped, 1);

    let stale_job = queue.job(stale).await.expect("fetch").expect("exists");
    assert_eq!(stale_job.state, JobState::Queued);
    assert_eq!(stale_job.attempts, 1);
    let fresh_job = queue.job(fresh).await.expect("fetch").expect("exists");
    assert_eq!(fresh_job.state, JobState::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn payload_route_parses_fail_closed() {
    let h = harness().await;
    let queue = h.orchestrator.queue();
    let id = queue
        .enqueue(NewJob::new("run-bogus", "essay").with_payload_entry(
            "route",
            serde_json::json!("definitely_not_a_route"),
        ))
        .await
        .expect("enqueue");
    let job = queue.job(id).await.expect("fetch").expect("exists");
    assert_eq!(job.desired_route(), Some(Route::End));

    let bare = queue
        .enqueue(NewJob::new("run-bare", "essay"))
        .await
        .expect("enqueue");
    let job = queue.job(bare).await.expect("fetch").expect("exists");
    assert_eq!(job.desired_route(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn claim_marks_worker_and_timestamps() {
    let h = harness().await;
    let queue = h.orchestrator.queue();
    let id = queue
        .enqueue(NewJob::new("run-meta", "essay"))
        .await
        .expect("enqueue");
    queue.claim("worker-42").await.expect("claim").expect("job");

    let row = sqlx::query("SELECT state, claimed_by, claimed_at FROM job_queue WHERE id = ?1")
        .bind(id)
        .fetch_one(&h.pool)
        .await
        .expect("row");
    assert_eq!(row.get::<String, _>("state"), "running");
    assert_eq!(row.get::<String, _>("claimed_by"), "worker-42");
    assert!(row.get::<Option<String>, _>("claimed_at").is_some());
}
