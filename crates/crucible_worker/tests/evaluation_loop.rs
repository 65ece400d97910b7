//! Evaluation-loop behavior: live routing, the per-file error taxonomy,
//! retries, and the shutdown drain.

mod support;

use crucible_db::{JobStatus, RunStatus};
use crucible_registry::Registry;
use support::{Harness, Scripted};

/// An attack arriving while the defense's worker is polling goes straight
/// onto its queue; no new defense-job is created.
#[tokio::test(flavor = "multi_thread")]
async fn attack_routed_to_live_worker() {
    let mut h = Harness::new().await;
    // keep the worker alive long enough for the dispatcher to find it
    h.settings.defense_job.idle_timeout_seconds = Some(2);

    let defense_id = h.seed_ready_defense().await;
    let defense_job = h.queued_defense_job(&defense_id).await;

    let executor = h.executor();
    let worker = {
        let defense_id = defense_id.clone();
        tokio::spawn(async move { executor.run(&defense_job, &defense_id).await })
    };

    h.wait_for_open_worker(&defense_id).await;

    let attack_id = h.seed_submitted_attack(&["f1", "f2"]).await;
    let attack_job = h.queued_attack_job(&attack_id).await;
    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();

    // routed to the live worker, not to a fresh defense-job
    assert_eq!(h.broker.len().await, 0);

    worker.await.unwrap().unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Done);
    assert_eq!(h.db.count_results(&runs[0].id).await.unwrap(), 2);
    assert!(h.registry.open_workers_for(&defense_id).await.unwrap().is_empty());
}

/// Connection-class failures get exactly one retry; a retried success
/// records the prediction.
#[tokio::test]
async fn connection_error_is_retried_once() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_ready_attack(&["f1"]).await;
    let job_id = h.queued_defense_job(&defense_id).await;

    h.gateway.push_outcome(Scripted::ConnectError);
    h.gateway.push_outcome(Scripted::result(0));

    h.executor().run(&job_id, &defense_id).await.unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    let results = h.db.results_for_run(&runs[0].id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].model_output, Some(0));
    assert!(results[0].error.is_none());
    // connect + retry, no third attempt
    assert_eq!(h.gateway.post_count(), 2);
}

/// Two connection errors in a row exhaust the single retry.
#[tokio::test]
async fn second_connection_error_is_recorded() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_ready_attack(&["f1"]).await;
    let job_id = h.queued_defense_job(&defense_id).await;

    h.gateway.push_outcome(Scripted::ConnectError);
    h.gateway.push_outcome(Scripted::ConnectError);

    h.executor().run(&job_id, &defense_id).await.unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    let results = h.db.results_for_run(&runs[0].id).await.unwrap();
    assert_eq!(results[0].model_output, None);
    assert!(results[0].error.as_deref().unwrap().starts_with("connection error: "));
    assert_eq!(h.gateway.post_count(), 2);
}

/// Timeouts are not retried and never fail the job.
#[tokio::test]
async fn timeout_is_recorded_and_loop_continues() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_ready_attack(&["f1", "f2"]).await;
    let job_id = h.queued_defense_job(&defense_id).await;

    // f1 times out, f2 succeeds with the default answer
    h.gateway.push_outcome(Scripted::TimeoutError);

    h.executor().run(&job_id, &defense_id).await.unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Done);
    let results = h.db.results_for_run(&runs[0].id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].model_output, None);
    assert_eq!(results[0].error.as_deref(), Some("http timeout"));
    assert_eq!(results[1].model_output, Some(1));

    assert_eq!(h.db.get_job(&job_id).await.unwrap().unwrap().status, JobStatus::Done);
}

/// The remaining taxonomy rows: HTTP status, malformed body, out-of-range
/// prediction, missing blob.
#[tokio::test]
async fn per_file_error_taxonomy() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_ready_attack(&["f1", "f2", "f3"]).await;
    // a fourth file whose blob was never uploaded
    h.db
        .add_attack_file(&attack_id, "attacks/missing.bin", "f4", "00", false)
        .await
        .unwrap();
    let job_id = h.queued_defense_job(&defense_id).await;

    h.gateway.push_outcome(Scripted::Respond {
        status: 500,
        content_type: Some("text/plain"),
        body: b"internal error".to_vec(),
    });
    h.gateway.push_outcome(Scripted::Respond {
        status: 200,
        content_type: Some("application/json"),
        body: b"not json at all".to_vec(),
    });
    h.gateway.push_outcome(Scripted::Respond {
        status: 200,
        content_type: Some("application/json"),
        body: br#"{"result": 7}"#.to_vec(),
    });

    h.executor().run(&job_id, &defense_id).await.unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    let results = h.db.results_for_run(&runs[0].id).await.unwrap();
    assert_eq!(results.len(), 4);

    let errors: Vec<&str> = results.iter().map(|r| r.error.as_deref().unwrap()).collect();
    assert!(errors[0].starts_with("http 500: internal error"), "got {}", errors[0]);
    assert!(errors[1].starts_with("parse error: "), "got {}", errors[1]);
    assert_eq!(errors[2], "invalid prediction: 7");
    assert!(errors[3].starts_with("blob download failed: "), "got {}", errors[3]);

    assert!(results.iter().all(|r| r.model_output.is_none()));
    // every miss is contained: the run and the job still finish
    assert_eq!(runs[0].status, RunStatus::Done);
    assert_eq!(h.db.get_job(&job_id).await.unwrap().unwrap().status, JobStatus::Done);
}

/// Shutdown: the queue flips to CLOSED, already-queued attacks drain, then
/// the worker exits and unregisters.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_queue_and_drains() {
    let mut h = Harness::new().await;
    // no idle exit: only shutdown can end this loop
    h.settings.defense_job.idle_timeout_seconds = None;

    let defense_id = h.seed_ready_defense().await;
    let a1 = h.seed_ready_attack(&["f1"]).await;
    let a2 = h.seed_ready_attack(&["f2"]).await;
    let defense_job = h.queued_defense_job(&defense_id).await;

    let executor = h.executor();
    let worker = {
        let defense_id = defense_id.clone();
        tokio::spawn(async move { executor.run(&defense_job, &defense_id).await })
    };

    h.wait_for_open_worker(&defense_id).await;
    h.shutdown.cancel();

    worker.await.unwrap().unwrap();

    // both backfilled attacks were evaluated before exit
    for attack_id in [&a1, &a2] {
        let runs = h.db.runs_for_pair(&defense_id, attack_id).await.unwrap();
        assert_eq!(runs.len(), 1, "attack {attack_id} not evaluated");
        assert_eq!(runs[0].status, RunStatus::Done);
    }
    assert!(h.registry.open_workers_for(&defense_id).await.unwrap().is_empty());
}

/// A pair claimed by an attack dispatcher that found no live worker is a
/// hand-off: the defense job it queued adopts the claim during backfill
/// instead of starving until the claim TTL.
#[tokio::test]
async fn backfill_adopts_handed_off_claims() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_ready_attack(&["f1"]).await;

    // the dispatcher claimed the pair, found no open worker, queued this job
    assert!(h.registry.claim_evaluation(&defense_id, &attack_id, "attack-job-99").await.unwrap());

    let job_id = h.queued_defense_job(&defense_id).await;
    h.executor().run(&job_id, &defense_id).await.unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Done);
}

/// A duplicate queue entry for an already-completed pair is dropped instead
/// of producing a second run.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_queue_entry_does_not_rerun_a_completed_pair() {
    let mut h = Harness::new().await;
    h.settings.defense_job.idle_timeout_seconds = Some(2);

    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_ready_attack(&["f1"]).await;

    let defense_job = h.queued_defense_job(&defense_id).await;
    let executor = h.executor();
    let worker = {
        let defense_id = defense_id.clone();
        tokio::spawn(async move { executor.run(&defense_job, &defense_id).await })
    };

    let worker_id = h.wait_for_open_worker(&defense_id).await;
    // a racing push lands the same attack a second time
    h.registry.push_attack(&worker_id, &attack_id).await.unwrap();

    worker.await.unwrap().unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    assert_eq!(runs.len(), 1, "duplicate entry opened a second run");
    assert_eq!(h.db.count_results(&runs[0].id).await.unwrap(), 1);
}

/// A worker whose queue is CLOSED never receives a new attack; the
/// dispatcher falls back to a fresh defense-job instead.
#[tokio::test]
async fn closed_worker_is_never_pushed_to() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;

    h.registry.register("worker_draining", &defense_id, "job_draining").await.unwrap();
    h.registry.close_queue("worker_draining").await.unwrap();

    let attack_id = h.seed_submitted_attack(&["f1"]).await;
    let attack_job = h.queued_attack_job(&attack_id).await;
    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();

    // nothing appended to the closed queue; a defense-job was queued instead
    assert_eq!(h.registry.queue_len("worker_draining").await.unwrap(), 0);
    assert_eq!(h.broker.len().await, 1);
}
