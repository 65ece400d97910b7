//! Attack-job dispatch: validation, routing, duplicate suppression.

mod support;

use crucible_db::{JobStatus, RunStatus, SubmissionStatus};
use crucible_protocol::TaskEnvelope;
use crucible_registry::TaskBroker;
use std::time::Duration;
use support::Harness;

/// Attack after the defense's worker exited: the dispatcher queues a fresh
/// defense-job, which evaluates all three files in creation order.
#[tokio::test]
async fn attack_after_defense_ready_spawns_defense_job() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_submitted_attack(&["f1", "f2", "f3"]).await;
    let attack_job = h.queued_attack_job(&attack_id).await;

    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();

    // attack validated, job done, one defense envelope queued
    let attack = h.db.get_submission(&attack_id).await.unwrap().unwrap();
    assert_eq!(attack.status, SubmissionStatus::Ready);
    assert_eq!(h.db.get_job(&attack_job).await.unwrap().unwrap().status, JobStatus::Done);
    assert_eq!(h.broker.len().await, 1);

    // consume the envelope the way the worker main loop would
    let envelope = h.broker.next(Duration::from_secs(1)).await.unwrap().unwrap();
    let TaskEnvelope::RunDefenseJob { job_id, defense_submission_id, .. } = envelope else {
        panic!("expected a defense envelope");
    };
    assert_eq!(defense_submission_id, defense_id);

    h.executor().run(&job_id, &defense_submission_id).await.unwrap();

    let runs = h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Done);

    // exactly one result per file, in file-creation order
    let files = h.db.attack_files(&attack_id).await.unwrap();
    let results = h.db.results_for_run(&runs[0].id).await.unwrap();
    assert_eq!(results.len(), 3);
    for (file, result) in files.iter().zip(&results) {
        assert_eq!(result.attack_file_id, file.id);
        assert_eq!(result.model_output, Some(1));
    }
}

/// An attack with no files fails validation; the job itself still
/// completes, and nothing is routed anywhere.
#[tokio::test]
async fn empty_attack_fails_validation_but_job_completes() {
    let h = Harness::new().await;
    h.seed_ready_defense().await;
    let attack_id = h.db.create_attack().await.unwrap();
    let attack_job = h.queued_attack_job(&attack_id).await;

    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();

    let attack = h.db.get_submission(&attack_id).await.unwrap().unwrap();
    assert_eq!(attack.status, SubmissionStatus::Failed);
    assert!(attack.functional_error.unwrap().contains("no files"));
    assert_eq!(h.db.get_job(&attack_job).await.unwrap().unwrap().status, JobStatus::Done);
    assert_eq!(h.broker.len().await, 0);
}

/// With no validated defense, a valid attack validates and waits.
#[tokio::test]
async fn attack_with_no_defenses_just_validates() {
    let h = Harness::new().await;
    let attack_id = h.seed_submitted_attack(&["f1"]).await;
    let attack_job = h.queued_attack_job(&attack_id).await;

    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();

    assert_eq!(h.db.get_job(&attack_job).await.unwrap().unwrap().status, JobStatus::Done);
    assert_eq!(h.broker.len().await, 0);
}

/// Two attack-jobs racing the same (defense, attack) pair: the loser's
/// claim fails and only one defense-job is created.
#[tokio::test]
async fn racing_dispatchers_enqueue_the_pair_once() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_submitted_attack(&["f1"]).await;
    let first_job = h.queued_attack_job(&attack_id).await;
    let second_job = h.queued_attack_job(&attack_id).await;

    h.dispatcher().run(&first_job, &attack_id).await.unwrap();
    h.dispatcher().run(&second_job, &attack_id).await.unwrap();

    // the loser observed claim_evaluation == false: the claim still names
    // the winner and no second envelope was queued
    assert_eq!(
        h.registry.claim_holder(&defense_id, &attack_id).await.as_deref(),
        Some(first_job.as_str())
    );
    assert_eq!(h.broker.len().await, 1);
    assert_eq!(h.db.get_job(&first_job).await.unwrap().unwrap().status, JobStatus::Done);
    assert_eq!(h.db.get_job(&second_job).await.unwrap().unwrap().status, JobStatus::Done);

    // running the one defense job yields exactly one run
    let envelope = h.broker.next(Duration::from_secs(1)).await.unwrap().unwrap();
    let TaskEnvelope::RunDefenseJob { job_id, defense_submission_id, .. } = envelope else {
        panic!("expected a defense envelope");
    };
    h.executor().run(&job_id, &defense_submission_id).await.unwrap();
    assert_eq!(h.db.runs_for_pair(&defense_id, &attack_id).await.unwrap().len(), 1);
}

/// Redelivering the same attack envelope after completion changes nothing.
#[tokio::test]
async fn redelivered_attack_envelope_is_a_noop() {
    let h = Harness::new().await;
    h.seed_ready_defense().await;
    let attack_id = h.seed_submitted_attack(&["f1"]).await;
    let attack_job = h.queued_attack_job(&attack_id).await;

    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();
    assert_eq!(h.broker.len().await, 1);

    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();
    assert_eq!(h.broker.len().await, 1, "redelivery queued a duplicate defense job");
    assert_eq!(h.db.get_job(&attack_job).await.unwrap().unwrap().status, JobStatus::Done);
}

/// A pair whose run is already in flight is skipped before the claim is
/// even attempted.
#[tokio::test]
async fn active_run_short_circuits_dispatch() {
    let h = Harness::new().await;
    let defense_id = h.seed_ready_defense().await;
    let attack_id = h.seed_submitted_attack(&["f1"]).await;

    // an executor elsewhere is mid-run for this pair
    h.db.ensure_run(&defense_id, &attack_id).await.unwrap();

    let attack_job = h.queued_attack_job(&attack_id).await;
    h.dispatcher().run(&attack_job, &attack_id).await.unwrap();

    assert_eq!(h.broker.len().await, 0);
    assert!(h.registry.claim_holder(&defense_id, &attack_id).await.is_none());
}
