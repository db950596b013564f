//! State store invariants: CAS transitions, lease semantics, the reaper,
//! QA attempt monotonicity, audit ordering, and submission idempotence.

mod helpers;

use chrono::Duration as ChronoDuration;
use uuid::Uuid;
use visionflow::db::{self, store::*};
use visionflow::models::audit::{AuditKind, NewAuditEvent};
use visionflow::models::process::CounterDeltas;
use visionflow::models::qa::{FailureCategory, QaTier};
use visionflow::models::task::{AnalysisType, SubmissionState, Task, TaskStatus};

async fn store() -> StateStore {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    StateStore::new(pool)
}

async fn seed_task(store: &StateStore) -> Task {
    let job = helpers::make_job(1, &["colors"]);
    let process = store
        .create_process(&job, serde_json::json!({"set_version": "set-1"}))
        .await
        .unwrap();
    let tasks = store
        .create_tasks(
            process.id,
            &[NewTask {
                media_id: job.media[0].id,
                analysis_id: job.analyses[0].id,
                analysis_type: AnalysisType::Colors,
                optimised_url: job.media[0].optimised_path.clone(),
                greyscale_url: job.media[0].greyscale_path.clone(),
            }],
        )
        .await
        .unwrap();
    tasks.into_iter().next().unwrap()
}

#[tokio::test]
async fn lease_is_won_by_exactly_one_worker() {
    let store = store().await;
    let task = seed_task(&store).await;

    let won = store
        .lease_task(task.id, "worker-0", ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(won.is_some());
    assert_eq!(won.unwrap().status, TaskStatus::Running);

    // Second claimant loses the CAS without side effect.
    let lost = store
        .lease_task(task.id, "worker-1", ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(lost.is_none());
    let current = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(current.worker_id.as_deref(), Some("worker-0"));
}

#[tokio::test]
async fn transition_is_a_noop_when_previous_status_mismatches() {
    let store = store().await;
    let task = seed_task(&store).await;

    let moved = store
        .transition_task(
            task.id,
            TaskStatus::Running,
            TaskStatus::AwaitingQa,
            TaskUpdate::default(),
            None,
        )
        .await
        .unwrap();
    assert!(!moved, "task is pending, not running");
    assert_eq!(
        store.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn expired_lease_is_reclaimed_with_attempt_bump() {
    let store = store().await;
    let task = seed_task(&store).await;

    store
        .lease_task(task.id, "worker-0", ChronoDuration::seconds(-1))
        .await
        .unwrap();
    let reclaimed = store.reclaim_expired(10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 1);
    assert!(task.worker_id.is_none());
    assert!(task.lease_deadline.is_none());

    // Reclaim is audited.
    let events = store.audit_events(task.process_id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == AuditKind::TaskReclaimed));
}

#[tokio::test]
async fn healthy_lease_is_left_alone_by_the_reaper() {
    let store = store().await;
    let task = seed_task(&store).await;
    store
        .lease_task(task.id, "worker-0", ChronoDuration::seconds(300))
        .await
        .unwrap();
    assert!(store.reclaim_expired(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn qa_attempt_indices_are_strictly_monotonic_per_tier() {
    let store = store().await;
    let task = seed_task(&store).await;

    for expected in 1..=3 {
        let attempt = store
            .record_qa_attempt(NewQaAttempt {
                task_id: task.id,
                tier: QaTier::ContentQuality,
                passed: false,
                failure_categories: vec![FailureCategory::MetaDescriptive],
                corrective_prompt: None,
                confidence: 0.0,
                duration_ms: 5,
            })
            .await
            .unwrap();
        assert_eq!(attempt.attempt_index, expected);
    }
    // Another tier starts its own sequence.
    let other = store
        .record_qa_attempt(NewQaAttempt {
            task_id: task.id,
            tier: QaTier::Structural,
            passed: true,
            failure_categories: vec![],
            corrective_prompt: None,
            confidence: 1.0,
            duration_ms: 2,
        })
        .await
        .unwrap();
    assert_eq!(other.attempt_index, 1);

    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.qa_attempts_content, 3);
    assert_eq!(task.qa_attempts_structural, 1);
}

#[tokio::test]
async fn audit_sequence_is_gapless_and_strictly_increasing() {
    let store = store().await;
    let task = seed_task(&store).await;
    for i in 0..5 {
        store
            .emit_audit(NewAuditEvent::new(
                task.process_id,
                AuditKind::TaskTransitioned,
                serde_json::json!({ "i": i }),
            ))
            .await
            .unwrap();
    }
    let events = store.audit_events(task.process_id).await.unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<i64> = (1..=seqs.len() as i64).collect();
    assert_eq!(seqs, expected, "no holes, no duplicates, total order");
}

#[tokio::test]
async fn submission_state_flips_exactly_once() {
    let store = store().await;
    let task = seed_task(&store).await;

    assert!(store
        .try_mark_submission(task.id, SubmissionState::Submitted)
        .await
        .unwrap());
    // The second attempt is a no-op.
    assert!(!store
        .try_mark_submission(task.id, SubmissionState::Submitted)
        .await
        .unwrap());
    assert!(!store
        .try_mark_submission(task.id, SubmissionState::Abandoned)
        .await
        .unwrap());
    assert_eq!(
        store.get_task(task.id).await.unwrap().unwrap().submission_state,
        SubmissionState::Submitted
    );
}

#[tokio::test]
async fn process_counters_accumulate_atomically() {
    let store = store().await;
    let task = seed_task(&store).await;
    store
        .update_process_counters(task.process_id, CounterDeltas::completed())
        .await
        .unwrap();
    let process = store
        .update_process_counters(task.process_id, CounterDeltas::manual_review())
        .await
        .unwrap();
    assert_eq!(process.completed_tasks, 1);
    assert_eq!(process.manual_review_tasks, 1);
    assert_eq!(process.failed_tasks, 0);
    assert_eq!(process.total_tasks, 1);
}

#[tokio::test]
async fn processing_notification_flag_has_one_winner() {
    let store = store().await;
    let task = seed_task(&store).await;
    assert!(store.try_mark_processing_notified(task.process_id).await.unwrap());
    assert!(!store.try_mark_processing_notified(task.process_id).await.unwrap());
}

#[tokio::test]
async fn parked_task_is_claimable_once() {
    let store = store().await;
    let task = seed_task(&store).await;
    store
        .lease_task(task.id, "worker-0", ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(store
        .transition_task(
            task.id,
            TaskStatus::Running,
            TaskStatus::AwaitingQa,
            TaskUpdate::default(),
            None,
        )
        .await
        .unwrap());
    assert!(store
        .park_for_corrective(
            task.id,
            "worker-0",
            QaTier::ContentQuality,
            ChronoDuration::seconds(120),
        )
        .await
        .unwrap());

    let claimed = store
        .claim_for_qa(task.id, "worker-1", ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(claimed.is_some());
    assert_eq!(
        claimed.unwrap().current_tier,
        Some(QaTier::ContentQuality)
    );
    // Already held: a second claim loses.
    assert!(store
        .claim_for_qa(task.id, "worker-2", ChronoDuration::seconds(60))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_task_lookup_is_none() {
    let store = store().await;
    assert!(store.get_task(Uuid::new_v4()).await.unwrap().is_none());
}
