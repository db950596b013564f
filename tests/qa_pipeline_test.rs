//! Corrective-loop scenarios: a tier-2 language fix, tier-3 exhaustion
//! into manual review, and tier-1 recovery from malformed output.

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helpers::{drive_process, harness, make_job, FakeRegistry};
use visionflow::models::qa::{FailureCategory, QaTier};
use visionflow::models::task::{SubmissionState, TaskStatus};

/// Route a scripted response by the system-prompt markers the generated
/// profile tree uses.
fn is_analysis(call: &visionflow::services::vision::ModelCall) -> bool {
    call.system.contains("analyst")
}
fn is_content_review(call: &visionflow::services::vision::ModelCall) -> bool {
    call.system.contains("You review")
}
fn is_domain_review(call: &visionflow::services::vision::ModelCall) -> bool {
    call.system.contains("domain expert")
}
fn is_rewrite(call: &visionflow::services::vision::ModelCall) -> bool {
    call.system.contains("You fix")
}

#[tokio::test]
async fn content_quality_failure_recovers_after_one_corrective_cycle() {
    // First analysis output carries meta-descriptive phrasing; the T2
    // corrective agent rewrites it; T2 re-runs and passes; T3 passes.
    let job = make_job(1, &["captions"]);
    let h = harness(FakeRegistry::with_job(job), |call| {
        if is_analysis(call) {
            Ok(r#"{"findings": ["beach"], "summary": "This image shows a beach at dusk."}"#.into())
        } else if is_rewrite(call) {
            Ok(helpers::good_output())
        } else if is_content_review(call) || is_domain_review(call) {
            Ok(helpers::pass_verdict())
        } else {
            panic!("unexpected call: {}", call.system);
        }
    })
    .await;

    let process_id = h.orchestrator.acquire_once().await.unwrap().unwrap();
    let process = drive_process(&h, process_id, 2, Duration::from_secs(20)).await;

    assert_eq!(process.completed_tasks, 1);
    assert_eq!(process.manual_review_tasks, 0);

    let task = &h.store.tasks_for_process(process_id).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.qa_attempts_content, 2, "one failure, one post-corrective pass");
    assert_eq!(task.qa_attempts_structural, 1);
    assert_eq!(task.qa_attempts_domain, 1);

    let attempts = h.store.qa_attempts_for_task(task.id).await.unwrap();
    let content_attempts: Vec<_> = attempts
        .iter()
        .filter(|a| a.tier == QaTier::ContentQuality)
        .collect();
    assert!(!content_attempts[0].passed);
    assert!(content_attempts[0]
        .failure_categories
        .contains(&FailureCategory::MetaDescriptive));
    assert!(content_attempts[1].passed);
    assert!(
        content_attempts[1].corrective_prompt.is_some(),
        "post-corrective attempt records the prompt applied"
    );
}

#[tokio::test]
async fn domain_exhaustion_routes_to_manual_review() {
    // T1 and T2 pass; T3 returns confidence 0.6 three consecutive times.
    let job = make_job(1, &["objects"]);
    let h = harness(FakeRegistry::with_job(job), |call| {
        if is_analysis(call) || is_rewrite(call) {
            Ok(helpers::good_output())
        } else if is_content_review(call) {
            Ok(helpers::pass_verdict())
        } else if is_domain_review(call) {
            Ok(r#"{"pass": true, "confidence": 0.6}"#.into())
        } else {
            panic!("unexpected call: {}", call.system);
        }
    })
    .await;

    let process_id = h.orchestrator.acquire_once().await.unwrap().unwrap();
    let process = drive_process(&h, process_id, 2, Duration::from_secs(20)).await;

    assert_eq!(process.manual_review_tasks, 1);
    assert_eq!(process.completed_tasks, 0);

    let task = &h.store.tasks_for_process(process_id).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::ManualReview);
    assert_eq!(task.qa_attempts_domain, 3);
    assert_eq!(task.submission_state, SubmissionState::Unsubmitted);

    let attempts = h.store.qa_attempts_for_task(task.id).await.unwrap();
    let domain_attempts: Vec<_> = attempts
        .iter()
        .filter(|a| a.tier == QaTier::DomainExpert)
        .collect();
    assert_eq!(domain_attempts.len(), 3);
    for attempt in &domain_attempts {
        assert!(!attempt.passed);
        assert!(attempt
            .failure_categories
            .contains(&FailureCategory::LowConfidence));
        assert!((attempt.confidence - 0.6).abs() < 1e-9);
    }

    // The registry never saw a submission for this task.
    assert!(h.registry.submissions().await.is_empty());
}

#[tokio::test]
async fn malformed_output_recovers_through_structural_corrective() {
    // The first analysis output is not JSON at all; one structural
    // corrective cycle fixes it, and the task proceeds to T2 with no
    // additional T1 attempts.
    let analysis_calls = Arc::new(AtomicUsize::new(0));
    let counter = analysis_calls.clone();
    let job = make_job(1, &["lighting"]);
    let h = harness(FakeRegistry::with_job(job), move |call| {
        if is_analysis(call) {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("Soft golden light everywhere.".into())
        } else if is_rewrite(call) {
            Ok(helpers::good_output())
        } else if is_content_review(call) || is_domain_review(call) {
            Ok(helpers::pass_verdict())
        } else {
            panic!("unexpected call: {}", call.system);
        }
    })
    .await;

    let process_id = h.orchestrator.acquire_once().await.unwrap().unwrap();
    let process = drive_process(&h, process_id, 2, Duration::from_secs(20)).await;
    assert_eq!(process.completed_tasks, 1);

    let task = &h.store.tasks_for_process(process_id).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.qa_attempts_structural, 2);
    assert_eq!(task.qa_attempts_content, 1);
    assert_eq!(task.qa_attempts_domain, 1);
    assert_eq!(
        analysis_calls.load(Ordering::SeqCst),
        1,
        "corrective rewrites, not re-analysis"
    );

    // The parse failure left an audit marker.
    let events = h.store.audit_events(process_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == visionflow::models::audit::AuditKind::OutputParseFailed));
}

#[tokio::test]
async fn empty_prohibited_list_accepts_clean_output() {
    // With no prohibited phrases configured, tier 2 rejects only what the
    // agent or the meta-descriptive scan rejects.
    let job = make_job(1, &["weather"]);
    let h = harness(FakeRegistry::with_job(job), |call| {
        if is_analysis(call) {
            Ok(helpers::good_output())
        } else if is_content_review(call) || is_domain_review(call) {
            Ok(helpers::pass_verdict())
        } else {
            Ok(helpers::good_output())
        }
    })
    .await;

    // Strip the prohibited list from the weather profile and hot-swap.
    let weather = helpers::analysis_yaml(visionflow::models::task::AnalysisType::Weather);
    let stripped = weather
        .replace("prohibited_phrases:\n", "prohibited_phrases: []\n")
        .replace("  - \"this image shows\"\n", "")
        .replace("  - \"as an ai\"\n", "");
    std::fs::write(h.config_dir.path().join("analysis/weather.yaml"), stripped).unwrap();
    let report = h.profiles.reload().await;
    assert!(report.swapped);

    let process_id = h.orchestrator.acquire_once().await.unwrap().unwrap();
    let process = drive_process(&h, process_id, 1, Duration::from_secs(20)).await;
    assert_eq!(process.completed_tasks, 1);
}
