//! Job orchestrator: the long-running driver that owns the process
//! lifecycle. Acquires jobs from the registry, fans them out into
//! media×analysis tasks, tracks completion through the batch-completion
//! queue, submits results and the final quality report, and trips the
//! per-process circuit breaker when failures pile up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{ManagementQueue, Priority, QueueBroker, QueueKey};
use crate::db::store::{NewTask, StateStore, StoreError, TaskUpdate};
use crate::models::audit::{AuditKind, AuditSeverity, NewAuditEvent};
use crate::models::job::{AnalysisSubmission, ProjectStatus, RegistryJob};
use crate::models::process::{CounterDeltas, Process, ProcessStatus};
use crate::models::report::QualityReport;
use crate::models::task::{SubmissionState, Task, TaskStatus};
use crate::profiles::ProfileRegistry;
use crate::qa::structural::extract_json;
use crate::services::notify::{NotificationSink, NotifyChannel};
use crate::services::registry::{JobRegistry, RegistryError};
use crate::services::retry::{with_backoff, BackoffPolicy, RetryClass};

const REAPER_INTERVAL: Duration = Duration::from_secs(15);
const COMPLETION_WAIT: Duration = Duration::from_secs(1);
const RECLAIM_BATCH: i64 = 100;

/// Sliding-window failure-rate breaker. Trips once the failure share of
/// the most recent outcomes crosses the threshold; a tripped breaker
/// stays tripped until operator action (the process is left `processing`).
#[derive(Debug)]
pub struct CircuitBreaker {
    window: VecDeque<bool>,
    window_size: usize,
    min_observations: usize,
    threshold: f64,
    tripped: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(50, 10, 0.3)
    }
}

impl CircuitBreaker {
    pub fn new(window_size: usize, min_observations: usize, threshold: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            min_observations,
            threshold,
            tripped: false,
        }
    }

    /// Record one terminal outcome. Returns true exactly once, at the
    /// moment the breaker trips.
    pub fn record(&mut self, failed: bool) -> bool {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
        if self.tripped || self.window.len() < self.min_observations {
            return false;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        if failures as f64 / self.window.len() as f64 > self.threshold {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct Orchestrator {
    store: StateStore,
    broker: Arc<dyn QueueBroker>,
    registry: Arc<dyn JobRegistry>,
    profiles: Arc<ProfileRegistry>,
    notifier: Arc<dyn NotificationSink>,
    poll_interval: Duration,
    breakers: Mutex<HashMap<Uuid, CircuitBreaker>>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        broker: Arc<dyn QueueBroker>,
        registry: Arc<dyn JobRegistry>,
        profiles: Arc<ProfileRegistry>,
        notifier: Arc<dyn NotificationSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            profiles,
            notifier,
            poll_interval,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the acquisition, completion, status, and reaper loops and run
    /// them until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let acquisition = {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = this.acquire_once().await {
                        error!(error = %e, "job acquisition failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(this.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            })
        };
        let completion = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = this.drain_completions_once(COMPLETION_WAIT).await {
                        error!(error = %e, "completion handling failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            })
        };
        let housekeeping = {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = this.notify_processing_once().await {
                        warn!(error = %e, "processing-status notification failed");
                    }
                    if let Err(e) = this.reap_once().await {
                        warn!(error = %e, "lease reaper failed");
                    }
                    if let Err(e) = this.drain_priority_once().await {
                        warn!(error = %e, "priority requeue failed");
                    }
                    if let Err(e) = this.drain_manual_review_once().await {
                        warn!(error = %e, "manual-review notification failed");
                    }
                    if let Err(e) = this.apply_cancellations_once().await {
                        warn!(error = %e, "cancellation sweep failed");
                    }
                    this.sample_queue_depths().await;
                    tokio::select! {
                        _ = tokio::time::sleep(REAPER_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            })
        };
        let _ = tokio::join!(acquisition, completion, housekeeping);
        info!("orchestrator stopped");
    }

    /// One acquisition poll: fetch, validate, create the process with a
    /// frozen profile snapshot, and fan out tasks. 404 means idle.
    pub async fn acquire_once(&self) -> Result<Option<Uuid>, OrchestratorError> {
        let Some(job) = self.registry.next_job().await? else {
            debug!("no job available");
            return Ok(None);
        };
        if let Err(e) = job.validate() {
            warn!(project = %job.project.id, error = %e, "rejecting invalid job");
            return Ok(None);
        }

        let profiles = self.profiles.snapshot().await;
        let process = self
            .store
            .create_process(&job, profiles.snapshot_json())
            .await?;
        info!(
            process_id = %process.id,
            project = %job.project.slug,
            media = job.media.len(),
            analyses = job.analyses.len(),
            "job acquired"
        );
        metrics::counter!("visionflow_jobs_acquired").increment(1);

        self.expand_and_enqueue(&process, &job).await?;
        Ok(Some(process.id))
    }

    /// Create one task per (media, analysis) pair and feed the analysis
    /// queues. Enqueueing blocks on full queues and stops early if the
    /// breaker trips mid-expansion.
    pub async fn expand_and_enqueue(
        &self,
        process: &Process,
        job: &RegistryJob,
    ) -> Result<(), OrchestratorError> {
        let mut new_tasks = Vec::with_capacity(job.media.len() * job.analyses.len());
        for media in &job.media {
            for analysis in &job.analyses {
                let analysis_type = analysis
                    .slug
                    .parse()
                    .expect("job validation guarantees known analysis slugs");
                new_tasks.push(NewTask {
                    media_id: media.id,
                    analysis_id: analysis.id,
                    analysis_type,
                    optimised_url: media.optimised_path.clone(),
                    greyscale_url: media.greyscale_path.clone(),
                });
            }
        }
        let tasks = self.store.create_tasks(process.id, &new_tasks).await?;

        self.notifier
            .notify(
                NotifyChannel::BatchManifest,
                serde_json::json!({
                    "process_id": process.id,
                    "project": process.project_slug,
                    "tasks": tasks.len(),
                }),
            )
            .await;

        for task in &tasks {
            if self.breaker_tripped(process.id).await {
                warn!(process_id = %process.id, "breaker tripped during expansion; halting enqueues");
                break;
            }
            self.broker
                .enqueue(
                    QueueKey::Analysis(task.analysis_type),
                    task.id,
                    Priority::Normal,
                )
                .await?;
        }
        Ok(())
    }

    /// Drain one batch-completion entry: update counters, feed the
    /// breaker, submit completed results, and close the process when every
    /// task is terminal.
    pub async fn drain_completions_once(&self, wait: Duration) -> Result<bool, OrchestratorError> {
        let queue = QueueKey::Management(ManagementQueue::BatchCompletion);
        let Some(delivery) = self.broker.dequeue(queue, wait).await? else {
            return Ok(false);
        };
        let Some(task) = self.store.get_task(delivery.task_id).await? else {
            self.broker.ack(&delivery).await?;
            return Ok(true);
        };
        if !task.status.is_terminal() {
            self.broker.ack(&delivery).await?;
            return Ok(true);
        }

        let deltas = match task.status {
            TaskStatus::Completed => CounterDeltas::completed(),
            TaskStatus::Failed => CounterDeltas::failed(),
            TaskStatus::ManualReview => CounterDeltas::manual_review(),
            _ => unreachable!("terminal check above"),
        };
        let process = self.store.update_process_counters(task.process_id, deltas).await?;

        let failed = task.status != TaskStatus::Completed;
        if self.record_outcome(process.id, failed).await {
            self.store
                .emit_audit(
                    NewAuditEvent::new(
                        process.id,
                        AuditKind::CircuitBreakerTripped,
                        serde_json::json!({
                            "completed": process.completed_tasks,
                            "failed": process.failed_tasks,
                            "manual_review": process.manual_review_tasks,
                        }),
                    )
                    .with_severity(AuditSeverity::High),
                )
                .await?;
            warn!(process_id = %process.id, "circuit breaker tripped; halting further enqueues");
        }

        if task.status == TaskStatus::Completed {
            self.submit_result(&task).await?;
        }

        self.broker.ack(&delivery).await?;

        if task.status == TaskStatus::ManualReview {
            self.broker
                .enqueue(
                    QueueKey::Management(ManagementQueue::ManualReview),
                    task.id,
                    Priority::Normal,
                )
                .await?;
        }

        let mut process = self
            .store
            .get_process(task.process_id)
            .await?
            .ok_or(StoreError::ProcessNotFound(task.process_id))?;
        if process.status == ProcessStatus::Initializing {
            // A small job can finish before the status sweep ever sees it;
            // promote here so the `processing` update still precedes
            // `completed`.
            self.ensure_processing(&process).await?;
            process = self
                .store
                .get_process(task.process_id)
                .await?
                .ok_or(StoreError::ProcessNotFound(task.process_id))?;
        }
        if process.all_tasks_terminal() && process.status == ProcessStatus::Processing {
            self.finalize_process(&process).await?;
        }
        Ok(true)
    }

    /// Promote a process to `processing` and deliver the status update,
    /// exactly once across every caller.
    async fn ensure_processing(&self, process: &Process) -> Result<(), OrchestratorError> {
        let _ = self
            .store
            .transition_process(
                process.id,
                ProcessStatus::Initializing,
                ProcessStatus::Processing,
            )
            .await?;
        if self.store.try_mark_processing_notified(process.id).await? {
            self.store
                .emit_audit(NewAuditEvent::new(
                    process.id,
                    AuditKind::ProcessStatusChanged,
                    serde_json::json!({ "status": "processing" }),
                ))
                .await?;
            let result = with_backoff(
                BackoffPolicy::default(),
                |e: &RegistryError| {
                    if e.is_retryable() {
                        RetryClass::Transient
                    } else {
                        RetryClass::Permanent
                    }
                },
                |attempt, e| {
                    warn!(process_id = %process.id, attempt, error = %e, "status update retry")
                },
                || {
                    self.registry
                        .update_project_status(process.project_id, ProjectStatus::Processing)
                },
            )
            .await;
            if let Err(e) = result {
                warn!(process_id = %process.id, error = %e, "processing status update failed");
            }
        }
        Ok(())
    }

    /// Submit one completed task's result to the registry, exactly once.
    pub async fn submit_result(&self, task: &Task) -> Result<(), OrchestratorError> {
        if task.submission_state != SubmissionState::Unsubmitted {
            self.store
                .emit_audit(
                    NewAuditEvent::new(
                        task.process_id,
                        AuditKind::SubmissionDuplicate,
                        serde_json::json!({ "state": task.submission_state.to_string() }),
                    )
                    .for_task(task.id),
                )
                .await?;
            return Ok(());
        }
        let Some(output) = &task.output else {
            warn!(task_id = %task.id, "completed task has no output; abandoning submission");
            self.abandon_submission(task, "missing output artifact").await?;
            return Ok(());
        };
        let process = self
            .store
            .get_process(task.process_id)
            .await?
            .ok_or(StoreError::ProcessNotFound(task.process_id))?;

        let submission = AnalysisSubmission {
            model_used: output.model_used.clone(),
            user_prompt_used: output.user_prompt.clone(),
            system_prompt_used: output.system_prompt.clone(),
            status: "completed".to_string(),
            analysis_result: extract_json(&output.content)
                .unwrap_or(serde_json::Value::String(output.content.clone())),
        };

        let result = with_backoff(
            BackoffPolicy::default(),
            |e: &RegistryError| {
                if e.is_retryable() {
                    RetryClass::Transient
                } else {
                    RetryClass::Permanent
                }
            },
            |attempt, e| {
                warn!(task_id = %task.id, attempt, error = %e, "result submission retry");
            },
            || {
                self.registry.submit_analysis_result(
                    process.project_id,
                    task.media_id,
                    task.analysis_id,
                    &submission,
                )
            },
        )
        .await;

        match result {
            Ok(()) => {
                if self
                    .store
                    .try_mark_submission(task.id, SubmissionState::Submitted)
                    .await?
                {
                    self.store
                        .emit_audit(
                            NewAuditEvent::new(
                                task.process_id,
                                AuditKind::ResultSubmitted,
                                serde_json::json!({ "analysis": task.analysis_type.to_string() }),
                            )
                            .for_task(task.id),
                        )
                        .await?;
                    metrics::counter!("visionflow_results_submitted").increment(1);
                }
                Ok(())
            }
            Err(e) => {
                // 4xx (duplicate/invalid) and exhausted retries both end
                // here: the submission is abandoned with an audit trail,
                // never retried behind the registry's back.
                self.abandon_submission(task, &e.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn abandon_submission(&self, task: &Task, reason: &str) -> Result<(), StoreError> {
        if self
            .store
            .try_mark_submission(task.id, SubmissionState::Abandoned)
            .await?
        {
            self.store
                .emit_audit(
                    NewAuditEvent::new(
                        task.process_id,
                        AuditKind::SubmissionAbandoned,
                        serde_json::json!({ "reason": reason }),
                    )
                    .for_task(task.id)
                    .with_severity(AuditSeverity::Warning),
                )
                .await?;
        }
        Ok(())
    }

    /// Close a fully terminal process: one `completed` status update, then
    /// the final quality report.
    pub async fn finalize_process(&self, process: &Process) -> Result<(), OrchestratorError> {
        if !self
            .store
            .transition_process(process.id, ProcessStatus::Processing, ProcessStatus::Completed)
            .await?
        {
            return Ok(());
        }
        self.store
            .emit_audit(NewAuditEvent::new(
                process.id,
                AuditKind::ProcessCompleted,
                serde_json::json!({
                    "completed": process.completed_tasks,
                    "failed": process.failed_tasks,
                    "manual_review": process.manual_review_tasks,
                }),
            ))
            .await?;

        if self.store.try_mark_completed_notified(process.id).await? {
            let status_result = with_backoff(
                BackoffPolicy::default(),
                |e: &RegistryError| {
                    if e.is_retryable() {
                        RetryClass::Transient
                    } else {
                        RetryClass::Permanent
                    }
                },
                |attempt, e| warn!(process_id = %process.id, attempt, error = %e, "status update retry"),
                || {
                    self.registry
                        .update_project_status(process.project_id, ProjectStatus::Completed)
                },
            )
            .await;
            if let Err(e) = status_result {
                warn!(process_id = %process.id, error = %e, "completed status update failed");
            }
        }

        let process = self
            .store
            .get_process(process.id)
            .await?
            .ok_or(StoreError::ProcessNotFound(process.id))?;
        let media_count = self.store.completed_media_count(process.id).await?;
        let analysis_types = self.store.completed_analysis_types(process.id).await?;
        let key_findings = vec![
            format!("{} analyses completed", process.completed_tasks),
            format!("{} tasks failed", process.failed_tasks),
            format!("{} tasks require manual review", process.manual_review_tasks),
        ];
        let report =
            QualityReport::from_process(&process, media_count, analysis_types, key_findings);

        let report_result = with_backoff(
            BackoffPolicy::default(),
            |e: &RegistryError| {
                if e.is_retryable() {
                    RetryClass::Transient
                } else {
                    RetryClass::Permanent
                }
            },
            |attempt, e| warn!(process_id = %process.id, attempt, error = %e, "report submission retry"),
            || self.registry.submit_report(process.project_id, &report),
        )
        .await;
        match report_result {
            Ok(()) => {
                self.store
                    .emit_audit(NewAuditEvent::new(
                        process.id,
                        AuditKind::ReportSubmitted,
                        serde_json::json!({ "success_rate": report.report.details.success_rate }),
                    ))
                    .await?;
                self.notifier
                    .notify(
                        NotifyChannel::BatchReport,
                        serde_json::to_value(&report).unwrap_or_default(),
                    )
                    .await;
            }
            Err(e) => {
                warn!(process_id = %process.id, error = %e, "final report submission failed");
            }
        }
        info!(process_id = %process.id, "process completed");
        metrics::counter!("visionflow_processes_completed").increment(1);
        Ok(())
    }

    /// Deliver the exactly-once `processing` status for processes whose
    /// first task has started.
    pub async fn notify_processing_once(&self) -> Result<(), OrchestratorError> {
        for process in self.store.unnotified_started_processes().await? {
            self.ensure_processing(&process).await?;
        }
        Ok(())
    }

    /// Reclaim expired leases and hand the tasks to the priority queue for
    /// re-dispatch; also requeue broker deliveries that were never acked.
    pub async fn reap_once(&self) -> Result<usize, OrchestratorError> {
        let requeued = self.broker.requeue_expired().await?;
        if requeued > 0 {
            debug!(requeued, "requeued unacked broker deliveries");
        }
        let reclaimed = self.store.reclaim_expired(RECLAIM_BATCH).await?;
        let count = reclaimed.len();
        for task in reclaimed {
            self.broker
                .enqueue(
                    QueueKey::Management(ManagementQueue::Priority),
                    task.id,
                    Priority::High,
                )
                .await?;
        }
        if count > 0 {
            metrics::counter!("visionflow_tasks_reclaimed").increment(count as u64);
        }
        Ok(count)
    }

    /// Re-dispatch reclaimed tasks at high priority, unless the process
    /// breaker has halted enqueues.
    pub async fn drain_priority_once(&self) -> Result<(), OrchestratorError> {
        let queue = QueueKey::Management(ManagementQueue::Priority);
        while let Some(delivery) = self.broker.dequeue(queue, Duration::ZERO).await? {
            let Some(task) = self.store.get_task(delivery.task_id).await? else {
                self.broker.ack(&delivery).await?;
                continue;
            };
            if task.status == TaskStatus::Pending && !self.breaker_tripped(task.process_id).await {
                self.broker
                    .enqueue(
                        QueueKey::Analysis(task.analysis_type),
                        task.id,
                        Priority::High,
                    )
                    .await?;
            }
            self.broker.ack(&delivery).await?;
        }
        Ok(())
    }

    /// Fan manual-review tasks out to the webhook channel of the tier
    /// that gave up on them.
    pub async fn drain_manual_review_once(&self) -> Result<(), OrchestratorError> {
        let queue = QueueKey::Management(ManagementQueue::ManualReview);
        while let Some(delivery) = self.broker.dequeue(queue, Duration::ZERO).await? {
            if let Some(task) = self.store.get_task(delivery.task_id).await? {
                let attempts = self.store.qa_attempts_for_task(task.id).await?;
                let channel = attempts
                    .iter()
                    .rev()
                    .find(|a| !a.passed)
                    .map(|a| match a.tier {
                        crate::models::qa::QaTier::Structural => NotifyChannel::QaStructural,
                        crate::models::qa::QaTier::ContentQuality => NotifyChannel::QaContent,
                        crate::models::qa::QaTier::DomainExpert => NotifyChannel::QaDomain,
                    })
                    .unwrap_or(NotifyChannel::QaStructural);
                self.notifier
                    .notify(
                        channel,
                        serde_json::json!({
                            "task_id": task.id,
                            "process_id": task.process_id,
                            "analysis": task.analysis_type.to_string(),
                            "last_error": task.last_error,
                        }),
                    )
                    .await;
            }
            self.broker.ack(&delivery).await?;
        }
        Ok(())
    }

    /// Cooperative cancel: drop still-pending tasks from their queues and
    /// fail them; leased tasks notice the flag at their next step.
    pub async fn apply_cancellations_once(&self) -> Result<(), OrchestratorError> {
        for process in self.store.cancel_requested_processes().await? {
            for task in self.store.pending_tasks(process.id).await? {
                self.broker
                    .remove(QueueKey::Analysis(task.analysis_type), task.id)
                    .await?;
                let moved = self
                    .store
                    .transition_task(
                        task.id,
                        TaskStatus::Pending,
                        TaskStatus::Failed,
                        TaskUpdate {
                            last_error: Some("process cancelled".to_string()),
                            ..TaskUpdate::default()
                        },
                        Some(
                            NewAuditEvent::new(
                                process.id,
                                AuditKind::TaskTransitioned,
                                serde_json::json!({
                                    "from": "pending",
                                    "to": "failed",
                                    "reason": "cancelled",
                                }),
                            )
                            .for_task(task.id),
                        ),
                    )
                    .await?;
                if moved {
                    self.broker
                        .enqueue(
                            QueueKey::Management(ManagementQueue::BatchCompletion),
                            task.id,
                            Priority::Normal,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn sample_queue_depths(&self) {
        for queue in QueueKey::all() {
            if let Ok(depth) = self.broker.depth(queue).await {
                metrics::gauge!("visionflow_queue_depth", "queue" => queue.name())
                    .set(depth as f64);
            }
        }
    }

    async fn record_outcome(&self, process_id: Uuid, failed: bool) -> bool {
        let mut breakers = self.breakers.lock().await;
        breakers.entry(process_id).or_default().record(failed)
    }

    pub async fn breaker_tripped(&self, process_id: Uuid) -> bool {
        let breakers = self.breakers.lock().await;
        breakers.get(&process_id).is_some_and(CircuitBreaker::is_tripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_waits_for_minimum_observations() {
        let mut breaker = CircuitBreaker::new(50, 10, 0.3);
        for _ in 0..9 {
            assert!(!breaker.record(true));
        }
        assert!(!breaker.is_tripped());
        assert!(breaker.record(true));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn breaker_ignores_failure_rates_under_threshold() {
        let mut breaker = CircuitBreaker::new(50, 10, 0.3);
        for i in 0..50 {
            // 20% failures: never trips.
            assert!(!breaker.record(i % 5 == 0));
        }
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn breaker_trips_once_over_a_sliding_window() {
        let mut breaker = CircuitBreaker::new(10, 10, 0.3);
        for _ in 0..10 {
            breaker.record(false);
        }
        // Window slides: four recent failures out of ten crosses 30%.
        breaker.record(true);
        breaker.record(true);
        breaker.record(true);
        let tripped_now = breaker.record(true);
        assert!(tripped_now);
        // Subsequent records never re-report the trip.
        assert!(!breaker.record(true));
        assert!(breaker.is_tripped());
    }
}
