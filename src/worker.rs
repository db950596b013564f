//! Analysis worker: leases a task from an analysis queue, runs the vision
//! model, and drives the result through the QA pipeline, updating state
//! after every observable step. The same workers drain the corrective
//! queues, where a rewrite re-enters the tier that rejected the output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Delivery, ManagementQueue, Priority, QueueBroker, QueueKey};
use crate::db::store::{StateStore, StoreError, TaskUpdate};
use crate::models::audit::{AuditKind, NewAuditEvent};
use crate::models::qa::QaTier;
use crate::models::task::{RawOutput, Task, TaskStatus};
use crate::profiles::ProfileRegistry;
use crate::qa::{structural, QaError, QaOutcome, QaPipeline};
use crate::services::images::ImageProvider;
use crate::services::retry::{with_backoff, BackoffPolicy, RetryClass};
use crate::services::vision::{ModelCall, ModelError, VisionModel};

/// Lease TTL = profile deadline × this factor, so a crashed worker's
/// tasks become reclaimable well after any legitimate call would finish.
const LEASE_TTL_FACTOR: u64 = 5;
const IDLE_BACKOFF: Duration = Duration::from_millis(250);
/// Lease horizon for a task parked on a corrective queue with no holder.
const PARKED_LEASE_SECS: u64 = 30 * LEASE_TTL_FACTOR;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),

    #[error("profile missing for {0}")]
    ProfileMissing(String),

    #[error("task {0} has no output to correct")]
    NoOutput(Uuid),
}

/// Per-media async mutexes: analyses of one image run one model call at a
/// time; distinct images proceed in parallel.
#[derive(Clone, Default)]
pub struct MediaLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl MediaLocks {
    pub async fn acquire(&self, media_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(media_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub store: StateStore,
    pub broker: Arc<dyn QueueBroker>,
    pub profiles: Arc<ProfileRegistry>,
    pub model: Arc<dyn VisionModel>,
    pub images: Arc<dyn ImageProvider>,
    pub qa: QaPipeline,
    /// Caps concurrent vision-model calls process-wide; corrective and QA
    /// agent calls compete with primary analysis calls here.
    pub semaphore: Arc<Semaphore>,
    pub media_locks: MediaLocks,
}

pub struct AnalysisWorker {
    id: String,
    ctx: Arc<WorkerContext>,
    shutdown: watch::Receiver<bool>,
}

impl AnalysisWorker {
    pub fn new(index: usize, ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id: format!("worker-{index}"),
            ctx,
            shutdown,
        }
    }

    /// Main loop: round-robin over the corrective and analysis queues,
    /// idling briefly when every queue is empty.
    pub async fn run(self) {
        info!(worker_id = %self.id, "worker started");
        let scan = QueueKey::worker_scan();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let mut processed_any = false;
            for queue in &scan {
                if *self.shutdown.borrow() {
                    break;
                }
                let delivery = match self.ctx.broker.dequeue(*queue, Duration::ZERO).await {
                    Ok(Some(d)) => d,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(worker_id = %self.id, error = %e, "dequeue failed");
                        tokio::time::sleep(IDLE_BACKOFF).await;
                        continue;
                    }
                };
                processed_any = true;
                let result = match delivery.queue {
                    QueueKey::Analysis(_) => self.process_analysis(&delivery).await,
                    QueueKey::Corrective(tier) => self.process_corrective(tier, &delivery).await,
                    QueueKey::Management(_) => Ok(()),
                };
                if let Err(e) = result {
                    error!(
                        worker_id = %self.id,
                        task_id = %delivery.task_id,
                        error = %e,
                        "task processing error"
                    );
                }
            }
            if !processed_any {
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// One analysis task end-to-end: lease, materialize, model call,
    /// artifact persist, QA.
    async fn process_analysis(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let Some(task) = self.ctx.store.get_task(delivery.task_id).await? else {
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        };
        if task.status != TaskStatus::Pending {
            // Stale delivery: the task moved on (reclaim, cancel, or a
            // competing worker). Settle it and move along.
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        }

        let profiles = self.ctx.profiles.snapshot().await;
        let profile = profiles
            .analysis_profile(task.analysis_type)
            .ok_or_else(|| WorkerError::ProfileMissing(task.analysis_type.to_string()))?;
        let lease_ttl = chrono::Duration::seconds((profile.deadline_seconds * LEASE_TTL_FACTOR) as i64);

        let Some(task) = self
            .ctx
            .store
            .lease_task(task.id, &self.id, lease_ttl)
            .await?
        else {
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        };
        self.ctx
            .store
            .emit_audit(
                NewAuditEvent::new(
                    task.process_id,
                    AuditKind::TaskLeased,
                    serde_json::json!({ "worker": self.id, "queue": delivery.queue.name() }),
                )
                .for_task(task.id),
            )
            .await?;

        if self.ctx.store.is_cancel_requested(task.process_id).await? {
            return self
                .fail_task(delivery, &task, TaskStatus::Running, "process cancelled")
                .await;
        }

        debug!(worker_id = %self.id, task_id = %task.id, analysis = %task.analysis_type, "task leased");

        // One model call at a time per image; distinct images in parallel.
        let _media_guard = self.ctx.media_locks.acquire(task.media_id).await;

        let image = match self
            .ctx
            .images
            .fetch(
                task.media_id,
                &task.optimised_url,
                task.greyscale_url.as_deref(),
            )
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .fail_task(delivery, &task, TaskStatus::Running, &e.to_string())
                    .await;
            }
        };
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&image);

        let mut values = std::collections::BTreeMap::new();
        values.insert(
            crate::profiles::template::PLACEHOLDER_IMAGE,
            image_b64.clone(),
        );
        let rendered = match profile.prompt.render(&values) {
            Ok(r) => r,
            Err(e) => {
                return self
                    .fail_task(delivery, &task, TaskStatus::Running, &e.to_string())
                    .await;
            }
        };

        let mut call = ModelCall::from_params(&profile.model, profile.deadline_seconds);
        call.system = rendered.system.clone();
        call.user = rendered.user.clone();
        call.image_b64 = Some(image_b64.clone());

        let started = std::time::Instant::now();
        let content = match self.generate_with_retries(&task, &call).await {
            Ok(content) => content,
            Err(e) => {
                self.ctx
                    .store
                    .emit_audit(
                        NewAuditEvent::new(
                            task.process_id,
                            AuditKind::ModelCallFailed,
                            serde_json::json!({ "error": e.to_string() }),
                        )
                        .for_task(task.id)
                        .with_severity(crate::models::audit::AuditSeverity::Warning),
                    )
                    .await?;
                return self
                    .fail_task(delivery, &task, TaskStatus::Running, &e.to_string())
                    .await;
            }
        };
        metrics::histogram!("visionflow_model_call_seconds")
            .record(started.elapsed().as_secs_f64());

        // Persist the raw artifact before QA sees it; parse failures are
        // QA's to judge, but they leave an audit marker here.
        let output = RawOutput {
            content: content.clone(),
            model_used: profile.model.name.clone(),
            system_prompt: rendered.system,
            user_prompt: rendered.user,
            produced_at: Utc::now(),
        };
        self.ctx.store.set_output(task.id, &output).await?;
        if structural::extract_json(&content).is_none() {
            self.ctx
                .store
                .emit_audit(
                    NewAuditEvent::new(
                        task.process_id,
                        AuditKind::OutputParseFailed,
                        serde_json::json!({ "bytes": content.len() }),
                    )
                    .for_task(task.id),
                )
                .await?;
        }

        let moved = self
            .ctx
            .store
            .transition_task(
                task.id,
                TaskStatus::Running,
                TaskStatus::AwaitingQa,
                TaskUpdate {
                    current_tier: Some(Some(QaTier::Structural)),
                    profile_version: Some(profiles.version.clone()),
                    ..TaskUpdate::default()
                },
                Some(
                    NewAuditEvent::new(
                        task.process_id,
                        AuditKind::TaskTransitioned,
                        serde_json::json!({ "from": "running", "to": "awaiting_qa" }),
                    )
                    .for_task(task.id),
                ),
            )
            .await?;
        if !moved {
            // Lost the lease mid-flight (reaper); drop the delivery.
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        }
        self.ctx
            .store
            .renew_lease(task.id, &self.id, lease_ttl)
            .await?;

        let task = self
            .ctx
            .store
            .get_task(task.id)
            .await?
            .ok_or(StoreError::TaskNotFound(task.id))?;
        let outcome = self
            .ctx
            .qa
            .run(&task, &profiles, &content, &image_b64, None)
            .await;
        self.settle_qa(delivery, &task, outcome).await
    }

    /// Resume a task parked on a corrective queue: rewrite the failing
    /// output with the tier's corrective agent, then re-enter the tier.
    async fn process_corrective(
        &self,
        tier: QaTier,
        delivery: &Delivery,
    ) -> Result<(), WorkerError> {
        let Some(task) = self.ctx.store.get_task(delivery.task_id).await? else {
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        };
        if task.status != TaskStatus::AwaitingQa {
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        }

        // Tasks pinned at QA entry finish under the profile set they
        // started with, even across a hot reload.
        let profiles = match &task.profile_version {
            Some(version) => match self.ctx.profiles.pinned(version).await {
                Some(set) => set,
                None => {
                    warn!(task_id = %task.id, %version, "pinned profile set aged out; using active");
                    self.ctx.profiles.snapshot().await
                }
            },
            None => self.ctx.profiles.snapshot().await,
        };
        let stage = profiles
            .corrective_stage(task.analysis_type, tier)
            .ok_or_else(|| WorkerError::ProfileMissing(format!("{}:{tier}", task.analysis_type)))?;
        let lease_ttl = chrono::Duration::seconds((stage.deadline_seconds * LEASE_TTL_FACTOR) as i64);

        let Some(task) = self
            .ctx
            .store
            .claim_for_qa(task.id, &self.id, lease_ttl)
            .await?
        else {
            self.ctx.broker.ack(delivery).await?;
            return Ok(());
        };

        if self.ctx.store.is_cancel_requested(task.process_id).await? {
            return self
                .fail_task(delivery, &task, TaskStatus::AwaitingQa, "process cancelled")
                .await;
        }

        let prior = task
            .output
            .as_ref()
            .ok_or(WorkerError::NoOutput(task.id))?
            .content
            .clone();

        let _media_guard = self.ctx.media_locks.acquire(task.media_id).await;
        let image = match self
            .ctx
            .images
            .fetch(
                task.media_id,
                &task.optimised_url,
                task.greyscale_url.as_deref(),
            )
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .fail_task(delivery, &task, TaskStatus::AwaitingQa, &e.to_string())
                    .await;
            }
        };
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&image);

        let rewrite = match self
            .ctx
            .qa
            .apply_corrective(&task, &profiles, tier, &prior, &image_b64)
            .await
        {
            Ok(rewrite) => rewrite,
            Err(e) => {
                warn!(task_id = %task.id, tier = %tier, error = %e, "corrective rewrite failed");
                return self
                    .fail_task(delivery, &task, TaskStatus::AwaitingQa, &e.to_string())
                    .await;
            }
        };
        let output = RawOutput {
            content: rewrite.content.clone(),
            model_used: stage.model.name.clone(),
            system_prompt: stage
                .rewrite_prompt
                .system
                .clone(),
            user_prompt: rewrite.prompt_used.clone(),
            produced_at: Utc::now(),
        };
        self.ctx.store.set_output(task.id, &output).await?;

        let task = self
            .ctx
            .store
            .get_task(task.id)
            .await?
            .ok_or(StoreError::TaskNotFound(task.id))?;
        let outcome = self
            .ctx
            .qa
            .run(
                &task,
                &profiles,
                &rewrite.content,
                &image_b64,
                Some(rewrite.prompt_used),
            )
            .await;
        self.settle_qa(delivery, &task, outcome).await
    }

    /// Model call with the transport retry policy: 3 retries, exponential
    /// backoff base 1s factor 2 jitter ±25%, each retry audit-logged.
    async fn generate_with_retries(
        &self,
        task: &Task,
        call: &ModelCall,
    ) -> Result<String, ModelError> {
        let store = &self.ctx.store;
        let process_id = task.process_id;
        let task_id = task.id;
        with_backoff(
            BackoffPolicy::default(),
            |e: &ModelError| {
                if e.is_transient() {
                    RetryClass::Transient
                } else {
                    RetryClass::Permanent
                }
            },
            |attempt, e| {
                warn!(task_id = %task_id, attempt, error = %e, "model call retry");
                let store = store.clone();
                let reason = e.to_string();
                tokio::spawn(async move {
                    let _ = store
                        .emit_audit(
                            NewAuditEvent::new(
                                process_id,
                                AuditKind::ModelCallRetried,
                                serde_json::json!({ "attempt": attempt, "error": reason }),
                            )
                            .for_task(task_id),
                        )
                        .await;
                });
            },
            || async {
                let _permit = self
                    .ctx
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| ModelError::Timeout(call.deadline))?;
                self.ctx.model.generate(call).await
            },
        )
        .await
    }

    /// Apply a QA outcome: complete, park for corrective, or give up.
    async fn settle_qa(
        &self,
        delivery: &Delivery,
        task: &Task,
        outcome: Result<QaOutcome, QaError>,
    ) -> Result<(), WorkerError> {
        match outcome {
            Ok(QaOutcome::Completed { confidence }) => {
                let moved = self
                    .ctx
                    .store
                    .transition_task(
                        task.id,
                        TaskStatus::AwaitingQa,
                        TaskStatus::Completed,
                        TaskUpdate {
                            current_tier: Some(None),
                            confidence: Some(confidence),
                            clear_lease: true,
                            ..TaskUpdate::default()
                        },
                        Some(
                            NewAuditEvent::new(
                                task.process_id,
                                AuditKind::TaskTransitioned,
                                serde_json::json!({ "from": "awaiting_qa", "to": "completed" }),
                            )
                            .for_task(task.id),
                        ),
                    )
                    .await?;
                self.ctx.broker.ack(delivery).await?;
                if moved {
                    metrics::counter!("visionflow_tasks_completed").increment(1);
                    info!(task_id = %task.id, confidence, "task completed");
                    self.ctx
                        .broker
                        .enqueue(
                            QueueKey::Management(ManagementQueue::BatchCompletion),
                            task.id,
                            Priority::Normal,
                        )
                        .await?;
                }
                Ok(())
            }
            Ok(QaOutcome::NeedsCorrective { tier }) => {
                let profiles_version = task.profile_version.clone();
                let ttl = chrono::Duration::seconds(PARKED_LEASE_SECS as i64);
                let parked = self
                    .ctx
                    .store
                    .park_for_corrective(task.id, &self.id, tier, ttl)
                    .await?;
                self.ctx.broker.ack(delivery).await?;
                if parked {
                    debug!(task_id = %task.id, tier = %tier, version = ?profiles_version, "parked for corrective");
                    // Corrective work drains ahead of fresh analysis.
                    self.ctx
                        .broker
                        .enqueue(QueueKey::Corrective(tier), task.id, Priority::High)
                        .await?;
                }
                Ok(())
            }
            Ok(QaOutcome::ManualReview { tier }) => {
                let moved = self
                    .ctx
                    .store
                    .transition_task(
                        task.id,
                        TaskStatus::AwaitingQa,
                        TaskStatus::ManualReview,
                        TaskUpdate {
                            current_tier: Some(None),
                            clear_lease: true,
                            last_error: Some(format!("{tier} attempts exhausted")),
                            ..TaskUpdate::default()
                        },
                        Some(
                            NewAuditEvent::new(
                                task.process_id,
                                AuditKind::TaskTransitioned,
                                serde_json::json!({
                                    "from": "awaiting_qa",
                                    "to": "manual_review",
                                    "tier": tier.to_string(),
                                }),
                            )
                            .for_task(task.id)
                            .with_severity(crate::models::audit::AuditSeverity::Warning),
                        ),
                    )
                    .await?;
                self.ctx.broker.ack(delivery).await?;
                if moved {
                    metrics::counter!("visionflow_tasks_manual_review").increment(1);
                    warn!(task_id = %task.id, tier = %tier, "task sent to manual review");
                    // The completion drain forwards it to the
                    // manual-review queue; a task sits in one queue at a
                    // time.
                    self.ctx
                        .broker
                        .enqueue(
                            QueueKey::Management(ManagementQueue::BatchCompletion),
                            task.id,
                            Priority::Normal,
                        )
                        .await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "qa pipeline error");
                self.fail_task(delivery, task, TaskStatus::AwaitingQa, &e.to_string())
                    .await
            }
        }
    }

    /// Terminal failure path shared by every step.
    async fn fail_task(
        &self,
        delivery: &Delivery,
        task: &Task,
        from: TaskStatus,
        reason: &str,
    ) -> Result<(), WorkerError> {
        let moved = self
            .ctx
            .store
            .transition_task(
                task.id,
                from,
                TaskStatus::Failed,
                TaskUpdate {
                    current_tier: Some(None),
                    last_error: Some(reason.to_string()),
                    clear_lease: true,
                    ..TaskUpdate::default()
                },
                Some(
                    NewAuditEvent::new(
                        task.process_id,
                        AuditKind::TaskTransitioned,
                        serde_json::json!({
                            "from": from.to_string(),
                            "to": "failed",
                            "reason": reason,
                        }),
                    )
                    .for_task(task.id)
                    .with_severity(crate::models::audit::AuditSeverity::Warning),
                ),
            )
            .await?;
        self.ctx.broker.ack(delivery).await?;
        if moved {
            metrics::counter!("visionflow_tasks_failed").increment(1);
            self.ctx
                .broker
                .enqueue(
                    QueueKey::Management(ManagementQueue::BatchCompletion),
                    task.id,
                    Priority::Normal,
                )
                .await?;
        }
        Ok(())
    }
}
