//! Durable state store. The sole authority for process and task status:
//! every mutation is a conditional update keyed on the expected previous
//! state, and audit rows ride in the same transaction as the transition
//! that produced them.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::models::audit::{AuditEvent, AuditKind, AuditSeverity, NewAuditEvent};
use crate::models::job::RegistryJob;
use crate::models::process::{CounterDeltas, Process, ProcessStatus};
use crate::models::qa::{FailureCategory, QaAttempt, QaTier};
use crate::models::task::{
    AnalysisType, RawOutput, SubmissionState, Task, TaskStatus,
};

/// Transient-error retry budget for single-statement operations.
const DB_RETRY_ATTEMPTS: u32 = 3;
const DB_RETRY_BASE_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("row for {entity} {id} failed to decode: {reason}")]
    Corrupt {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
}

/// Fields a worker can set alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub current_tier: Option<Option<QaTier>>,
    pub confidence: Option<f64>,
    pub last_error: Option<String>,
    pub profile_version: Option<String>,
    pub clear_lease: bool,
}

/// Input for task expansion; ids are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub media_id: Uuid,
    pub analysis_id: Uuid,
    pub analysis_type: AnalysisType,
    pub optimised_url: String,
    pub greyscale_url: Option<String>,
}

/// Input for `record_qa_attempt`; index and timestamps are assigned by the
/// store inside the insert transaction.
#[derive(Debug, Clone)]
pub struct NewQaAttempt {
    pub task_id: Uuid,
    pub tier: QaTier,
    pub passed: bool,
    pub failure_categories: Vec<FailureCategory>,
    pub corrective_prompt: Option<String>,
    pub confidence: f64,
    pub duration_ms: i64,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Retry a single-statement operation on transient errors, then
    /// surface; the caller decides whether to fail the task or the run.
    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt + 1 < DB_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = DB_RETRY_BASE_MS * 2u64.pow(attempt - 1);
                    warn!(attempt, delay_ms = delay, error = %e, "transient store error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Processes ───────────────────────────────────────────────────────

    pub async fn create_process(
        &self,
        job: &RegistryJob,
        config_snapshot: serde_json::Value,
    ) -> Result<Process, StoreError> {
        let id = Uuid::new_v4();
        let now = now_str();
        let snapshot =
            serde_json::to_string(&config_snapshot).unwrap_or_else(|_| "{}".to_string());
        self.retrying(|| {
            sqlx::query(
                r#"
                INSERT INTO processes
                    (id, client_id, client_slug, project_id, project_slug, project_name,
                     status, config_snapshot, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(job.client.id.to_string())
            .bind(&job.client.slug)
            .bind(job.project.id.to_string())
            .bind(&job.project.slug)
            .bind(&job.project.name)
            .bind(ProcessStatus::Initializing.to_string())
            .bind(&snapshot)
            .bind(&now)
            .execute(&self.pool)
        })
        .await?;
        self.emit_audit(NewAuditEvent::new(
            id,
            AuditKind::ProcessCreated,
            serde_json::json!({
                "project_id": job.project.id,
                "media": job.media.len(),
                "analyses": job.analyses.len(),
            }),
        ))
        .await?;
        self.get_process(id).await?.ok_or(StoreError::ProcessNotFound(id))
    }

    pub async fn get_process(&self, id: Uuid) -> Result<Option<Process>, StoreError> {
        let row = sqlx::query("SELECT * FROM processes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| process_from_row(&r)).transpose()
    }

    /// CAS on process status. Terminal target states also stamp
    /// `completed_at`.
    pub async fn transition_process(
        &self,
        id: Uuid,
        from: ProcessStatus,
        to: ProcessStatus,
    ) -> Result<bool, StoreError> {
        let completed_at = to.is_terminal().then(now_str);
        let result = self
            .retrying(|| {
                sqlx::query(
                    r#"
                    UPDATE processes
                    SET status = ?, completed_at = COALESCE(?, completed_at)
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(to.to_string())
                .bind(completed_at.clone())
                .bind(id.to_string())
                .bind(from.to_string())
                .execute(&self.pool)
            })
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_process_counters(
        &self,
        id: Uuid,
        deltas: CounterDeltas,
    ) -> Result<Process, StoreError> {
        self.retrying(|| {
            sqlx::query(
                r#"
                UPDATE processes
                SET completed_tasks = completed_tasks + ?,
                    failed_tasks = failed_tasks + ?,
                    manual_review_tasks = manual_review_tasks + ?
                WHERE id = ?
                "#,
            )
            .bind(deltas.completed)
            .bind(deltas.failed)
            .bind(deltas.manual_review)
            .bind(id.to_string())
            .execute(&self.pool)
        })
        .await?;
        self.get_process(id).await?.ok_or(StoreError::ProcessNotFound(id))
    }

    /// Flip the exactly-once `processing` notification flag. Returns true
    /// for the single caller that wins.
    pub async fn try_mark_processing_notified(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = self
            .retrying(|| {
                sqlx::query(
                    "UPDATE processes SET processing_notified = 1
                     WHERE id = ? AND processing_notified = 0",
                )
                .bind(id.to_string())
                .execute(&self.pool)
            })
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn try_mark_completed_notified(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = self
            .retrying(|| {
                sqlx::query(
                    "UPDATE processes SET completed_notified = 1
                     WHERE id = ? AND completed_notified = 0",
                )
                .bind(id.to_string())
                .execute(&self.pool)
            })
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = self
            .retrying(|| {
                sqlx::query(
                    "UPDATE processes SET cancel_requested = 1
                     WHERE id = ? AND cancel_requested = 0",
                )
                .bind(id.to_string())
                .execute(&self.pool)
            })
            .await?;
        if result.rows_affected() == 1 {
            self.emit_audit(NewAuditEvent::new(
                id,
                AuditKind::ProcessCancelRequested,
                serde_json::json!({}),
            ))
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM processes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("cancel_requested") != 0)
            .unwrap_or(false))
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    /// Insert the full expansion of a job in a single transaction, and
    /// stamp the process total in the same transaction.
    pub async fn create_tasks(
        &self,
        process_id: Uuid,
        tasks: &[NewTask],
    ) -> Result<Vec<Task>, StoreError> {
        let now = now_str();
        let mut ids = Vec::with_capacity(tasks.len());
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            let id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO tasks
                    (id, process_id, media_id, analysis_id, analysis_type,
                     optimised_url, greyscale_url, status, submission_state,
                     created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(process_id.to_string())
            .bind(task.media_id.to_string())
            .bind(task.analysis_id.to_string())
            .bind(task.analysis_type.to_string())
            .bind(&task.optimised_url)
            .bind(&task.greyscale_url)
            .bind(TaskStatus::Pending.to_string())
            .bind(SubmissionState::Unsubmitted.to_string())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        sqlx::query("UPDATE processes SET total_tasks = ? WHERE id = ?")
            .bind(tasks.len() as i64)
            .bind(process_id.to_string())
            .execute(&mut *tx)
            .await?;
        emit_audit_in_tx(
            &mut tx,
            NewAuditEvent::new(
                process_id,
                AuditKind::TasksExpanded,
                serde_json::json!({ "count": tasks.len() }),
            ),
        )
        .await?;
        tx.commit().await?;

        let mut created = Vec::with_capacity(ids.len());
        for id in ids {
            created.push(self.get_task(id).await?.ok_or(StoreError::TaskNotFound(id))?);
        }
        Ok(created)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn tasks_for_process(&self, process_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE process_id = ? ORDER BY created_at")
            .bind(process_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Atomically claim a pending task for analysis: `pending → running`
    /// with worker and lease deadline stamped. At most one worker wins.
    pub async fn lease_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Task>, StoreError> {
        let deadline = (Utc::now() + lease_ttl).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, worker_id = ?, lease_deadline = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(TaskStatus::Running.to_string())
        .bind(worker_id)
        .bind(&deadline)
        .bind(now_str())
        .bind(task_id.to_string())
        .bind(TaskStatus::Pending.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }
        self.get_task(task_id).await
    }

    /// Claim a task parked in a corrective queue: `awaiting_qa` with no
    /// holder becomes leased to this worker.
    pub async fn claim_for_qa(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Task>, StoreError> {
        let deadline = (Utc::now() + lease_ttl).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET worker_id = ?, lease_deadline = ?, updated_at = ?
            WHERE id = ? AND status = ? AND worker_id IS NULL
            "#,
        )
        .bind(worker_id)
        .bind(&deadline)
        .bind(now_str())
        .bind(task_id.to_string())
        .bind(TaskStatus::AwaitingQa.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }
        self.get_task(task_id).await
    }

    pub async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let deadline = (Utc::now() + lease_ttl).to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET lease_deadline = ?, updated_at = ? WHERE id = ? AND worker_id = ?",
        )
        .bind(&deadline)
        .bind(now_str())
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Park an `awaiting_qa` task for a corrective queue hop: the holder
    /// releases the lease but a fresh deadline keeps the reaper able to
    /// recover the task if nothing ever picks it up.
    pub async fn park_for_corrective(
        &self,
        task_id: Uuid,
        worker_id: &str,
        tier: QaTier,
        lease_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let deadline = (Utc::now() + lease_ttl).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET worker_id = NULL, lease_deadline = ?, current_tier = ?, updated_at = ?
            WHERE id = ? AND status = ? AND worker_id = ?
            "#,
        )
        .bind(&deadline)
        .bind(tier.to_string())
        .bind(now_str())
        .bind(task_id.to_string())
        .bind(TaskStatus::AwaitingQa.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Conditional status transition. Returns whether the CAS won; a
    /// non-matching previous status rejects without side effect. The audit
    /// row commits in the same transaction.
    pub async fn transition_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        update: TaskUpdate,
        audit: Option<NewAuditEvent>,
    ) -> Result<bool, StoreError> {
        let now = now_str();
        let completed_at = to.is_terminal().then(|| now.clone());
        let mut tx = self.pool.begin().await?;

        let mut sql = String::from(
            "UPDATE tasks SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)",
        );
        if update.current_tier.is_some() {
            sql.push_str(", current_tier = ?");
        }
        if update.confidence.is_some() {
            sql.push_str(", confidence = ?");
        }
        if update.last_error.is_some() {
            sql.push_str(", last_error = ?");
        }
        if update.profile_version.is_some() {
            sql.push_str(", profile_version = ?");
        }
        if update.clear_lease {
            sql.push_str(", worker_id = NULL, lease_deadline = NULL");
        }
        sql.push_str(" WHERE id = ? AND status = ?");

        let mut query = sqlx::query(&sql)
            .bind(to.to_string())
            .bind(&now)
            .bind(completed_at);
        if let Some(tier) = update.current_tier {
            query = query.bind(tier.map(|t| t.to_string()));
        }
        if let Some(confidence) = update.confidence {
            query = query.bind(confidence);
        }
        if let Some(last_error) = &update.last_error {
            query = query.bind(last_error);
        }
        if let Some(version) = &update.profile_version {
            query = query.bind(version);
        }
        let result = query
            .bind(task_id.to_string())
            .bind(from.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(event) = audit {
            emit_audit_in_tx(&mut tx, event).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Move the QA cursor; `None` clears it once the task leaves QA.
    pub async fn set_current_tier(
        &self,
        task_id: Uuid,
        tier: Option<QaTier>,
    ) -> Result<(), StoreError> {
        self.retrying(|| {
            sqlx::query("UPDATE tasks SET current_tier = ?, updated_at = ? WHERE id = ?")
                .bind(tier.map(|t| t.to_string()))
                .bind(now_str())
                .bind(task_id.to_string())
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    /// Attach the latest raw model output to a task.
    pub async fn set_output(&self, task_id: Uuid, output: &RawOutput) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(output).unwrap_or_default();
        self.retrying(|| {
            sqlx::query("UPDATE tasks SET output = ?, updated_at = ? WHERE id = ?")
                .bind(&encoded)
                .bind(now_str())
                .bind(task_id.to_string())
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    /// Record the result-submission outcome exactly once. The second and
    /// later attempts lose the CAS and are audit-only at the call site.
    pub async fn try_mark_submission(
        &self,
        task_id: Uuid,
        state: SubmissionState,
    ) -> Result<bool, StoreError> {
        let result = self
            .retrying(|| {
                sqlx::query(
                    "UPDATE tasks SET submission_state = ?, updated_at = ?
                     WHERE id = ? AND submission_state = ?",
                )
                .bind(state.to_string())
                .bind(now_str())
                .bind(task_id.to_string())
                .bind(SubmissionState::Unsubmitted.to_string())
                .execute(&self.pool)
            })
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip tasks whose lease deadline has passed back to `pending`,
    /// increment their attempt counter, and audit each reclaim. Applies to
    /// `running` and to unclaimed `awaiting_qa` tasks alike: the fresh
    /// worker re-runs the analysis from the top.
    pub async fn reclaim_expired(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let now = now_str();
        let rows = sqlx::query(
            r#"
            SELECT id, process_id FROM tasks
            WHERE status IN (?, ?) AND lease_deadline IS NOT NULL AND lease_deadline < ?
            ORDER BY lease_deadline
            LIMIT ?
            "#,
        )
        .bind(TaskStatus::Running.to_string())
        .bind(TaskStatus::AwaitingQa.to_string())
        .bind(&now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            let process_id: String = row.get("process_id");
            let task_id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt {
                entity: "task",
                id: id.clone(),
                reason: e.to_string(),
            })?;
            let process_id = Uuid::parse_str(&process_id).map_err(|e| StoreError::Corrupt {
                entity: "process",
                id: process_id.clone(),
                reason: e.to_string(),
            })?;

            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?, worker_id = NULL, lease_deadline = NULL,
                    current_tier = NULL, attempt_count = attempt_count + 1, updated_at = ?
                WHERE id = ? AND status IN (?, ?) AND lease_deadline < ?
                "#,
            )
            .bind(TaskStatus::Pending.to_string())
            .bind(&now)
            .bind(task_id.to_string())
            .bind(TaskStatus::Running.to_string())
            .bind(TaskStatus::AwaitingQa.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                // Raced with the holder finishing; nothing to reclaim.
                tx.rollback().await?;
                continue;
            }
            emit_audit_in_tx(
                &mut tx,
                NewAuditEvent::new(
                    process_id,
                    AuditKind::TaskReclaimed,
                    serde_json::json!({ "task_id": task_id }),
                )
                .for_task(task_id)
                .with_severity(AuditSeverity::Warning),
            )
            .await?;
            tx.commit().await?;
            if let Some(task) = self.get_task(task_id).await? {
                reclaimed.push(task);
            }
        }
        Ok(reclaimed)
    }

    // ── QA attempts ─────────────────────────────────────────────────────

    /// Append a QA attempt; the attempt index is computed inside the
    /// transaction so indices stay strictly monotonic per (task, tier),
    /// and the matching per-tier counter on the task row moves with it.
    pub async fn record_qa_attempt(&self, attempt: NewQaAttempt) -> Result<QaAttempt, StoreError> {
        let id = Uuid::new_v4();
        let now = now_str();
        let categories = serde_json::to_string(&attempt.failure_categories).unwrap_or_default();
        let counter_column = match attempt.tier {
            QaTier::Structural => "qa_attempts_structural",
            QaTier::ContentQuality => "qa_attempts_content",
            QaTier::DomainExpert => "qa_attempts_domain",
        };

        let mut tx = self.pool.begin().await?;
        let index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_index), 0) + 1 FROM qa_attempts
             WHERE task_id = ? AND tier = ?",
        )
        .bind(attempt.task_id.to_string())
        .bind(attempt.tier.to_string())
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO qa_attempts
                (id, task_id, tier, attempt_index, passed, failure_categories,
                 corrective_prompt, confidence, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(attempt.task_id.to_string())
        .bind(attempt.tier.to_string())
        .bind(index)
        .bind(attempt.passed as i64)
        .bind(&categories)
        .bind(&attempt.corrective_prompt)
        .bind(attempt.confidence)
        .bind(attempt.duration_ms)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "UPDATE tasks SET {counter_column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(index)
        .bind(&now)
        .bind(attempt.task_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(QaAttempt {
            id,
            task_id: attempt.task_id,
            tier: attempt.tier,
            attempt_index: index,
            passed: attempt.passed,
            failure_categories: attempt.failure_categories,
            corrective_prompt: attempt.corrective_prompt,
            confidence: attempt.confidence,
            duration_ms: attempt.duration_ms,
            created_at: Utc::now(),
        })
    }

    pub async fn qa_attempts_for_task(&self, task_id: Uuid) -> Result<Vec<QaAttempt>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM qa_attempts WHERE task_id = ? ORDER BY tier, attempt_index",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(qa_attempt_from_row).collect()
    }

    // ── Audit ───────────────────────────────────────────────────────────

    pub async fn emit_audit(&self, event: NewAuditEvent) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        emit_audit_in_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn audit_events(&self, process_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM audit_log WHERE process_id = ? ORDER BY seq")
            .bind(process_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    // ── Orchestrator scans ──────────────────────────────────────────────

    /// Processes whose first task has started but whose `processing`
    /// status update has not been delivered yet.
    pub async fn unnotified_started_processes(&self) -> Result<Vec<Process>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM processes p
            WHERE p.processing_notified = 0
              AND p.status IN ('initializing', 'processing')
              AND EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.process_id = p.id AND t.status != 'pending'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(process_from_row).collect()
    }

    /// Non-terminal processes with a pending cancel request.
    pub async fn cancel_requested_processes(&self) -> Result<Vec<Process>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM processes
             WHERE cancel_requested = 1 AND status IN ('initializing', 'processing')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(process_from_row).collect()
    }

    pub async fn pending_tasks(&self, process_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE process_id = ? AND status = ?")
            .bind(process_id.to_string())
            .bind(TaskStatus::Pending.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    // ── Aggregates for reporting ────────────────────────────────────────

    pub async fn completed_media_count(&self, process_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT media_id) FROM tasks WHERE process_id = ? AND status = ?",
        )
        .bind(process_id.to_string())
        .bind(TaskStatus::Completed.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn completed_analysis_types(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT analysis_type FROM tasks
             WHERE process_id = ? AND status = ? ORDER BY analysis_type",
        )
        .bind(process_id.to_string())
        .bind(TaskStatus::Completed.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("analysis_type")).collect())
    }
}

async fn emit_audit_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: NewAuditEvent,
) -> Result<(), StoreError> {
    let seq: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log WHERE process_id = ?",
    )
    .bind(event.process_id.to_string())
    .fetch_one(&mut **tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO audit_log
            (process_id, seq, task_id, kind, severity, payload, correlation_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.process_id.to_string())
    .bind(seq)
    .bind(event.task_id.map(|t| t.to_string()))
    .bind(event.kind.to_string())
    .bind(event.severity.to_string())
    .bind(serde_json::to_string(&event.payload).unwrap_or_default())
    .bind(event.correlation_id.to_string())
    .bind(now_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn corrupt(entity: &'static str, id: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        entity,
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

fn get_uuid(row: &SqliteRow, entity: &'static str, column: &str) -> Result<Uuid, StoreError> {
    let raw: String = row.get(column);
    Uuid::parse_str(&raw).map_err(|e| corrupt(entity, &raw, e))
}

fn process_from_row(row: &SqliteRow) -> Result<Process, StoreError> {
    let id = get_uuid(row, "process", "id")?;
    let status_raw: String = row.get("status");
    let created_raw: String = row.get("created_at");
    let completed_raw: Option<String> = row.get("completed_at");
    let snapshot_raw: String = row.get("config_snapshot");
    Ok(Process {
        id,
        client_id: get_uuid(row, "process", "client_id")?,
        client_slug: row.get("client_slug"),
        project_id: get_uuid(row, "process", "project_id")?,
        project_slug: row.get("project_slug"),
        project_name: row.get("project_name"),
        status: status_raw
            .parse()
            .map_err(|e| corrupt("process", &id.to_string(), e))?,
        total_tasks: row.get("total_tasks"),
        completed_tasks: row.get("completed_tasks"),
        failed_tasks: row.get("failed_tasks"),
        manual_review_tasks: row.get("manual_review_tasks"),
        config_snapshot: serde_json::from_str(&snapshot_raw).unwrap_or(serde_json::Value::Null),
        processing_notified: row.get::<i64, _>("processing_notified") != 0,
        completed_notified: row.get::<i64, _>("completed_notified") != 0,
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: parse_ts(&created_raw).map_err(|e| corrupt("process", &id.to_string(), e))?,
        completed_at: completed_raw
            .map(|raw| parse_ts(&raw).map_err(|e| corrupt("process", &id.to_string(), e)))
            .transpose()?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let id = get_uuid(row, "task", "id")?;
    let bad = |e: &dyn std::fmt::Display| corrupt("task", &id.to_string(), e);
    let status_raw: String = row.get("status");
    let type_raw: String = row.get("analysis_type");
    let tier_raw: Option<String> = row.get("current_tier");
    let submission_raw: String = row.get("submission_state");
    let output_raw: Option<String> = row.get("output");
    let created_raw: String = row.get("created_at");
    let updated_raw: String = row.get("updated_at");
    let completed_raw: Option<String> = row.get("completed_at");
    let lease_raw: Option<String> = row.get("lease_deadline");
    Ok(Task {
        id,
        process_id: get_uuid(row, "task", "process_id")?,
        media_id: get_uuid(row, "task", "media_id")?,
        analysis_id: get_uuid(row, "task", "analysis_id")?,
        analysis_type: type_raw.parse().map_err(|e| bad(&e))?,
        optimised_url: row.get("optimised_url"),
        greyscale_url: row.get("greyscale_url"),
        status: status_raw.parse().map_err(|e| bad(&e))?,
        attempt_count: row.get("attempt_count"),
        qa_attempts_structural: row.get("qa_attempts_structural"),
        qa_attempts_content: row.get("qa_attempts_content"),
        qa_attempts_domain: row.get("qa_attempts_domain"),
        current_tier: tier_raw
            .map(|raw| raw.parse().map_err(|e| bad(&e)))
            .transpose()?,
        confidence: row.get("confidence"),
        last_error: row.get("last_error"),
        output: output_raw
            .map(|raw| serde_json::from_str(&raw).map_err(|e| bad(&e)))
            .transpose()?,
        profile_version: row.get("profile_version"),
        submission_state: submission_raw.parse().map_err(|e| bad(&e))?,
        worker_id: row.get("worker_id"),
        lease_deadline: lease_raw
            .map(|raw| parse_ts(&raw).map_err(|e| bad(&e)))
            .transpose()?,
        created_at: parse_ts(&created_raw).map_err(|e| bad(&e))?,
        updated_at: parse_ts(&updated_raw).map_err(|e| bad(&e))?,
        completed_at: completed_raw
            .map(|raw| parse_ts(&raw).map_err(|e| bad(&e)))
            .transpose()?,
    })
}

fn qa_attempt_from_row(row: &SqliteRow) -> Result<QaAttempt, StoreError> {
    let id = get_uuid(row, "qa_attempt", "id")?;
    let bad = |e: &dyn std::fmt::Display| corrupt("qa_attempt", &id.to_string(), e);
    let tier_raw: String = row.get("tier");
    let categories_raw: String = row.get("failure_categories");
    let created_raw: String = row.get("created_at");
    Ok(QaAttempt {
        id,
        task_id: get_uuid(row, "qa_attempt", "task_id")?,
        tier: tier_raw.parse().map_err(|e| bad(&e))?,
        attempt_index: row.get("attempt_index"),
        passed: row.get::<i64, _>("passed") != 0,
        failure_categories: serde_json::from_str(&categories_raw).map_err(|e| bad(&e))?,
        corrective_prompt: row.get("corrective_prompt"),
        confidence: row.get("confidence"),
        duration_ms: row.get("duration_ms"),
        created_at: parse_ts(&created_raw).map_err(|e| bad(&e))?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEvent, StoreError> {
    let process_id = get_uuid(row, "audit", "process_id")?;
    let bad = |e: &dyn std::fmt::Display| corrupt("audit", &process_id.to_string(), e);
    let kind_raw: String = row.get("kind");
    let severity_raw: String = row.get("severity");
    let payload_raw: String = row.get("payload");
    let task_raw: Option<String> = row.get("task_id");
    let correlation_raw: String = row.get("correlation_id");
    let created_raw: String = row.get("created_at");
    Ok(AuditEvent {
        process_id,
        seq: row.get("seq"),
        task_id: task_raw
            .map(|raw| Uuid::parse_str(&raw).map_err(|e| bad(&e)))
            .transpose()?,
        kind: kind_raw.parse().map_err(|e| bad(&e))?,
        severity: severity_raw.parse().map_err(|e| bad(&e))?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        correlation_id: Uuid::parse_str(&correlation_raw).map_err(|e| bad(&e))?,
        created_at: parse_ts(&created_raw).map_err(|e| bad(&e))?,
    })
}
