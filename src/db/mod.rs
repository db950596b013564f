pub mod store;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Create the SQLite connection pool. In-memory databases get a single
/// connection so every handle sees the same database.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS processes (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        client_slug TEXT NOT NULL,
        project_id TEXT NOT NULL,
        project_slug TEXT NOT NULL,
        project_name TEXT NOT NULL,
        status TEXT NOT NULL,
        total_tasks INTEGER NOT NULL DEFAULT 0,
        completed_tasks INTEGER NOT NULL DEFAULT 0,
        failed_tasks INTEGER NOT NULL DEFAULT 0,
        manual_review_tasks INTEGER NOT NULL DEFAULT 0,
        config_snapshot TEXT NOT NULL,
        processing_notified INTEGER NOT NULL DEFAULT 0,
        completed_notified INTEGER NOT NULL DEFAULT 0,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        process_id TEXT NOT NULL REFERENCES processes(id),
        media_id TEXT NOT NULL,
        analysis_id TEXT NOT NULL,
        analysis_type TEXT NOT NULL,
        optimised_url TEXT NOT NULL,
        greyscale_url TEXT,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        qa_attempts_structural INTEGER NOT NULL DEFAULT 0,
        qa_attempts_content INTEGER NOT NULL DEFAULT 0,
        qa_attempts_domain INTEGER NOT NULL DEFAULT 0,
        current_tier TEXT,
        confidence REAL,
        last_error TEXT,
        output TEXT,
        profile_version TEXT,
        submission_state TEXT NOT NULL DEFAULT 'unsubmitted',
        worker_id TEXT,
        lease_deadline TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_tasks_process ON tasks(process_id)",
    "CREATE INDEX IF NOT EXISTS ix_tasks_status ON tasks(status)",
    r#"
    CREATE TABLE IF NOT EXISTS qa_attempts (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id),
        tier TEXT NOT NULL,
        attempt_index INTEGER NOT NULL,
        passed INTEGER NOT NULL,
        failure_categories TEXT NOT NULL,
        corrective_prompt TEXT,
        confidence REAL NOT NULL,
        duration_ms INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (task_id, tier, attempt_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_qa_attempts_task ON qa_attempts(task_id, tier)",
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        process_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        task_id TEXT,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        payload TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (process_id, seq)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_audit_process ON audit_log(process_id, seq)",
];

/// Apply the schema. Idempotent; runs at every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
