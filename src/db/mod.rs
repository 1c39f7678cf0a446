//! Local datastore: inbound turns, the job queue, send logs, and the
//! permanent chat history.
//!
//! This store owns its schema and creates missing tables at startup. The
//! transactional store (users, sessions, bot configs) is a different
//! database and is never touched from here; see `crate::directory`.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

pub mod history;
pub mod queue;
pub mod turns;

pub use queue::{Job, JobAttempt};
pub use turns::{InboundTurn, NewTurn, SaveOutcome};

/// Notification channel fired by the job-insert trigger. The payload is a
/// constant hint; listeners re-query the table, never parse the payload.
pub const JOBS_CHANNEL: &str = "ai_jobs_channel";

/// Open a connection pool against the given Postgres URL.
pub async fn connect(url: &str, label: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to {label} database"))
}

/// Typed access to the local store. Cheap to clone; shares the pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create missing tables and (re)install the job-insert NOTIFY trigger.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", first_line(statement)))?;
        }

        self.install_notify_trigger().await
    }

    async fn install_notify_trigger(&self) -> Result<()> {
        sqlx::query(
            r"CREATE OR REPLACE FUNCTION notify_ai_job_insert()
              RETURNS TRIGGER AS $$
              BEGIN
                  PERFORM pg_notify('ai_jobs_channel', 'new');
                  RETURN NEW;
              END;
              $$ LANGUAGE plpgsql",
        )
        .execute(&self.pool)
        .await
        .context("failed to create notify function")?;

        sqlx::query("DROP TRIGGER IF EXISTS ai_jobs_insert_trigger ON ai_jobs")
            .execute(&self.pool)
            .await
            .context("failed to drop existing job trigger")?;

        sqlx::query(
            r"CREATE TRIGGER ai_jobs_insert_trigger
              AFTER INSERT ON ai_jobs
              FOR EACH ROW
              EXECUTE FUNCTION notify_ai_job_insert()",
        )
        .execute(&self.pool)
        .await
        .context("failed to create job trigger")?;

        tracing::info!("NOTIFY trigger installed on ai_jobs ({JOBS_CHANNEL})");
        Ok(())
    }
}

fn first_line(sql: &str) -> &str {
    sql.lines().next().unwrap_or(sql).trim()
}

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS ai_chat_messages (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL UNIQUE,
        session_tok TEXT NOT NULL,
        from_jid TEXT NOT NULL,
        to_jid TEXT NOT NULL,
        from_me BOOLEAN NOT NULL DEFAULT FALSE,
        msg_type TEXT NOT NULL,
        body TEXT NOT NULL,
        push_name TEXT NOT NULL DEFAULT '',
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        timestamp TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE INDEX IF NOT EXISTS idx_ai_chat_messages_session
        ON ai_chat_messages(session_tok, timestamp DESC)",
    r"CREATE INDEX IF NOT EXISTS idx_ai_chat_messages_unread
        ON ai_chat_messages(session_tok, from_jid) WHERE NOT is_read AND NOT from_me",
    r"CREATE TABLE IF NOT EXISTS ai_jobs (
        id BIGSERIAL PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 5,
        session_tok TEXT NOT NULL,
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        input_json TEXT NOT NULL DEFAULT '',
        output_json TEXT,
        error_msg TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_run_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE INDEX IF NOT EXISTS idx_ai_jobs_claim
        ON ai_jobs(priority, id) WHERE status = 'pending'",
    r"CREATE TABLE IF NOT EXISTS ai_job_attempts (
        id BIGSERIAL PRIMARY KEY,
        job_id BIGINT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        ended_at TIMESTAMPTZ,
        status TEXT NOT NULL,
        error_msg TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE INDEX IF NOT EXISTS idx_ai_job_attempts_job ON ai_job_attempts(job_id)",
    r"CREATE TABLE IF NOT EXISTS message_send_logs (
        id BIGSERIAL PRIMARY KEY,
        session_tok TEXT NOT NULL,
        to_jid TEXT NOT NULL,
        body TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent',
        error_msg TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE TABLE IF NOT EXISTS chat_rooms (
        id BIGSERIAL PRIMARY KEY,
        chat_id TEXT NOT NULL UNIQUE,
        user_token TEXT NOT NULL,
        contact_jid TEXT NOT NULL,
        contact_name TEXT NOT NULL DEFAULT '',
        chat_type TEXT NOT NULL DEFAULT 'individual',
        is_group BOOLEAN NOT NULL DEFAULT FALSE,
        last_message TEXT NOT NULL DEFAULT '',
        last_sender TEXT NOT NULL DEFAULT '',
        last_activity TIMESTAMPTZ NOT NULL,
        unread_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE TABLE IF NOT EXISTS chat_messages (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL,
        chat_room_id BIGINT NOT NULL,
        chat_id TEXT NOT NULL,
        user_token TEXT NOT NULL,
        sender_jid TEXT NOT NULL,
        sender_type TEXT NOT NULL,
        message_type TEXT NOT NULL DEFAULT 'text',
        content TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent',
        message_timestamp TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE INDEX IF NOT EXISTS idx_chat_messages_room
        ON chat_messages(chat_room_id, message_timestamp DESC)",
];
