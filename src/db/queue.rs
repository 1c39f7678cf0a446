//! The durable job queue: skip-locked claims, attempt audit rows, and the
//! terminal/retry transitions.

use super::Store;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One unit of LLM work, tied to exactly one inbound turn.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub status: String,
    pub priority: i32,
    pub session_tok: String,
    pub message_id: String,
    pub user_id: String,
    pub input_json: String,
    pub output_json: Option<String>,
    pub error_msg: Option<String>,
    /// Post-claim value: already counts the in-flight run.
    pub attempts: i32,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Append-only audit record, one per claim.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobAttempt {
    pub id: i64,
    pub job_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_msg: Option<String>,
}

const JOB_COLUMNS: &str = "id, status, priority, session_tok, message_id, user_id, \
                           input_json, output_json, error_msg, attempts, next_run_at";

impl Store {
    /// Enqueue a new pending job for an inbound turn. The insert trigger
    /// fires the queue notification; no explicit NOTIFY is needed here.
    pub async fn enqueue_job(
        &self,
        session_tok: &str,
        message_id: &str,
        user_id: &str,
        input: &str,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO ai_jobs (status, priority, session_tok, message_id, user_id, input_json)
              VALUES ('pending', 5, $1, $2, $3, $4)
              RETURNING id",
        )
        .bind(session_tok)
        .bind(message_id)
        .bind(user_id)
        .bind(input)
        .fetch_one(self.pool())
        .await
        .context("failed to enqueue job")?;
        Ok(id)
    }

    /// Claim the next due pending job, if any.
    ///
    /// Single atomic statement: the subselect takes a `FOR UPDATE SKIP
    /// LOCKED` row lock so concurrent claimers pass over each other, and the
    /// enclosing UPDATE moves the row to `processing` and bumps `attempts`
    /// before any other worker can observe it.
    pub async fn claim_next_job(&self) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(&format!(
            r"UPDATE ai_jobs
              SET status = 'processing', attempts = attempts + 1, updated_at = NOW()
              WHERE id = (
                  SELECT id FROM ai_jobs
                  WHERE status = 'pending'
                    AND (next_run_at IS NULL OR next_run_at <= NOW())
                  ORDER BY priority ASC, id ASC
                  LIMIT 1
                  FOR UPDATE SKIP LOCKED
              )
              RETURNING {JOB_COLUMNS}"
        ))
        .fetch_optional(self.pool())
        .await
        .context("failed to claim job")
    }

    /// Open the audit record for a freshly claimed job.
    pub async fn start_attempt(&self, job_id: i64) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO ai_job_attempts (job_id, started_at, status)
              VALUES ($1, NOW(), 'processing')
              RETURNING id",
        )
        .bind(job_id)
        .fetch_one(self.pool())
        .await
        .context("failed to start job attempt")?;
        Ok(id)
    }

    /// Finalize an attempt record (`ok`, `error`, or `timeout`).
    pub async fn finish_attempt(
        &self,
        attempt_id: i64,
        status: &str,
        error_msg: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ai_job_attempts SET status = $2, error_msg = $3, ended_at = NOW()
             WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(status)
        .bind(error_msg)
        .execute(self.pool())
        .await
        .context("failed to finish job attempt")?;
        Ok(())
    }

    /// Terminal success: store the model output and mark the job done.
    pub async fn complete_job(&self, job_id: i64, output_json: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ai_jobs SET status = 'done', output_json = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(output_json)
        .execute(self.pool())
        .await
        .context("failed to complete job")?;
        Ok(())
    }

    /// Transient failure: put the job back in `pending`, invisible until
    /// `delay` has elapsed.
    pub async fn retry_job(&self, job_id: i64, error_msg: &str, delay: Duration) -> Result<()> {
        sqlx::query(
            r"UPDATE ai_jobs
              SET status = 'pending',
                  error_msg = $2,
                  next_run_at = NOW() + ($3 * INTERVAL '1 second'),
                  updated_at = NOW()
              WHERE id = $1",
        )
        .bind(job_id)
        .bind(error_msg)
        .bind(delay.as_secs() as f64)
        .execute(self.pool())
        .await
        .context("failed to schedule job retry")?;
        Ok(())
    }

    /// Terminal failure: no further runs.
    pub async fn fail_job(&self, job_id: i64, error_msg: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ai_jobs SET status = 'failed', error_msg = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(error_msg)
        .execute(self.pool())
        .await
        .context("failed to fail job")?;
        Ok(())
    }
}
