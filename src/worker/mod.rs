//! The worker pool: a LISTEN-driven loop plus a polling sweeper that claim
//! jobs from the queue and run them to a terminal row state.
//!
//! The listener gives low-latency wake-up and is allowed to be flaky (cloud
//! Postgres drops LISTEN connections aggressively); the 2-second sweeper is
//! the correctness backstop and always runs.

use crate::context::{ContextBuilder, ContextData};
use crate::db::{InboundTurn, Job, Store, JOBS_CHANNEL};
use crate::directory::{Directory, UsageLog};
use crate::format::format_for_whatsapp;
use crate::outbound::{ChatServerClient, TypingState};
use crate::providers::{ChatOutcome, CircuitBreaker, ErrorKind, ModelClient, ModelError};
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A job is retried until this many claims have failed.
pub const MAX_ATTEMPTS: i32 = 3;
/// Spacing between transient-failure retries.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

pub const BREAKER_MAX_FAILURES: u32 = 5;
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const LISTEN_MIN_BACKOFF: Duration = Duration::from_secs(10);
const LISTEN_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// History window for the first model round, and the narrowed window used
/// for the one context-length retry.
const DEFAULT_WINDOW: usize = 10;
const REDUCED_WINDOW: usize = 5;

/// What to do about a failed model round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Rebuild the context with `REDUCED_WINDOW` messages and try once more.
    RetryNarrowWindow,
    /// Put the job back in `pending` if attempts remain.
    Transient,
    /// Fail the job now; no retry can help.
    Permanent,
}

/// Retry decision table for model errors. `window` is the history window the
/// failing round was built with.
pub fn classify_failure(kind: ErrorKind, window: usize) -> Disposition {
    match kind {
        ErrorKind::ContextLength if window > REDUCED_WINDOW => Disposition::RetryNarrowWindow,
        ErrorKind::Retryable | ErrorKind::BreakerOpen => Disposition::Transient,
        ErrorKind::Auth
        | ErrorKind::Payment
        | ErrorKind::Moderation
        | ErrorKind::ContextLength
        | ErrorKind::Other => Disposition::Permanent,
    }
}

enum RoundFailure {
    /// Fetching settings or history failed; retryable like any other
    /// persistence hiccup.
    ContextBuild(anyhow::Error),
    Model(ModelError),
}

/// Audit status for a failed model attempt. Timeouts get their own label.
fn attempt_status(err: &ModelError) -> &'static str {
    if err.kind == ErrorKind::Retryable && err.code == 408 {
        "timeout"
    } else {
        "error"
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    store: Store,
    directory: Arc<dyn Directory>,
    model: Arc<dyn ModelClient>,
    breaker: Arc<CircuitBreaker>,
    chat: ChatServerClient,
    context: Arc<ContextBuilder>,
    ai_timeout: Duration,
}

/// Handle returned by [`WorkerPool::start`]; dropping it does not stop the
/// loops, call [`WorkerHandle::stop`].
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for both loops. In-flight jobs finish to a
    /// terminal row state first; there is deliberately no inner timeout.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("worker pool stopped");
    }
}

impl WorkerPool {
    pub fn new(
        store: Store,
        directory: Arc<dyn Directory>,
        model: Arc<dyn ModelClient>,
        breaker: Arc<CircuitBreaker>,
        chat: ChatServerClient,
        ai_timeout: Duration,
    ) -> Self {
        let context = Arc::new(ContextBuilder::new(store.clone(), directory.clone()));
        Self {
            store,
            directory,
            model,
            breaker,
            chat,
            context,
            ai_timeout,
        }
    }

    /// Launch the listener and the sweeper.
    pub fn start(self) -> WorkerHandle {
        tracing::info!(
            provider = self.model.provider_name(),
            model = self.model.model_name(),
            "worker pool starting"
        );

        let (shutdown, rx) = watch::channel(false);
        let listener = tokio::spawn(self.clone().listen_loop(rx.clone()));
        let sweeper = tokio::spawn(self.clone().sweep_loop(rx));

        WorkerHandle {
            shutdown,
            tasks: vec![listener, sweeper],
        }
    }

    // ── Loops ────────────────────────────────────────────────────

    async fn sweep_loop(self, mut shutdown: watch::Receiver<bool>) {
        crate::health::mark_component_ok("worker-sweeper");
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => self.drain_queue().await,
            }
        }
        tracing::info!("worker sweeper stopped");
    }

    async fn listen_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = LISTEN_MIN_BACKOFF;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.listen_session(&mut shutdown).await {
                Ok(()) => break, // shutdown observed inside the session
                Err(e) => {
                    // Cloud backends drop LISTEN connections routinely; the
                    // sweeper keeps the queue moving while we reconnect.
                    crate::health::mark_component_error("worker-listener", format!("{e:#}"));
                    crate::health::bump_component_restart("worker-listener");
                    tracing::info!("queue listener disconnected ({e:#}), polling covers the gap");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(LISTEN_MAX_BACKOFF);
        }

        tracing::info!("worker listener stopped");
    }

    /// One LISTEN connection lifetime. Returns `Ok(())` only on shutdown.
    async fn listen_session(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(self.store.pool()).await?;
        listener.listen(JOBS_CHANNEL).await?;

        crate::health::mark_component_ok("worker-listener");
        tracing::info!("listening for job notifications on {JOBS_CHANNEL}");

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                notification = listener.try_recv() => match notification {
                    Ok(Some(_)) => {
                        tracing::debug!("job notification received");
                        self.drain_queue().await;
                    }
                    // The connection dropped and was re-established under
                    // us; a wake-up may have been lost, so drain once.
                    Ok(None) => {
                        tracing::debug!("listener connection recycled");
                        self.drain_queue().await;
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = keepalive.tick() => {
                    if let Err(e) = sqlx::query("SELECT 1").execute(self.store.pool()).await {
                        tracing::debug!("listener keepalive ping failed: {e}");
                    }
                }
            }
        }
    }

    /// Claim and process jobs until the queue has nothing due.
    async fn drain_queue(&self) {
        loop {
            match self.store.claim_next_job().await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("job claim failed: {e:#}");
                    break;
                }
            }
        }
    }

    // ── Per-job pipeline ─────────────────────────────────────────

    async fn process_job(&self, job: Job) {
        tracing::info!(
            job_id = job.id,
            message_id = %job.message_id,
            attempt = job.attempts,
            "processing job"
        );
        let started = Instant::now();

        let mut attempt_id = match self.store.start_attempt(job.id).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("failed to open attempt record for job #{}: {e:#}", job.id);
                None
            }
        };

        let turn = match self.store.turn_by_message_id(&job.message_id).await {
            Ok(Some(turn)) => turn,
            Ok(None) => {
                self.fail_permanent(
                    &job,
                    attempt_id,
                    &format!("inbound turn {} not found for job", job.message_id),
                )
                .await;
                return;
            }
            Err(e) => {
                self.fail_transient(
                    &job,
                    attempt_id,
                    "error",
                    &format!("failed to load inbound turn: {e:#}"),
                )
                .await;
                return;
            }
        };

        self.spawn_mark_read(&job, &turn);

        let phone = turn
            .from_jid
            .split('@')
            .next()
            .unwrap_or(&turn.from_jid)
            .to_string();

        let mut window = DEFAULT_WINDOW;
        let outcome = loop {
            match self.model_round(&job, window, &phone).await {
                Ok(outcome) => break outcome,
                Err(RoundFailure::ContextBuild(e)) => {
                    self.fail_transient(
                        &job,
                        attempt_id,
                        "error",
                        &format!("context build failed: {e:#}"),
                    )
                    .await;
                    return;
                }
                Err(RoundFailure::Model(err)) => match classify_failure(err.kind, window) {
                    Disposition::RetryNarrowWindow => {
                        tracing::info!(
                            job_id = job.id,
                            "context too long, retrying with a {REDUCED_WINDOW}-message window"
                        );
                        // The narrowed re-run is a fresh attempt in the
                        // audit trail: close this one out, open another.
                        if let Some(id) = attempt_id {
                            if let Err(e) = self
                                .store
                                .finish_attempt(id, "error", Some(&err.message))
                                .await
                            {
                                tracing::warn!(
                                    "failed to finalize attempt for job #{}: {e:#}",
                                    job.id
                                );
                            }
                        }
                        attempt_id = match self.store.start_attempt(job.id).await {
                            Ok(id) => Some(id),
                            Err(e) => {
                                tracing::warn!(
                                    "failed to open attempt record for job #{}: {e:#}",
                                    job.id
                                );
                                None
                            }
                        };
                        window = REDUCED_WINDOW;
                    }
                    Disposition::Transient => {
                        self.fail_transient(
                            &job,
                            attempt_id,
                            attempt_status(&err),
                            &format!("model call failed ({}): {}", err.code, err.message),
                        )
                        .await;
                        return;
                    }
                    Disposition::Permanent => {
                        self.fail_permanent(
                            &job,
                            attempt_id,
                            &format!("{}: {}", err.code, err.message),
                        )
                        .await;
                        return;
                    }
                },
            }
        };

        self.complete_job(&job, attempt_id, &turn, outcome, started)
            .await;
    }

    /// One model round: build context, typing indicator on, guarded call,
    /// typing indicator off (always, including on failure).
    async fn model_round(
        &self,
        job: &Job,
        window: usize,
        phone: &str,
    ) -> Result<ChatOutcome, RoundFailure> {
        let context = self
            .context
            .build(&job.user_id, &job.session_tok, &job.message_id, window)
            .await
            .map_err(RoundFailure::ContextBuild)?;

        if let Err(e) = self
            .chat
            .set_typing(&job.session_tok, phone, TypingState::Composing)
            .await
        {
            tracing::debug!("typing indicator start failed: {e:#}");
        }

        let result = self.guarded_model_call(&context).await;

        if let Err(e) = self
            .chat
            .set_typing(&job.session_tok, phone, TypingState::Stop)
            .await
        {
            tracing::debug!("typing indicator stop failed: {e:#}");
        }

        result.map_err(RoundFailure::Model)
    }

    async fn guarded_model_call(&self, context: &ContextData) -> Result<ChatOutcome, ModelError> {
        self.breaker
            .call(|| async {
                match tokio::time::timeout(
                    self.ai_timeout,
                    self.model
                        .ask(&context.system_prompt, &context.user_message),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::timeout()),
                }
            })
            .await
    }

    async fn complete_job(
        &self,
        job: &Job,
        attempt_id: Option<i64>,
        turn: &InboundTurn,
        outcome: ChatOutcome,
        started: Instant,
    ) {
        let reply = format_for_whatsapp(&outcome.text);

        if let Err(e) = self
            .chat
            .send_text(&job.session_tok, &turn.from_jid, &reply)
            .await
        {
            self.fail_transient(
                job,
                attempt_id,
                "error",
                &format!("failed to send reply: {e:#}"),
            )
            .await;
            return;
        }

        // Outgoing-turn persistence and history are off the correctness
        // path; the reply is already delivered.
        {
            let store = self.store.clone();
            let session = job.session_tok.clone();
            let peer = turn.from_jid.clone();
            let text = reply.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_outgoing_turn(&session, &peer, &text).await {
                    tracing::warn!("failed to save outgoing turn: {e:#}");
                }
                if let Err(e) = store.append_reply_history(&session, &peer, &text).await {
                    tracing::warn!("failed to append reply to chat history: {e:#}");
                }
            });
        }

        if let Err(e) = self
            .store
            .record_send(&job.session_tok, &turn.from_jid, &reply, "sent", None)
            .await
        {
            tracing::warn!("failed to record send log: {e:#}");
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        let output = serde_json::json!({
            "response": reply,
            "input_tokens": outcome.input_tokens,
            "output_tokens": outcome.output_tokens,
            "latency_ms": latency_ms,
        });

        if let Err(e) = self.store.complete_job(job.id, &output.to_string()).await {
            tracing::error!("failed to mark job #{} done: {e:#}", job.id);
        }
        if let Some(attempt_id) = attempt_id {
            if let Err(e) = self.store.finish_attempt(attempt_id, "ok", None).await {
                tracing::warn!("failed to finalize attempt for job #{}: {e:#}", job.id);
            }
        }

        tracing::info!(
            job_id = job.id,
            latency_ms,
            input_tokens = outcome.input_tokens,
            output_tokens = outcome.output_tokens,
            "job completed"
        );

        self.spawn_usage_log(
            job,
            outcome.input_tokens,
            outcome.output_tokens,
            latency_ms,
            "ok",
            "",
        );
    }

    // ── Failure bookkeeping ──────────────────────────────────────

    /// Transient failure: reschedule while attempts remain, otherwise
    /// promote to permanent.
    async fn fail_transient(
        &self,
        job: &Job,
        attempt_id: Option<i64>,
        status: &str,
        error_msg: &str,
    ) {
        tracing::warn!(job_id = job.id, "job failed: {error_msg}");

        if let Some(attempt_id) = attempt_id {
            if let Err(e) = self
                .store
                .finish_attempt(attempt_id, status, Some(error_msg))
                .await
            {
                tracing::warn!("failed to finalize attempt for job #{}: {e:#}", job.id);
            }
        }

        if job.attempts < MAX_ATTEMPTS {
            if let Err(e) = self.store.retry_job(job.id, error_msg, RETRY_DELAY).await {
                tracing::error!("failed to schedule retry for job #{}: {e:#}", job.id);
                return;
            }
            tracing::info!(
                job_id = job.id,
                attempt = job.attempts,
                max_attempts = MAX_ATTEMPTS,
                retry_in_secs = RETRY_DELAY.as_secs(),
                "job will retry"
            );
        } else {
            if let Err(e) = self.store.fail_job(job.id, error_msg).await {
                tracing::error!("failed to mark job #{} failed: {e:#}", job.id);
            }
            tracing::warn!(
                job_id = job.id,
                attempts = job.attempts,
                "job permanently failed after exhausting retries"
            );
            self.spawn_usage_log(job, 0, 0, 0, "error", error_msg);
        }
    }

    /// Permanent failure: terminal immediately, whatever the attempt count.
    async fn fail_permanent(&self, job: &Job, attempt_id: Option<i64>, error_msg: &str) {
        tracing::warn!(job_id = job.id, "job permanently failed: {error_msg}");

        if let Some(attempt_id) = attempt_id {
            if let Err(e) = self
                .store
                .finish_attempt(attempt_id, "error", Some(error_msg))
                .await
            {
                tracing::warn!("failed to finalize attempt for job #{}: {e:#}", job.id);
            }
        }

        if let Err(e) = self.store.fail_job(job.id, error_msg).await {
            tracing::error!("failed to mark job #{} failed: {e:#}", job.id);
        }

        self.spawn_usage_log(job, 0, 0, 0, "error", error_msg);
    }

    // ── Best-effort side tasks ───────────────────────────────────

    /// Mark earlier unread turns from this peer as read, on the chat server
    /// first and locally after. The turn being answered stays unread until
    /// the next job sweeps it up. Never blocks the job.
    fn spawn_mark_read(&self, job: &Job, turn: &InboundTurn) {
        let store = self.store.clone();
        let chat = self.chat.clone();
        let session = job.session_tok.clone();
        let peer = turn.from_jid.clone();
        let current_message_id = turn.message_id.clone();

        tokio::spawn(async move {
            let unread = match store.unread_turns(&session, &peer).await {
                Ok(unread) => unread,
                Err(e) => {
                    tracing::warn!("failed to list unread turns: {e:#}");
                    return;
                }
            };

            let ids: Vec<String> = unread
                .into_iter()
                .map(|t| t.message_id)
                .filter(|id| *id != current_message_id)
                .collect();
            if ids.is_empty() {
                return;
            }
            let phone = peer.split('@').next().unwrap_or(&peer).to_string();

            if let Err(e) = chat.mark_read(&session, &ids, &phone).await {
                tracing::warn!("chat-server mark-read failed: {e:#}");
                return;
            }
            if let Err(e) = store.mark_turns_read(&ids).await {
                tracing::warn!("local mark-read failed: {e:#}");
            }
        });
    }

    fn spawn_usage_log(
        &self,
        job: &Job,
        input_tokens: i64,
        output_tokens: i64,
        latency_ms: i64,
        status: &str,
        error_reason: &str,
    ) {
        let directory = self.directory.clone();
        let entry = UsageLog {
            user_id: job.user_id.clone(),
            session_id: job.session_tok.clone(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            latency_ms,
            status: status.to_string(),
            error_reason: error_reason.to_string(),
        };

        tokio::spawn(async move {
            if let Err(e) = directory.log_usage(&entry).await {
                tracing::warn!("usage log failed: {e:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_length_narrows_once_then_goes_permanent() {
        assert_eq!(
            classify_failure(ErrorKind::ContextLength, DEFAULT_WINDOW),
            Disposition::RetryNarrowWindow
        );
        assert_eq!(
            classify_failure(ErrorKind::ContextLength, REDUCED_WINDOW),
            Disposition::Permanent
        );
    }

    #[test]
    fn transient_kinds() {
        assert_eq!(
            classify_failure(ErrorKind::Retryable, DEFAULT_WINDOW),
            Disposition::Transient
        );
        assert_eq!(
            classify_failure(ErrorKind::BreakerOpen, DEFAULT_WINDOW),
            Disposition::Transient
        );
    }

    #[test]
    fn permanent_kinds() {
        for kind in [
            ErrorKind::Auth,
            ErrorKind::Payment,
            ErrorKind::Moderation,
            ErrorKind::Other,
        ] {
            assert_eq!(
                classify_failure(kind, DEFAULT_WINDOW),
                Disposition::Permanent,
                "{kind:?}"
            );
        }
    }

    #[test]
    fn timeout_attempts_are_labelled() {
        assert_eq!(attempt_status(&ModelError::timeout()), "timeout");
        assert_eq!(attempt_status(&ModelError::from_status(429, "busy")), "error");
        assert_eq!(attempt_status(&ModelError::from_status(408, "slow")), "timeout");
    }

    #[test]
    fn retry_policy_constants() {
        // the claim bumps attempts before processing, so a third failed run
        // (attempts = 3) must not reschedule
        assert_eq!(MAX_ATTEMPTS, 3);
        assert_eq!(RETRY_DELAY, Duration::from_secs(30));
        assert!(DEFAULT_WINDOW > REDUCED_WINDOW);
    }
}
