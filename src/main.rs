use anyhow::{Context, Result};
use replyq::config::{AiBackend, Config};
use replyq::credits::CreditMonitor;
use replyq::db::{self, Store};
use replyq::directory;
use replyq::gateway::{self, AppState};
use replyq::outbound::ChatServerClient;
use replyq::providers::{self, CircuitBreaker};
use replyq::worker::{WorkerPool, BREAKER_COOLDOWN, BREAKER_MAX_FAILURES};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

/// Cap on HTTP drain at shutdown. The worker drain deliberately has none:
/// in-flight jobs always reach a terminal row state.
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Logging first; respects RUST_LOG, defaults to info.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let config = Config::from_env()?;
    tracing::info!(
        mode = ?config.data_access_mode,
        port = config.port,
        "starting AI conversation dispatcher"
    );

    // ── Local store ──────────────────────────────────────────────
    let pool = db::connect(&config.database.url(), "local").await?;
    let store = Store::new(pool);
    store
        .migrate()
        .await
        .context("local schema migration failed")?;

    // ── Directory facade (API or direct DB) ──────────────────────
    let dir = directory::create_directory(&config).await?;
    if let Err(e) = dir.check_health().await {
        tracing::warn!("directory health check failed: {e:#}");
    }

    // ── Model backend behind the shared breaker ──────────────────
    let model = providers::create_model_client(&config.ai)?;
    let breaker = Arc::new(CircuitBreaker::new(
        model.provider_name(),
        BREAKER_MAX_FAILURES,
        BREAKER_COOLDOWN,
    ));

    let chat = ChatServerClient::new(
        &config.chat_gateway_url,
        config.whatsapp_server_api.as_deref(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.ai.backend == AiBackend::OpenRouter {
        if let Some(key) = &config.ai.openrouter_api_key {
            tokio::spawn(CreditMonitor::new(key).run(shutdown_rx.clone()));
        }
    }

    let workers = WorkerPool::new(
        store.clone(),
        dir.clone(),
        model,
        breaker,
        chat,
        config.ai.timeout,
    )
    .start();

    // ── HTTP ingress ─────────────────────────────────────────────
    let state = AppState {
        store,
        directory: dir,
    };
    let mut gateway_shutdown = shutdown_rx.clone();
    let mut server = tokio::spawn(gateway::run_gateway(config.port, state, async move {
        let _ = gateway_shutdown.changed().await;
    }));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = &mut server => {
            let _ = shutdown_tx.send(true);
            workers.stop().await;
            match result {
                Ok(Ok(())) => anyhow::bail!("gateway exited unexpectedly"),
                Ok(Err(e)) => return Err(e.context("gateway failed")),
                Err(e) => anyhow::bail!("gateway task panicked: {e}"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Workers first: every in-flight job reaches done/failed/pending before
    // the process returns.
    workers.stop().await;

    match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!("gateway exited with error: {e:#}"),
        Ok(Err(e)) => tracing::error!("gateway task panicked: {e}"),
        Err(_) => tracing::warn!(
            "gateway drain timed out after {}s",
            HTTP_DRAIN_TIMEOUT.as_secs()
        ),
    }

    tracing::info!("dispatcher exited cleanly");
    Ok(())
}
