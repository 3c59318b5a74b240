use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use outreach_sequencer::api::{AppState, outreach_routes};
use outreach_sequencer::config::OutreachConfig;
use outreach_sequencer::mail::{ImapConnector, SmtpMailer};
use outreach_sequencer::outreach::scheduler::spawn_scheduler;
use outreach_sequencer::outreach::{DispatchEngine, MailboxReconciler};
use outreach_sequencer::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OutreachConfig::from_env().context("Invalid configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );
    tracing::info!(path = %config.db_path, "Database ready");

    // ── Engines ──────────────────────────────────────────────────────────
    let dispatch = Arc::new(
        DispatchEngine::new(Arc::clone(&db), Arc::new(SmtpMailer::new()))
            .with_retry(config.retry)
            .with_claim_lease(config.claim_lease)
            .with_default_wait_days(config.followup_wait_days),
    );
    let reconciler = Arc::new(MailboxReconciler::new(
        Arc::clone(&db),
        Arc::new(ImapConnector::new()),
    ));

    let scheduler = spawn_scheduler(&config.schedule, Arc::clone(&dispatch), Arc::clone(&reconciler));
    if scheduler.job_count() > 0 {
        tracing::info!(jobs = scheduler.job_count(), "In-process scheduler started");
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = outreach_routes(AppState {
        db,
        dispatch,
        reconciler,
        cron_secret: config.cron_secret.clone(),
        submission_secret: config.submission_secret.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Outreach server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await
        .context("Server error")?;

    tracing::info!("Shutting down");
    scheduler.shutdown().await;
    Ok(())
}
