use anyhow::Context;
use clap::Parser;
use preview_daemon::api::{self, AppState};
use preview_daemon::config::Config;
use preview_daemon::db;
use preview_daemon::launcher::Launcher;
use preview_daemon::registry::{PortRegistry, SqliteLeaseStore};
use preview_daemon::source::{DeckSource, DirDeckSource, RestDeckSource};
use preview_daemon::Supervisor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    config.validate()?;

    let db_path = config.db_path.clone().unwrap_or_else(db::default_db_path);
    info!("Using lease database: {}", db_path.display());
    let conn = db::init_db(&db_path).context("failed to initialize lease database")?;

    let leased = db::leased_ports(&conn).unwrap_or_default();
    if !leased.is_empty() {
        warn!(
            "{} port(s) already leased by other supervisors or a previous run: {:?}",
            leased.len(),
            leased
        );
    }

    let source: Arc<dyn DeckSource> = match (&config.supabase_url, &config.supabase_key, &config.deck_source_dir) {
        (Some(url), Some(key), _) => Arc::new(RestDeckSource::new(url, key, &config.deck_table)),
        (None, _, Some(dir)) => Arc::new(DirDeckSource::new(dir)),
        _ => anyhow::bail!("no deck source configured: set SUPABASE_URL and SUPABASE_KEY, or --deck-source-dir"),
    };

    let registry = PortRegistry::new(
        Arc::new(SqliteLeaseStore::new(conn)),
        config.base_port,
        config.max_port,
    );
    let supervisor = Arc::new(Supervisor::new(
        registry,
        Launcher::new(config.launcher()),
        config.deck_dir.clone(),
        config.idle_timeout(),
    ));

    // Background reaper
    let shutdown = CancellationToken::new();
    let reaper = tokio::spawn({
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        let period = config.sweep_interval();
        async move { supervisor.run_reaper(period, shutdown).await }
    });

    let app = api::router(AppState {
        supervisor: supervisor.clone(),
        source,
        public_host: config.public_host.clone(),
    });

    info!("Listening on {}", config.listen);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = reaper.await;
    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, stopping renderers");
}
