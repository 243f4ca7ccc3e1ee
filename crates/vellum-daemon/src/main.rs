//! `vellum` binary entrypoint.
//!
//! Loads configuration from environment variables and runs the
//! orchestrator until SIGINT or SIGTERM.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::{Context, Result};
use tokio::sync::watch;

use vellum_core::config::EngineConfig;
use vellum_core::observability::{init_logging, LogFormat};
use vellum_daemon::App;

fn choose_log_format(config: &EngineConfig) -> LogFormat {
    if config.mock_mode {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env().context("configuration")?;
    init_logging(choose_log_format(&config), &config.log_level);

    tracing::info!(
        incoming = %config.incoming_dir.display(),
        projects = %config.projects_dir.display(),
        rate_limit_rpm = config.rate_limit_rpm,
        max_concurrency = config.max_concurrency,
        mock_mode = config.mock_mode,
        "vellum starting"
    );

    let app = App::build(config).context("engine wiring")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let sigint = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::error!(error = %e, "SIGTERM handler unavailable");
                        let _ = sigint.await;
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                };
            tokio::select! {
                _ = sigint => tracing::info!("SIGINT received"),
                _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = sigint.await;
            tracing::info!("SIGINT received");
        }
        let _ = shutdown_tx.send(true);
    });

    app.run(shutdown_rx).await.context("orchestrator run")?;
    tracing::info!("vellum stopped");
    Ok(())
}
