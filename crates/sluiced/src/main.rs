//! Sluice node daemon
//!
//! Usage:
//!   # Standalone mode (default)
//!   sluiced
//!
//!   # Cluster mode against a MySQL coordinator
//!   sluiced --mode cluster \
//!     --node-url http://node-1:8060 \
//!     --coordinator mysql \
//!     --mysql-url mysql://sluice@db:3306/sluice
//!
//!   # From a settings file
//!   sluiced --config /etc/sluice/sluiced.yaml

use clap::Parser;
use sluiced::{Cli, Daemon, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match cli.to_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    print_banner(&settings);

    let shutdown_timeout = std::time::Duration::from_secs(settings.shutdown_timeout_secs);
    let daemon = match Daemon::new(settings).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };
    let shutdown = daemon.get_shutdown_handle();

    let daemon_handle = tokio::spawn(daemon.run());

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");
    shutdown.shutdown();

    // Background tasks get the same budget inside run(); leave room for close
    let total = shutdown_timeout + std::time::Duration::from_secs(5);
    match tokio::time::timeout(total, daemon_handle).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!("Node shut down gracefully");
        }
        Ok(Ok(Err(e))) => {
            tracing::error!("Error during shutdown: {}", e);
        }
        Ok(Err(e)) => {
            tracing::error!("Daemon task panicked: {}", e);
        }
        Err(_) => {
            tracing::warn!("Shutdown timed out after {:?}, forcing exit", total);
        }
    }

    tracing::info!("Goodbye!");
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(settings: &Settings) {
    let metadata = &settings.metadata;
    let mode = if metadata.is_cluster() {
        "cluster"
    } else {
        "standalone"
    };

    eprintln!(
        r#"
     _       _
 ___| |_   _(_) ___ ___
/ __| | | | | |/ __/ _ \
\__ \ | |_| | | (_|  __/
|___/_|\__,_|_|\___\___|

CDC Pipeline Metadata Node

  Mode:         {}
  Data Dir:     {}
"#,
        mode,
        metadata.data_dir.display(),
    );

    if metadata.is_cluster() {
        eprintln!(
            "  Node URL:     {}\n  \
             Coordinator:  {}\n  \
             Reconcile:    {:?}\n",
            metadata.node_url.as_deref().unwrap_or("-"),
            metadata.coordinator.backend,
            metadata.reconcile_interval(),
        );
    }
}
