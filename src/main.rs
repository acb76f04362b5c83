use std::sync::Arc;
use std::sync::atomic::Ordering;

use courtbook::config::{ImapConfig, PollerConfig};
use courtbook::executor::{BookingExecutor, LogExecutor, ProcessExecutor};
use courtbook::mail::ImapStore;
use courtbook::poller::{CommandPoller, spawn_poller};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Tracing to stderr plus an append-only status log file
    let log_dir = std::env::var("COURTBOOK_LOG_DIR").unwrap_or_else(|_| ".".to_string());
    let file_appender = tracing_appender::rolling::never(&log_dir, "courtbook.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let imap_config = ImapConfig::from_env()?;
    let poller_config = PollerConfig::from_env()?;

    eprintln!("courtbook v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   IMAP: {}:{} ({})",
        imap_config.host, imap_config.port, imap_config.folder
    );
    eprintln!(
        "   Polling every {}s, freshness window {}s",
        poller_config.poll_interval_secs, poller_config.freshness_secs
    );

    let executor: Arc<dyn BookingExecutor> = match std::env::var("COURTBOOK_EXECUTOR_CMD") {
        Ok(cmd) => {
            eprintln!("   Executor: {cmd}");
            Arc::new(ProcessExecutor::new(cmd))
        }
        Err(_) => {
            eprintln!("   Executor: log only (set COURTBOOK_EXECUTOR_CMD to book for real)");
            Arc::new(LogExecutor)
        }
    };

    let store = Arc::new(ImapStore::new(imap_config));
    let poller = Arc::new(CommandPoller::new(poller_config, store, executor));

    let (mut handle, shutdown) = spawn_poller(poller);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, stopping poller");
            shutdown.store(true, Ordering::Relaxed);
        }
        _ = &mut handle => {
            anyhow::bail!("command poller exited after repeated failures");
        }
    }

    let _ = handle.await;
    Ok(())
}
