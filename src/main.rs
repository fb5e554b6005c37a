//! Periscope daemon entry point.
//!
//! Wires the registry, the log tailer, the stale check, and the two HTTP
//! servers together, then runs until SIGINT/SIGTERM. Both servers bind to
//! loopback only.
//!
//! ```bash
//! # Defaults: hooks on 127.0.0.1:4451, snapshot stream on 127.0.0.1:4450
//! periscope
//!
//! # Watch a different transcript tree
//! PERISCOPE_LOG_DIR=/tmp/transcripts periscope
//! ```

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use periscope::config::Config;
use periscope::registry::Registry;
use periscope::routes::{create_hook_router, AppState};
use periscope::stream::create_stream_router;
use periscope::tailer::LogTailer;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        hook_port = config.hook_port,
        stream_port = config.stream_port,
        log_dir = %config.log_dir.display(),
        data_dir = %config.data_dir.display(),
        summarizer = config.summarizer_url.is_some(),
        "Periscope starting"
    );

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "Failed to prepare data directory {}",
            config.data_dir.display()
        )
    })?;

    let registry = Registry::new(config.clone());
    let state = AppState::new(registry.clone());

    // The tailer's startup pass ingests every existing transcript, so hooks
    // arriving afterwards find their sessions already bootstrapped.
    let tailer = LogTailer::start(registry.clone())
        .await
        .context("Failed to start log tailer")?;
    info!(watch_dir = %tailer.watch_dir().display(), "watching transcripts");
    state.mark_ready();

    let stale_check = registry.spawn_stale_check();

    let hook_addr = format!("127.0.0.1:{}", config.hook_port);
    let hook_listener = TcpListener::bind(&hook_addr)
        .await
        .with_context(|| format!("Failed to bind hook listener on {hook_addr}"))?;
    let stream_addr = format!("127.0.0.1:{}", config.stream_port);
    let stream_listener = TcpListener::bind(&stream_addr)
        .await
        .with_context(|| format!("Failed to bind stream listener on {stream_addr}"))?;

    info!(hook = %hook_addr, stream = %stream_addr, "listening");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        });
    }

    let hook_server = axum::serve(hook_listener, create_hook_router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_tx.subscribe()));
    let stream_server = axum::serve(stream_listener, create_stream_router(registry.clone()))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_tx.subscribe()));

    let (hook_result, stream_result) = tokio::join!(hook_server, stream_server);
    stale_check.abort();

    if let Err(err) = &hook_result {
        error!(error = %err, "hook server error");
    }
    if let Err(err) = &stream_result {
        error!(error = %err, "stream server error");
    }
    hook_result.context("hook server failed")?;
    stream_result.context("stream server failed")?;

    info!("Periscope stopped");
    Ok(())
}

/// Initializes the logging subsystem. `RUST_LOG` overrides the default.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

async fn wait_for_shutdown(mut rx: tokio::sync::broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
