use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod listener;
mod sink;
mod state;

use config::{CliArgs, Config};
use listener::{Listener, ListenerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging. Records go to stdout, so logs stay on stderr.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let shutdown = CancellationToken::new();

    // ── Signal handler ────────────────────────────────────────────────
    let signal_token = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, draining...");
        signal_token.cancel();
    })?;

    // ── State & Listener ──────────────────────────────────────────────
    let collector = Arc::new(state::CollectorState::new());
    let listener = Listener::bind(
        &config.listen,
        ListenerOptions::from(&config),
        collector.clone(),
    )
    .await?;

    // ── Channel & Sink ────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel::<String>(config.channel_capacity);
    let output = config.output;
    let sink_task = tokio::spawn(async move { sink::run(rx, output).await });

    // ── Exporter Cleanup Task ─────────────────────────────────────────
    let collector_cleanup = collector.clone();
    let exporter_timeout = config.exporter_timeout;
    let cleanup_token = shutdown.clone();
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cleanup_token.cancelled() => break,
                _ = cleanup_interval.tick() => {
                    let removed = collector_cleanup
                        .cleanup_stale_exporters(Duration::from_secs(exporter_timeout));
                    if removed > 0 {
                        tracing::debug!("forgot {} silent exporters", removed);
                    }
                }
            }
        }
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    let api_task = if config.disable_api {
        None
    } else {
        let app_state = Arc::new(api::AppState {
            collector: collector.clone(),
            start_time: std::time::Instant::now(),
        });
        let app = api::router(app_state, &config.allowed_ips);

        let http = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
        tracing::info!("API running on http://0.0.0.0:{}", config.port);
        let api_token = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(
                http,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(api_token.cancelled_owned())
            .await
        }))
    };

    // ── Serve until cancelled ─────────────────────────────────────────
    tracing::info!(
        "Forwarding NetFlow v5 records from udp://{} ({:?} to {:?})",
        listener.local_addr(),
        config.output_format,
        config.output
    );
    listener.serve(tx, shutdown.clone()).await;
    shutdown.cancel();

    // The listener dropped its sender, so the sink ends once the channel is drained.
    match sink_task.await {
        Ok(Ok(written)) => tracing::info!("sink finished after {} records", written),
        Ok(Err(e)) => tracing::error!("sink failed: {}", e),
        Err(e) => tracing::error!("sink task panicked: {}", e),
    }

    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("API server error: {}", e),
            Err(e) => tracing::error!("API task panicked: {}", e),
        }
    }

    Ok(())
}
