//! Telemetry relay binary
//!
//! Reads one JSON event per line from stdin and feeds it through the
//! pipeline until stdin closes or ctrl-c arrives.

use std::sync::Arc;
use telemetry_pipeline::{
    Credentials, FileStore, IncomingEvent, PipelineConfig, PipelineError, Result,
    StaticCredentials, TelemetryClient,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing()?;

    info!("Starting telemetry relay v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Relay configuration - App: {} {}, Environment: {}, Collector: {}",
        config.app_id, config.app_version, config.environment, config.public_endpoint
    );

    let store = Arc::new(FileStore::new(config.store_dir.clone()));
    let client = TelemetryClient::initialize(config, store).await?;

    if let Some(credentials) = credentials_from_env() {
        client
            .set_credentials_provider(Arc::new(StaticCredentials::new(credentials)))
            .await;
    } else {
        warn!("TELEMETRY_CLIENT_ID not set, events will queue but not be submitted");
    }

    tokio::select! {
        result = relay_stdin(&client) => {
            if let Err(e) = result {
                error!("Reading events failed: {}", e);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| {
                PipelineError::Config(format!("Failed to wait for shutdown signal: {}", e))
            })?;
        }
    }

    info!("Shutting down telemetry relay");
    client.shutdown().await
}

fn credentials_from_env() -> Option<Credentials> {
    let client_id = std::env::var("TELEMETRY_CLIENT_ID").ok()?;
    let credentials = Credentials::anonymous(client_id);

    match std::env::var("TELEMETRY_TOKEN") {
        Ok(token) if !token.is_empty() => Some(credentials.with_token(token)),
        _ => Some(credentials),
    }
}

async fn relay_stdin(client: &TelemetryClient) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let event: IncomingEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping unreadable event line: {}", e);
                continue;
            }
        };

        match client.send(event).await {
            Ok(outcome) => debug!("Dispatched: {:?}", outcome),
            Err(e) => warn!("Event rejected: {}", e),
        }
    }

    info!("Input closed");
    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .map_err(|e| PipelineError::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    Ok(())
}
