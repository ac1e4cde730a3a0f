use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use parley_engine::{BusConfig, EngineOrchestrator, EventBus};
use parley_llm::{ProviderRegistry, ProviderSettings};
use parley_server::{AppState, ServerConfig};
use parley_store::{MemorySessionStore, SessionStore};
use parley_telemetry::TelemetryConfig;

/// Fan one prompt out to several language models and stream their answers.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "PARLEY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, env = "PORT", default_value_t = 10000)]
    port: u16,

    /// Recent events replayed to a stream subscriber that attaches late.
    #[arg(long, env = "PARLEY_REPLAY_CAPACITY", default_value_t = parley_engine::bus::DEFAULT_REPLAY_CAPACITY)]
    replay_capacity: usize,

    /// Persist warn+ log events to this SQLite file.
    #[arg(long, env = "PARLEY_LOG_DB")]
    log_db: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = parley_telemetry::init_telemetry(TelemetryConfig {
        json: args.json_logs,
        log_db_path: args.log_db.clone(),
        ..Default::default()
    });

    tracing::info!("starting parley server");

    let settings = ProviderSettings::from_env();
    let providers =
        ProviderRegistry::from_settings(&settings).context("failed to configure providers")?;

    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let bus = Arc::new(EventBus::new(BusConfig {
        replay_capacity: args.replay_capacity,
    }));
    let metrics = telemetry.metrics();
    let orchestrator = EngineOrchestrator::new(store, bus, Arc::new(providers))
        .with_metrics(Arc::clone(&metrics));

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        ..Default::default()
    };
    let addr = config.bind_addr();
    let state = AppState::new(orchestrator, metrics, config).with_logs(telemetry.logs());
    let handle = parley_server::start(state)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(port = handle.port, "parley server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
