use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use stream_ingest::commands::{health, stream};
use stream_ingest::config::{open_store, parse_store, EngineSettings};
use stream_ingest::error::AppError;
use stream_ingest::state::StreamEngine;
use stream_ingest::stream::types::{EngineEvent, LogLevel, ProviderKind, StartStreamArgs};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stream-ingest")]
#[command(about = "Ingest a real-time websocket feed with metrics, dedup and persistence", long_about = None)]
struct Cli {
    /// custom, okx or binance
    #[arg(long, default_value = "binance", value_parser = parse_provider)]
    provider: ProviderKind,

    /// Feed address for the custom provider (ws:// or wss://)
    #[arg(long)]
    uri: Option<String>,

    /// Text sent once the connection opens (custom provider)
    #[arg(long)]
    subscription: Option<String>,

    #[arg(long)]
    instrument: Option<String>,

    #[arg(long)]
    channel: Option<String>,

    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// sqlite, http or none; overrides INGEST_STORE
    #[arg(long)]
    store: Option<String>,

    #[arg(long)]
    db_path: Option<String>,

    #[arg(long)]
    backend_url: Option<String>,

    /// Seconds between metric summaries
    #[arg(long, default_value_t = 5)]
    summary_interval: u64,
}

fn parse_provider(value: &str) -> Result<ProviderKind, String> {
    ProviderKind::parse_str(value).map_err(|error| error.to_string())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut settings = EngineSettings::from_env()?;
    if cli.store.is_some() || cli.db_path.is_some() || cli.backend_url.is_some() {
        let kind = cli
            .store
            .clone()
            .unwrap_or_else(|| settings.store.kind().to_string());
        settings.store = parse_store(&kind, cli.db_path.clone(), cli.backend_url.clone())?;
    }

    let store = open_store(&settings.store).await?;
    let engine = Arc::new(StreamEngine::new(store));

    let events = stream::subscribe_events(&engine);
    let printer = tokio::spawn(print_events(events));

    let session = stream::connect(
        &engine,
        Some(StartStreamArgs {
            provider: Some(cli.provider),
            uri: cli.uri,
            subscription: cli.subscription,
            instrument: cli.instrument,
            channel: cli.channel,
            max_reconnect_attempts: cli.max_reconnect_attempts.or(settings.max_reconnect_attempts),
        }),
    )
    .await?;
    info!(
        "session {} started ({} on {})",
        session.session_id,
        session.provider.as_str(),
        session.uri
    );

    let mut summary_ticker =
        tokio::time::interval(Duration::from_secs(cli.summary_interval.max(1)));
    summary_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    summary_ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    error!("failed to listen for ctrl-c: {error}");
                }
                break;
            }
            _ = summary_ticker.tick() => {
                let data = stream::current_data(&engine).await?;
                info!(
                    "{} | messages={} retained={} duplicates_removed={} throughput={}/s avg_latency={:.3}s",
                    data.status.state.as_str(),
                    data.message_count,
                    data.records.len(),
                    data.duplicates_removed,
                    data.metrics.throughput,
                    data.metrics.average_latency_s,
                );
            }
        }
    }

    let stopped = stream::disconnect(&engine).await?;
    debug!("disconnect reported stopped={}", stopped.stopped);

    let report = health::health(&engine).await?;
    info!("uptime {} ms, store {}", report.uptime_ms, report.store);

    engine.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Log(entry)) => match entry.level {
                LogLevel::Info => info!("{}", entry.text),
                LogLevel::Warn => warn!("{}", entry.text),
                LogLevel::Error => error!("{}", entry.text),
                LogLevel::Data => debug!("{}", entry.text),
            },
            Ok(EngineEvent::FormatChanged(format)) => debug!("format -> {}", format.as_str()),
            Ok(EngineEvent::Realtime(realtime)) => debug!("realtime -> {realtime}"),
            // Transitions are already mirrored as log entries.
            Ok(EngineEvent::Status(_)) => {}
            Err(RecvError::Lagged(skipped)) => debug!("event printer skipped {skipped} event(s)"),
            Err(RecvError::Closed) => break,
        }
    }
}
