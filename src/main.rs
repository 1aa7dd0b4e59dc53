//! Sentinel entrypoint: runs the processing loop and the query API, or loads
//! a sensor log into the local SQLite store.

use clap::{Parser, Subcommand};
use sentinel_pipeline::{
    api::{self, AppState},
    config::{SentinelConfig, StoreBackend},
    enrichment::{CachedGeoResolver, CidrGeoTable, Enricher},
    events::ingest_lines,
    logging::StructuredLogger,
    pipeline::{self, ProcessingLoop, Processor},
    risk::RiskScorer,
    storage::Backend,
};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "sentinel", version, about = "Honeypot threat-event pipeline")]
struct Cli {
    /// JSON config file (defaults to $SENTINEL_CONFIG_PATH, then sentinel.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the processing loop and the query API (default)
    Run,
    /// Load a Cowrie JSON-lines log into the SQLite raw event table
    Ingest {
        path: PathBuf,
    },
}

fn load_config(flag: Option<PathBuf>) -> Result<SentinelConfig, BoxError> {
    let path = flag
        .or_else(|| std::env::var("SENTINEL_CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("sentinel.json"));
    let mut config = SentinelConfig::load(&path)?;
    config.apply_env()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    if let Err(e) = StructuredLogger::init(&config.log) {
        eprintln!("logging already initialised: {e}");
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Ingest { path } => ingest(&config, &path),
    }
}

fn ingest(config: &SentinelConfig, path: &std::path::Path) -> Result<(), BoxError> {
    if config.store.backend != StoreBackend::Sqlite {
        return Err("ingest only writes to the sqlite backend".into());
    }
    let store = Backend::open(&config.store)?
        .sqlite
        .ok_or("sqlite backend did not open")?;
    let file = std::fs::File::open(path)?;
    let report = ingest_lines(BufReader::new(file), |ev| store.insert_raw(ev).map_err(BoxError::from))?;
    info!(
        path = %path.display(),
        inserted = report.inserted,
        duplicates = report.duplicates,
        rejected = report.rejected,
        "ingest complete"
    );
    println!(
        "inserted {} duplicate {} rejected {}",
        report.inserted, report.duplicates, report.rejected
    );
    Ok(())
}

async fn run(config: SentinelConfig) -> Result<(), BoxError> {
    config.validate()?;
    info!(backend = ?config.store.backend, bind = %config.api.bind_addr, "sentinel starting");

    let backend = Backend::open(&config.store)?;
    pipeline::wait_until_ready(
        backend.source.as_ref(),
        backend.store.as_ref(),
        Duration::from_secs(config.store.ready_timeout_secs),
        pipeline::READY_RETRY,
    )
    .await?;
    if let Some(es) = &backend.elastic {
        es.ensure_index().await?;
    }

    let table = CidrGeoTable::load(&config.geo)?;
    info!(networks = table.len(), "geo table loaded");
    let enricher = Enricher::new(Arc::new(CachedGeoResolver::new(table, config.geo.cache_capacity)));
    let scorer = RiskScorer::from_config(&config.risk)?;
    info!(rules = ?scorer.rule_names().collect::<Vec<_>>(), "scoring rules loaded");

    let processor = Processor::new(
        backend.source.clone(),
        backend.store.clone(),
        enricher,
        scorer,
        config.risk.clone(),
    )
    .with_batch_size(config.processor.batch_size)
    .with_timeout(config.store_timeout());
    let handle = ProcessingLoop::new(Arc::new(processor)).start(config.poll_interval());

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    let state = AppState::new(backend.store.clone(), &config.api, &config.risk)?;
    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr).await?;
    info!(addr = %config.api.bind_addr, "query API listening (Ctrl+C to stop)");
    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await;

    let stats = handle.stop().await;
    info!(cycles = stats.cycles, written = stats.written, "sentinel stopping");
    if let Err(e) = served {
        warn!(error = %e, "query API exited with error");
        return Err(e.into());
    }
    Ok(())
}
