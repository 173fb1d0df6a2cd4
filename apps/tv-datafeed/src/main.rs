//! TV Datafeed Binary
//!
//! Downloads historical bars for a list of symbols and writes them to stdout
//! as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tv-datafeed -- RELIANCE TCS INFY
//! cargo run --bin tv-datafeed            # every symbol the scanner lists for TV_EXCHANGE
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `TV_USERNAME` / `TV_PASSWORD`: account credentials (default: anonymous)
//! - `TV_EXCHANGE`: exchange label (default: NSE)
//! - `TV_INTERVAL`: interval code, e.g. 1, 15, 1H, 1D, 1W (default: 1D)
//! - `TV_BARS`: bars per symbol (default: 10)
//! - `TV_MAX_RETRIES`, `TV_RETRY_DELAY_MS`, `TV_BATCH_ROUNDS`: retry tuning
//! - `TV_SYMBOL_DELAY_MS`: pause between symbols (default: 2000)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tv_datafeed::infrastructure::metrics::{get_metrics_handle, record_symbols};
use tv_datafeed::infrastructure::telemetry;
use tv_datafeed::{
    Bar, BatchEvent, BatchRetryCoordinator, ConnectionManager, DatafeedConfig, FetchRequest,
    ScannerClient, SessionAuthenticator, SymbolFetcher, SymbolSource, WsConnector, init_metrics,
};

/// One stdout record.
#[derive(Serialize)]
struct BarLine<'a> {
    symbol: &'a str,
    #[serde(flatten)]
    bar: &'a Bar,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init();
    let _metrics_handle = init_metrics();

    let config = DatafeedConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown_token.clone()));

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let symbols = resolve_symbols(&config, &http).await?;
    if symbols.is_empty() {
        tracing::warn!(exchange = %config.request.exchange, "No symbols to fetch");
        return Ok(());
    }

    let requests = symbols
        .iter()
        .map(|symbol| {
            FetchRequest::new(
                symbol.as_str(),
                config.request.exchange.as_str(),
                config.request.interval,
                config.request.bar_count,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let token = SessionAuthenticator::new(
        http,
        config.endpoints.signin_url.as_str(),
        config.retry_policy(),
    )
    .with_cancellation(shutdown_token.clone())
    .authenticate(config.credentials.as_ref())
    .await;

    let connections = ConnectionManager::new(Arc::new(WsConnector), config.connection_settings())
        .with_cancellation(shutdown_token.clone());
    let fetcher = SymbolFetcher::new(connections, token, config.fetcher_settings())
        .with_cancellation(shutdown_token.clone());

    let coordinator = Arc::new(BatchRetryCoordinator::new(
        Arc::new(fetcher),
        config.batch_settings(),
        shutdown_token.clone(),
    ));

    tracing::info!(
        symbols = requests.len(),
        interval = config.request.interval.as_str(),
        bars = config.request.bar_count,
        "Starting batch"
    );

    let order: Vec<String> = requests.iter().map(|r| r.symbol.clone()).collect();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let handle = coordinator.spawn(requests, events_tx);

    while let Some(event) = events_rx.recv().await {
        // Log events are already mirrored to tracing by the coordinator.
        if let BatchEvent::Progress(fraction) = event {
            tracing::debug!(progress = fraction, "Batch progress");
        }
    }

    let report = handle.await.context("batch task failed")?;
    record_symbols(report.results.len(), report.failures.len());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for symbol in &order {
        let Some(series) = report.results.get(symbol) else {
            continue;
        };
        for bar in &series.bars {
            serde_json::to_writer(
                &mut out,
                &BarLine {
                    symbol: &series.symbol,
                    bar,
                },
            )?;
            writeln!(out)?;
        }
    }
    out.flush()?;

    tracing::info!(
        succeeded = report.results.len(),
        failed = report.failures.len(),
        cancelled = report.cancelled,
        "Batch finished"
    );

    if let Some(handle) = get_metrics_handle() {
        tracing::debug!(metrics = %handle.render(), "Metrics snapshot");
    }

    Ok(())
}

/// Symbols from the command line, or the scanner's list for the exchange.
async fn resolve_symbols(
    config: &DatafeedConfig,
    http: &reqwest::Client,
) -> anyhow::Result<Vec<String>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return Ok(args);
    }

    let scanner = ScannerClient::new(http.clone(), config.endpoints.scanner_url.as_str());
    let symbols = scanner
        .symbols(&config.request.exchange)
        .await
        .with_context(|| format!("failed to list symbols for {}", config.request.exchange))?;

    tracing::info!(
        exchange = %config.request.exchange,
        count = symbols.len(),
        "Loaded symbol list"
    );
    Ok(symbols)
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &DatafeedConfig) {
    tracing::info!(
        exchange = %config.request.exchange,
        authenticated = config.credentials.is_some(),
        max_retries = config.retry.max_retries,
        batch_rounds = config.batch.rounds,
        "Configuration loaded"
    );
    tracing::debug!(
        ws_url = %config.endpoints.ws_url,
        signin_url = %config.endpoints.signin_url,
        scanner_url = %config.endpoints.scanner_url,
        "Endpoints"
    );
}

/// Cancel the batch on Ctrl+C.
async fn cancel_on_ctrl_c(shutdown_token: CancellationToken) {
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Received Ctrl+C, cancelling batch"),
                Err(e) => {
                    tracing::warn!(error = %e, "Ctrl+C handler unavailable");
                    return;
                }
            }
            shutdown_token.cancel();
        }
        () = shutdown_token.cancelled() => {}
    }
}
