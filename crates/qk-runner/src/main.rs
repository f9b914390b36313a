//! # qk-runner
//!
//! Main entry point for the QUIK terminal bridge.
//!
//! Loads a JSON configuration file, starts the dual-channel connection and
//! the listener dispatch task (readiness machine plus candle storage), waits
//! until the terminal reports itself connected to the trading server, then
//! runs a short demo request sequence and brings the configured candle
//! series up. Runs until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! qk-runner config.json --log-level info
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{error, info, warn};

use qk_core::config::StatusConfig;
use qk_core::listener::{QuikListener, run_listeners};
use qk_core::{LinkState, PendingReply, QuikConnect, QuikError, ServerConnectionStatus, StatusHandle, decoder};
use qk_md::CandlesStorage;

/// QUIK Terminal Bridge Runner.
#[derive(Parser)]
#[command(name = "qk-runner", about = "QUIK Terminal Bridge Runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Initialize logging
    qk_core::logging::init_logging(&cli.log_level, cli.log_dir.as_deref(), "qk-runner");

    info!("qk-runner starting — config={}, log_level={}", cli.config.display(), cli.log_level,);

    // 2. Load configuration
    let config = qk_core::config::load_config(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    let status_config = config.status.clone().unwrap_or_default();
    info!(
        "config loaded — terminal at {}:{}/{}",
        config.connect.host, config.connect.port_mn, config.connect.port_cb,
    );

    // 3. Wire the connection, the readiness machine, and the candle storage
    let (connect, events) = QuikConnect::new(config.connect.clone());
    let connect = Arc::new(connect);
    let (status, status_handle) =
        ServerConnectionStatus::new(Arc::clone(&connect), status_config.clone());

    let mut listeners: Vec<Box<dyn QuikListener>> = vec![Box::new(status)];
    let storage = match config.candles.as_deref() {
        Some(entries) if !entries.is_empty() => {
            let storage = CandlesStorage::from_entries(
                Arc::clone(&connect),
                status_config.response_timeout(),
                entries,
            )?;
            info!("candle storage configured — keys: {:?}", storage.keys());
            listeners.push(Box::new(storage.clone()));
            Some(storage)
        }
        _ => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch = tokio::spawn(run_listeners(
        events,
        listeners,
        shutdown_rx,
        Duration::from_millis(10),
    ));
    connect.start().await;

    // 4. Run the session until the shutdown signal arrives
    let session = tokio::spawn(run_session(
        Arc::clone(&connect),
        status_handle,
        status_config,
        storage.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    session.abort();

    // 5. Stop everything gracefully
    if let Some(storage) = &storage {
        if connect.state() == LinkState::Open {
            if let Err(e) = storage.unsubscribe_on_candle().await {
                warn!("could not unsubscribe from OnCandle: {e}");
            }
        }
    }
    connect.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = dispatch.await;

    info!("qk-runner stopped — goodbye");
    Ok(())
}

/// Waits for readiness, runs the demo sequence, brings the candles up.
async fn run_session(
    connect: Arc<QuikConnect>,
    status: StatusHandle,
    status_config: StatusConfig,
    storage: Option<CandlesStorage>,
) {
    info!("waiting for the terminal to be ready for trading");
    let mut last_report = Instant::now();
    while !status.is_ready() {
        if last_report.elapsed() >= Duration::from_secs(10) {
            info!("still waiting — link state: {:?}", connect.state());
            last_report = Instant::now();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    info!("terminal ready for trading (connected since {:?})", status.connected_since());

    demo_requests(&connect).await;

    if let Some(storage) = storage {
        if let Err(e) = bring_up_candles(&storage, &status_config).await {
            error!("candle bring-up failed: {e:#}");
        }
    }
}

/// The original connector's smoke sequence: a handful of chunk and function
/// requests, including ones the terminal is expected to reject.
async fn demo_requests(connect: &QuikConnect) {
    let t = Duration::from_secs(1);
    demo("MN message()", connect.eval_mn(r#"message("Hello, QLua-world!", 2)"#, t)).await;
    demo("CB os.sysdate chunk", connect.eval_cb("return os.sysdate()", t)).await;
    demo("MN os.sysdate", connect.call_mn("os.sysdate", Value::Null, t)).await;
    demo("CB os.sysdate", connect.call_cb("os.sysdate", json!([]), t)).await;
    demo("MN isConnected", connect.call_mn("isConnected", Value::Null, t)).await;
    demo("MN math.max", connect.call_mn("math.max", json!([1, 3, 5, 7]), t)).await;
    demo("MN message", connect.call_mn("message", json!(["Hi, there!", 1]), t)).await;
    // These two are rejected by the terminal; the errors are the point.
    demo("MN broken chunk", connect.eval_mn("return string(((", t)).await;
    demo("MN bad args", connect.call_mn("math.max", json!(["ABC", 15]), t)).await;
}

/// Issues one demo request and logs its outcome with the round-trip latency.
async fn demo(label: &str, issue: impl Future<Output = Result<PendingReply, QuikError>>) {
    let started = Instant::now();
    let outcome = match issue.await {
        Ok(reply) => reply.recv().await,
        Err(e) => Err(e),
    };
    let elapsed = started.elapsed();
    match outcome {
        Ok(frame) => match decoder::result(&frame) {
            Ok(result) => info!("{label}: {result} ({elapsed:.1?})"),
            Err(e) => warn!("{label}: {e} ({elapsed:.1?})"),
        },
        Err(e) => warn!("{label}: {e} ({elapsed:.1?})"),
    }
}

/// Data-source bring-up: init, wait for candles to exist, subscribe to
/// pushes, then one full refresh. After this the OnCandle pushes keep the
/// forming candles current.
async fn bring_up_candles(storage: &CandlesStorage, config: &StatusConfig) -> Result<()> {
    let outcomes = storage.init_data_sources().await?;
    for (key, outcome) in &outcomes {
        info!("initDataSource {key}: {outcome}");
    }

    loop {
        let sizes = storage.data_source_sizes().await?;
        if sizes.values().all(|&size| size > 0) {
            break;
        }
        info!("waiting for data sources to fill: {sizes:?}");
        tokio::time::sleep(config.check_connected_period()).await;
    }

    storage.subscribe_on_candle().await?;
    storage.refresh_all().await?;
    for key in storage.keys() {
        let len = storage.with_series(&key, qk_md::CandleSeries::len).unwrap_or(0);
        info!("{key}: {len} candles loaded");
    }
    Ok(())
}
