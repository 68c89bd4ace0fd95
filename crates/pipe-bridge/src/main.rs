//! pipe-bridge
//!
//! Copies stdin into one named pipe and another named pipe into stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pipe_bridge::tracing_init::{filter_for_level, init_tracing};
use pipe_bridge::{Bridge, BridgeConfig, BridgeReport, WritePolicy};

#[derive(Parser, Debug)]
#[command(name = "pipe-bridge")]
#[command(version, about = "Relay stdin/stdout through a pair of named pipes")]
struct Args {
    /// Pipe that receives everything read from stdin (created if absent)
    pipe_in: PathBuf,

    /// Pipe whose data is written to stdout (created if absent)
    pipe_out: PathBuf,

    /// Milliseconds each poll waits before re-checking for shutdown
    #[arg(
        long,
        default_value_t = 100,
        env = "PIPE_BRIDGE_POLL_INTERVAL_MS",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    poll_interval_ms: u16,

    /// What to do with a chunk when its destination is full.
    /// `drop` discards it (lossy); `retry` holds it until there is room.
    #[arg(long, value_enum, default_value_t = WritePolicy::Drop, env = "PIPE_BRIDGE_ON_FULL")]
    on_full: WritePolicy,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "PIPE_BRIDGE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "PIPE_BRIDGE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Usage errors exit 1; --help and --version exit 0.
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(&filter_for_level(&args.log_level), args.log_json);

    let config = BridgeConfig::default()
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms.into()))
        .with_write_policy(args.on_full);

    match run(args.pipe_in, args.pipe_out, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Run the bridge on its own thread and cancel it on SIGINT/SIGTERM.
///
/// Errors are setup failures only; once the copy loop has started the
/// process exits 0 however the loop ended.
async fn run(pipe_in: PathBuf, pipe_out: PathBuf, config: BridgeConfig) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    let cancel = CancellationToken::new();
    let (done_tx, mut done_rx) = oneshot::channel();
    let loop_cancel = cancel.clone();
    std::thread::Builder::new()
        .name("pipe-bridge".into())
        .spawn(move || {
            let outcome =
                Bridge::open(&pipe_in, &pipe_out, config).map(|bridge| bridge.run(&loop_cancel));
            let _ = done_tx.send(outcome);
        })?;

    tokio::select! {
        outcome = &mut done_rx => return finish(outcome?),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    cancel.cancel();

    // The loop notices within one poll interval. Setup may still be parked in
    // the blocking open of pipe-in, which a signal does not interrupt.
    let grace = config
        .poll_interval
        .saturating_mul(2)
        .max(Duration::from_secs(1));
    match tokio::time::timeout(grace, done_rx).await {
        Ok(outcome) => finish(outcome?),
        Err(_) => {
            warn!("Still waiting for a reader on pipe-in; exiting without it");
            Ok(())
        }
    }
}

fn finish(outcome: pipe_bridge::Result<BridgeReport>) -> anyhow::Result<()> {
    let report = outcome?;
    if !report.reason.is_graceful() {
        warn!("Pipe bridge stopped after an I/O error");
    }
    Ok(())
}
