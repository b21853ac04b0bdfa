// Command-line load generator, driving a counting action.

use std::{
    convert::Infallible,
    future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use loadgen::{Action, Scheduler, TracingObserver};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoke an action at a fixed rate, with bounded concurrency, until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Desired operations per second
    #[arg(long, default_value_t = 1.0)]
    qps: f64,

    /// Maximum number of concurrent invocations
    #[arg(long, default_value_t = 1)]
    max_workers: usize,

    /// Simulated latency of each invocation, e.g. "50ms"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    latency: Duration,

    /// Stop after this long instead of waiting for a signal, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Log as JSON instead of human-readable text
    #[arg(long)]
    json: bool,
}

/// Counts its invocations.
#[derive(Debug)]
struct Counter {
    called: AtomicU64,
    latency: Duration,
}

impl Counter {
    fn new(latency: Duration) -> Self {
        Self {
            called: AtomicU64::new(0),
            latency,
        }
    }

    fn called(&self) -> u64 {
        self.called.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Action for Counter {
    type Error = Infallible;

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), Infallible> {
        self.called.fetch_add(1, Ordering::AcqRel);

        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = time::sleep(self.latency) => {}
            }
        }

        Ok(())
    }
}

/// Configures structured logging to stderr.
fn configure_logger(json: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Resolves with the name of the first termination signal received.
async fn termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            },
            Err(err) => {
                warn!(
                    component = "main",
                    event = "signal_handler_failed",
                    error = %err,
                    "failed to listen for SIGTERM"
                );
                ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            component = "main",
            event = "signal_handler_failed",
            error = %err,
            "failed to listen for SIGINT"
        );
        future::pending::<()>().await;
    }
    "SIGINT"
}

/// Cancels `cancel` on a termination signal, or once `duration` has elapsed.
async fn cancel_on_shutdown(cancel: CancellationToken, duration: Option<Duration>) {
    let deadline = async {
        match duration {
            Some(duration) => time::sleep(duration).await,
            None => future::pending().await,
        }
    };

    tokio::select! {
        signal = termination_signal() => debug!(
            component = "main",
            event = "os_signal",
            signal,
            "cancellation signal received, shutting down scheduler"
        ),
        _ = deadline => debug!(
            component = "main",
            event = "deadline",
            duration = ?duration,
            "run duration elapsed, shutting down scheduler"
        ),
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}

/// The average rate of `count` events over `elapsed`.
// Counts stay far below 2^53, the largest integer an f64 holds exactly.
#[allow(clippy::cast_precision_loss)]
fn per_second(count: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        0.0
    } else {
        count as f64 / elapsed.as_secs_f64()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    configure_logger(args.json);

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let counter = Arc::new(Counter::new(args.latency));
    let observer = Arc::new(TracingObserver::new());

    let scheduler = Scheduler::new(Arc::clone(&counter), args.qps, args.max_workers)
        .context("invalid scheduler configuration")?
        .with_observer(Arc::clone(&observer));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone(), args.duration));

    let start = Instant::now();
    let result = scheduler.run(&cancel).await;
    let elapsed = start.elapsed();

    let called = counter.called();
    let achieved_qps = per_second(called, elapsed);
    info!(
        component = "main",
        event = "terminated",
        called,
        executed = observer.executions(),
        failed = observer.failures(),
        elapsed = ?elapsed,
        achieved_qps,
        "terminated"
    );

    match result {
        Err(err) if !err.is_cancelled() => {
            warn!(
                component = "main",
                event = "run_failed",
                error = %err,
                "scheduler.run"
            );
            Err(err).context("scheduler stopped unexpectedly")
        }
        _ => Ok(()),
    }
}
