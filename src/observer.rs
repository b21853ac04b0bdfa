//! Lifecycle notifications from the scheduler.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Receives lifecycle events from a [Scheduler](crate::Scheduler).
///
/// Observers are notification-only: they can't influence scheduling. Every method defaults to
/// doing nothing.
///
/// Each dispatched job ends with exactly one call to either `executed` or `panicked`. These are
/// called from the job itself, concurrently with other jobs. A job's admission slot isn't released
/// until its notification returns, so slow observers reduce throughput.
#[async_trait]
pub trait Observer<E>: Send + Sync
where
    E: Send + Sync + 'static,
{
    /// Called once, before the first dispatch.
    async fn started(&self, _cancel: &CancellationToken) {}

    /// Called once for each finished job, with the result of the
    /// [Action](crate::Action).
    async fn executed(&self, _cancel: &CancellationToken, _outcome: &Result<(), E>) {}

    /// Called instead of `executed` when the [Action](crate::Action) panics, with the panic
    /// message.
    async fn panicked(&self, _cancel: &CancellationToken, _message: &str) {}
}

/// An [Observer] which does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<E> Observer<E> for NoopObserver where E: Send + Sync + 'static {}

/// An [Observer] which logs events using `tracing`, keeping a count of executions.
///
/// The scheduler logs its own start at info, so `started` is only logged at debug here.
#[derive(Debug, Default)]
pub struct TracingObserver {
    executed: AtomicU64,
    failed: AtomicU64,
}

impl TracingObserver {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs which have finished, successfully or not.
    pub fn executions(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    /// Jobs which have finished with an error or a panic.
    pub fn failures(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<E> Observer<E> for TracingObserver
where
    E: fmt::Display + Send + Sync + 'static,
{
    async fn started(&self, _cancel: &CancellationToken) {
        debug!(component = "observer", event = "started", "observed scheduler start");
    }

    async fn executed(&self, _cancel: &CancellationToken, outcome: &Result<(), E>) {
        let executed = self.executed.fetch_add(1, Ordering::AcqRel) + 1;

        match outcome {
            Ok(()) => debug!(
                component = "scheduler",
                event = "executed",
                executed,
                "executed"
            ),
            Err(error) => {
                let failed = self.failed.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    component = "scheduler",
                    event = "execute_failed",
                    executed,
                    failed,
                    %error,
                    "execution failed"
                );
            }
        }
    }

    async fn panicked(&self, _cancel: &CancellationToken, message: &str) {
        let executed = self.executed.fetch_add(1, Ordering::AcqRel) + 1;
        let failed = self.failed.fetch_add(1, Ordering::AcqRel) + 1;

        error!(
            component = "scheduler",
            event = "execute_panicked",
            executed,
            failed,
            panic = message,
            "action panicked"
        );
    }
}
