use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use gate::{AdmissionGate, Slot};
pub use outstanding::{Outstanding, Work};

use crate::{Action, Error, NoopObserver, Observer, RateLimiter, WaitError};

mod gate;
mod outstanding;

/// Repeatedly invokes an [Action] at a target rate, with bounded concurrency.
///
/// Each iteration of the loop:
///
/// 1. waits for a free admission slot, bounding concurrency,
/// 2. waits for a rate limiter token, bounding throughput,
/// 3. spawns a job which runs the action, notifies the [Observer] and then gives back its slot.
///
/// Jobs may finish in any order. Failed and panicking actions are reported to the observer and
/// don't stop the loop.
pub struct Scheduler<A: Action> {
    action: Arc<A>,
    observer: Arc<dyn Observer<A::Error>>,

    limiter: RateLimiter,
    gate: AdmissionGate,
    outstanding: Outstanding,

    dispatched: AtomicU64,
    running: AtomicBool,
}

/// A snapshot of the state of a [Scheduler].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerState {
    in_flight: usize,
    available: usize,
    dispatched: u64,
}

/// Resources held by a dispatched job until it finishes.
///
/// Fields drop in order: the slot is released before the work is marked as finished.
struct Job {
    _slot: Slot,
    _work: Work,
}

impl<A> Scheduler<A>
where
    A: Action + 'static,
{
    /// Create a scheduler invoking `action` `rate` times per second, with at most
    /// `max_concurrency` invocations running at once.
    pub fn new(action: A, rate: f64, max_concurrency: usize) -> Result<Self, Error> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::Config("rate must be positive and finite"));
        }
        if max_concurrency == 0 {
            return Err(Error::Config("max concurrency must be positive"));
        }
        if max_concurrency > Semaphore::MAX_PERMITS {
            return Err(Error::Config("max concurrency is too large"));
        }

        Ok(Self {
            action: Arc::new(action),
            observer: Arc::new(NoopObserver),

            limiter: RateLimiter::new(rate),
            gate: AdmissionGate::new(max_concurrency),
            outstanding: Outstanding::new(),

            dispatched: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Notify `observer` of lifecycle events. Replaces the default [NoopObserver].
    pub fn with_observer<O>(mut self, observer: Arc<O>) -> Self
    where
        O: Observer<A::Error> + 'static,
    {
        self.observer = observer;
        self
    }

    /// The target number of dispatches per second.
    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    /// The maximum number of concurrently running jobs.
    pub fn max_concurrency(&self) -> usize {
        self.gate.capacity()
    }

    /// The current state of the scheduler.
    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            in_flight: self.outstanding.count(),
            available: self.gate.available(),
            dispatched: self.dispatched.load(Ordering::Acquire),
        }
    }

    /// Run the scheduling loop until `cancel` fires.
    ///
    /// Once cancelled, no new jobs are dispatched. This waits for every dispatched job to finish,
    /// then returns [Error::Cancelled].
    ///
    /// Returns immediately with [Error::Acquire] if waiting for a slot fails for any reason other
    /// than cancellation. Jobs may still be running in that case.
    ///
    /// A scheduler can only be run once. Subsequent calls return [Error::AlreadyRun].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRun);
        }

        info!(
            component = "scheduler",
            event = "started",
            rate = self.rate(),
            max_concurrency = self.max_concurrency(),
            "scheduler started"
        );
        self.observer.started(cancel).await;

        loop {
            if cancel.is_cancelled() {
                return Err(self.drain().await);
            }

            let slot = match self.gate.acquire(cancel).await {
                Ok(slot) => slot,
                Err(WaitError::Cancelled) => return Err(self.drain().await),
                Err(err) => return Err(self.fail(Error::Acquire(err))),
            };

            // The limiter only gives up when cancelled.
            if self.limiter.wait(cancel).await.is_err() {
                drop(slot);
                return Err(self.drain().await);
            }

            self.dispatch(slot, cancel);
        }
    }

    fn dispatch(&self, slot: Slot, cancel: &CancellationToken) {
        let job = Job {
            _slot: slot,
            _work: self.outstanding.enter(),
        };
        self.dispatched.fetch_add(1, Ordering::AcqRel);

        let action = Arc::clone(&self.action);
        let observer = Arc::clone(&self.observer);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            match AssertUnwindSafe(action.execute(&cancel)).catch_unwind().await {
                Ok(outcome) => observer.executed(&cancel, &outcome).await,
                Err(panic) => {
                    let message = panic_message(panic);
                    observer.panicked(&cancel, &message).await;
                }
            }

            // Also released if the observer panics.
            drop(job);
        });
    }

    async fn drain(&self) -> Error {
        debug!(
            component = "scheduler",
            event = "draining",
            in_flight = self.outstanding.count(),
            "waiting for dispatched jobs to finish"
        );

        self.outstanding.wait_idle().await;

        debug!(
            component = "scheduler",
            event = "drained",
            dispatched = self.dispatched.load(Ordering::Acquire),
            "scheduler stopped"
        );

        Error::Cancelled
    }

    fn fail(&self, err: Error) -> Error {
        warn!(
            component = "scheduler",
            event = "wait_failed",
            in_flight = self.outstanding.count(),
            error = %err,
            "scheduler stopped without draining"
        );
        err
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast_ref::<&str>() {
            Some(message) => (*message).to_owned(),
            None => "Box<dyn Any>".to_owned(),
        },
    }
}

impl<A: Action> fmt::Debug for Scheduler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("limiter", &self.limiter)
            .field("gate", &self.gate)
            .field("outstanding", &self.outstanding)
            .field("dispatched", &self.dispatched)
            .finish_non_exhaustive()
    }
}

impl SchedulerState {
    /// The number of jobs in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
    /// The number of free admission slots.
    pub fn available(&self) -> usize {
        self.available
    }
    /// The number of jobs dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}
