use thiserror::Error;

/// Why a blocking wait on the [AdmissionGate](crate::AdmissionGate) or the
/// [RateLimiter](crate::RateLimiter) gave up.
///
/// The rate limiter only ever gives up when cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The cancellation token fired before the wait completed.
    #[error("cancelled while waiting")]
    Cancelled,
    /// The admission gate was closed underneath the waiter.
    #[error("admission gate closed")]
    Closed,
}

/// Errors returned by the [Scheduler](crate::Scheduler).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The scheduler was cancelled and all dispatched work has finished.
    #[error("scheduler cancelled")]
    Cancelled,

    /// Waiting for an admission slot failed.
    ///
    /// Outstanding work is not drained before this is returned.
    #[error("acquire admission slot")]
    Acquire(#[source] WaitError),

    /// [Scheduler::run](crate::Scheduler::run) has already been called.
    #[error("scheduler has already been run")]
    AlreadyRun,

    /// The scheduler was given an unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl Error {
    /// Whether this is the orderly shutdown result, rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
