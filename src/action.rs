//! The work performed on each dispatch.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// An action invoked once per dispatch, e.g. a request against the system under load.
///
/// Up to the scheduler's maximum concurrency invocations may run at the same time. Errors are
/// reported to the [Observer](crate::Observer) and never stop the scheduler.
#[async_trait]
pub trait Action: Send + Sync {
    /// The error produced by a failed invocation.
    type Error: Send + Sync + 'static;

    /// Perform the action once.
    ///
    /// `cancel` is the token the scheduler was run with.
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), Self::Error>;
}

/// An [Action] which calls a closure. See [from_fn].
#[derive(Clone)]
pub struct FnAction<F> {
    f: F,
}

/// Create an [Action] from a closure returning a future.
///
/// ```
/// use std::convert::Infallible;
///
/// let action = loadgen::action::from_fn(|_cancel| async { Ok::<_, Infallible>(()) });
/// # let _ = action;
/// ```
pub fn from_fn<F, Fut, E>(f: F) -> FnAction<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Send + Sync + 'static,
{
    FnAction { f }
}

#[async_trait]
impl<F, Fut, E> Action for FnAction<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Send + Sync + 'static,
{
    type Error = E;

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), E> {
        (self.f)(cancel.clone()).await
    }
}

#[async_trait]
impl<A> Action for Arc<A>
where
    A: Action + ?Sized,
{
    type Error = A::Error;

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), Self::Error> {
        (**self).execute(cancel).await
    }
}
