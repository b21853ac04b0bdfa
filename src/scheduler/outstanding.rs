use std::sync::{
    atomic::{self, AtomicUsize},
    Arc,
};

use tokio::sync::Notify;

/// Counts dispatched jobs which haven't finished yet, so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct Outstanding {
    inner: Arc<Inner>,
}

/// One unit of outstanding work. The count is decremented when this is dropped.
#[derive(Debug)]
#[must_use = "the work is marked as finished as soon as it is dropped"]
pub struct Work {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new unit of outstanding work.
    pub fn enter(&self) -> Work {
        self.inner.count.fetch_add(1, atomic::Ordering::SeqCst);
        Work {
            inner: Arc::clone(&self.inner),
        }
    }

    /// The number of unfinished units of work.
    pub fn count(&self) -> usize {
        self.inner.count.load(atomic::Ordering::SeqCst)
    }

    /// Wait until there is no outstanding work.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking, so a drop in between isn't missed.
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }

            notified.await;
        }
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, atomic::Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
