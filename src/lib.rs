//! Rate-limited, concurrency-bounded task scheduling for synthetic load generation.
//!
//! A [Scheduler] repeatedly invokes an [Action] at a target rate, never running more than a fixed
//! number of invocations at once. Lifecycle events are reported to an [Observer].

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod action;
mod error;
pub mod observer;
mod rate;
mod scheduler;

pub use action::Action;
pub use error::{Error, WaitError};
pub use observer::{NoopObserver, Observer, TracingObserver};
pub use rate::RateLimiter;
pub use scheduler::{AdmissionGate, Outstanding, Scheduler, SchedulerState, Slot, Work};
