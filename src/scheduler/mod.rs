//! # Scheduler Module
//!
//! Runs suspendable task bodies on `may` coroutines.
//!
//! ## Overview
//!
//! - [`Scheduler::launch`] spawns a body with an [`Interceptor`] and a
//!   [`StartPolicy`](crate::runtime_config::StartPolicy)
//! - the body receives a [`Suspend`], its only way to pause: it captures a
//!   [`Continuation`] and parks the coroutine until someone completes it
//! - a parked task holds no worker thread; it resumes on whichever worker
//!   `may` picks
//! - [`TaskHandle::cancel`] resumes a parked task with a cancellation error,
//!   so the body unwinds through its normal error path
//!
//! ## Suspension
//!
//! ```rust,ignore
//! scheduler.launch(TaskOptions::named("lookup"), interceptor, |suspend| {
//!     let row: String = suspend.await_with(|continuation| {
//!         db.query_async("select ...", move |row| {
//!             let _ = continuation.resume(row);
//!         });
//!     })?;
//!     Ok(())
//! })?;
//! ```
//!
//! ## Configuration
//!
//! Worker count, stack size, default start policy and task deadline come from
//! [`RuntimeConfig`](crate::runtime_config::RuntimeConfig).

mod continuation;
mod core;
mod metrics;

pub use continuation::{Continuation, Suspend, SuspendObserver};
pub(crate) use core::panic_message;
pub use core::{Interceptor, Scheduler, TaskHandle, TaskOptions};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
