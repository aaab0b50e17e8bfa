//! # Router Module
//!
//! Route registration, path matching and request dispatch.
//!
//! A [`Route`] is immutable once registered: an HTTP method, a path pattern
//! with `{param}` segments, an ordered handler chain and an optional
//! after-hook. [`Router::dispatch`] matches the request, fills in path
//! parameters and runs the chain. Synchronous handlers complete the request
//! before `dispatch` returns; a launcher detaches and completes it from its
//! task. A launched handler that returns [`Reply::Next`](crate::Reply::Next)
//! hands the request to the next handler in the chain from inside its task.
//!
//! ## Example
//!
//! ```rust,ignore
//! use corouter::router::Router;
//! use corouter::runtime_config::RuntimeConfig;
//! use std::time::Duration;
//!
//! let mut router = Router::with_config(RuntimeConfig::default());
//! let delay = router.suspend(|ctx, suspend| {
//!     suspend.delay(Duration::from_millis(100))?;
//!     Ok(ctx.request().path.clone().into())
//! });
//! router.get("/delay", delay);
//! router.start();
//! ```

mod core;

pub(crate) use core::run_chain;
pub use core::{AfterHook, Route, RouteBuilder, Router};
