//! # corouter
//!
//! **corouter** lets request handlers suspend without holding a thread. It sits
//! between a synchronous, chain-of-handlers router and the `may` coroutine
//! runtime: a handler body can wait on a timer, a callback-style client or
//! another task, and the request still completes exactly once.
//!
//! ## Architecture
//!
//! - **[`router`]** - Routes (pattern, handler chain, after-hook) and dispatch
//! - **[`handler`]** - The `Handler` contract and the `Reply` a handler returns
//! - **[`launcher`]** - Bridges suspendable bodies (plain or controller-method) into the chain
//! - **[`scheduler`]** - Task launch, continuations, cancellation, deadlines and shutdown
//! - **[`context`]** - Per-request state shared across suspension points
//! - **[`error`]** - The failure taxonomy and its mapping to error responses
//! - **[`runtime_config`]** - Scheduler settings from YAML and `COROUTER_*` variables
//! - **[`telemetry`]** - `tracing` subscriber setup
//!
//! ## Request flow
//!
//! ```text
//! dispatch(request)
//!   └─ handler chain ── Launcher::apply ── Scheduler::launch ──┐
//!        (returns once the body first suspends)                │
//!                                              task body ◄─────┘
//!                                                │ suspend.await_with / delay
//!                                                │ ... resumed on any worker ...
//!                                                ▼
//!                               after-hook(ctx, outcome)
//!                                                ▼
//!                               render(value) | send_error(err)
//! ```
//!
//! Each request ends in exactly one response. A second resumption of a
//! continuation is rejected and logged, a cancelled task unwinds with a
//! cancellation error, and a panic becomes an error response.
//!
//! ## Example
//!
//! ```rust,ignore
//! use corouter::{Reply, Request, Router, RuntimeConfig};
//! use std::time::Duration;
//!
//! let mut router = Router::with_config(RuntimeConfig::from_env());
//! let delay = router.suspend(|ctx, suspend| {
//!     suspend.delay(Duration::from_millis(100))?;
//!     Ok(Reply::text(ctx.request().path.clone()))
//! });
//! router.get("/delay", delay);
//! router.start();
//!
//! let ctx = router.dispatch(Request::get("/delay"));
//! let res = ctx.wait_response(Duration::from_secs(1));
//! ```

pub mod cli;
pub mod context;
pub mod error;
pub mod handler;
mod ids;
pub mod launcher;
pub mod router;
pub mod runtime_config;
pub mod scheduler;
pub mod telemetry;

pub use context::{Context, Request, RequestState, Response};
pub use error::{ArgumentResolutionError, CancelReason, LaunchError};
pub use handler::{Handler, Reply};
pub use ids::{RequestId, TaskId};
pub use launcher::{Launcher, MvcLauncher, Outcome};
pub use router::{Route, Router};
pub use runtime_config::{RuntimeConfig, StartPolicy};
pub use scheduler::{Continuation, Scheduler, Suspend, TaskHandle};
