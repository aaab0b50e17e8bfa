//! # Context Module
//!
//! Per-request state threaded through a route's handler chain and across
//! suspension points.
//!
//! A [`Context`] is created when a request is dispatched and is shared (it is a
//! cheap `Clone` handle) between the thread that called the router and any
//! coroutine that later resumes the handler. Its mutable parts, the attribute
//! map, the response state and the lifecycle state, each sit behind their own
//! lock, so the suspend/resume hand-off never races on them.
//!
//! ## Lifecycle
//!
//! ```text
//! Created → HandlerRunning → (Suspended ⇄ Resumed)* → HandlerCompleted
//!         → AfterHookRun → Rendered | ErrorSent → Closed
//! ```
//!
//! Once `Closed`, attributes can no longer be written. A response can be
//! committed exactly once; later `render`/`send_error` calls are logged and
//! dropped.

mod core;
mod request;

pub use core::{Attribute, Context, RequestState, CONTINUATION_KEY};
pub use request::{HeaderVec, ParamVec, Request, Response, MAX_INLINE_HEADERS, MAX_INLINE_PARAMS};
