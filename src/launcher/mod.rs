//! # Launcher Module
//!
//! Bridges suspendable handler bodies into the synchronous handler chain.
//!
//! A [`Launcher`] (or its controller-method sibling [`MvcLauncher`]) is a
//! [`Handler`](crate::handler::Handler): when a route reaches it, it launches
//! the body as a task on the [`Scheduler`](crate::scheduler::Scheduler) and
//! gives the calling thread back as soon as the body first suspends. Whichever
//! thread finishes the body then completes the request:
//!
//! 1. the route's after-hook observes the [`Outcome`],
//! 2. the value is rendered, unless the handler already wrote the response,
//! 3. or, on failure, the request's interceptor emits a single error response.
//!
//! Synchronous handlers go through the same completion routine, so a body
//! that never suspends is indistinguishable from a plain handler.

mod direct;
mod mvc;
mod outcome;

pub use direct::Launcher;
pub use mvc::{
    ArgumentResolver, Args, MethodDescriptor, MvcLauncher, ParamKind, ParamResolver, ParamSource,
    ParamSpec, Provider, Singleton,
};
pub(crate) use outcome::{context_interceptor, finish};
pub use outcome::Outcome;
