//! Error types for the launch/suspend bridge.
//!
//! Every failure that can end a request flows through [`LaunchError`]. The
//! launcher's interceptor turns exactly one of them into exactly one
//! `send_error` on the [`Context`](crate::context::Context); the after-hook
//! sees the same value first.

use crate::ids::TaskId;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The client went away before the response was written.
    ClientDisconnect,
    /// The configured task deadline elapsed.
    Deadline,
    /// The scheduler is shutting down.
    Shutdown,
    /// Explicit cancellation through a [`TaskHandle`](crate::scheduler::TaskHandle).
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::ClientDisconnect => "client disconnected",
            CancelReason::Deadline => "deadline exceeded",
            CancelReason::Shutdown => "scheduler shutting down",
            CancelReason::Requested => "cancellation requested",
        };
        f.write_str(s)
    }
}

/// What went wrong while resolving one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionFailure {
    #[error("missing required value")]
    Missing,

    #[error("expected {expected}, got {found:?}")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("controller unavailable: {0}")]
    Provider(String),
}

/// Raised by an [`ArgumentResolver`](crate::launcher::ArgumentResolver) before
/// the controller method runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot resolve argument `{parameter}` of `{method}`: {failure}")]
pub struct ArgumentResolutionError {
    pub method: String,
    pub parameter: String,
    pub failure: ResolutionFailure,
}

impl ArgumentResolutionError {
    pub fn missing(method: &str, parameter: &str) -> Self {
        Self {
            method: method.to_string(),
            parameter: parameter.to_string(),
            failure: ResolutionFailure::Missing,
        }
    }

    pub fn mismatch(method: &str, parameter: &str, expected: &'static str, found: &str) -> Self {
        Self {
            method: method.to_string(),
            parameter: parameter.to_string(),
            failure: ResolutionFailure::TypeMismatch {
                expected,
                found: found.to_string(),
            },
        }
    }
}

/// Failure taxonomy of a launched (or synchronously completed) handler.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Raised by the handler body, before or after suspension.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    ArgumentResolution(#[from] ArgumentResolutionError),

    #[error("{task} cancelled: {reason}")]
    Cancelled { task: TaskId, reason: CancelReason },

    /// A continuation was invoked a second time. Programming error.
    #[error("continuation of {task} resumed more than once")]
    DoubleResumption { task: TaskId },

    #[error("{task} panicked: {message}")]
    Panicked { task: TaskId, message: String },

    #[error("scheduler is not running")]
    SchedulerStopped,

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("context of request {request_id} is closed")]
    ContextClosed { request_id: String },

    #[error("shutdown timed out with {outstanding} task(s) outstanding")]
    ShutdownTimedOut { outstanding: usize },
}

impl LaunchError {
    /// Wrap an error escaping a handler body.
    ///
    /// A `LaunchError` that travelled through `anyhow` (for example a
    /// cancellation re-raised at a suspension point and propagated with `?`)
    /// keeps its original kind.
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<LaunchError>() {
            Ok(launch) => launch,
            Err(other) => LaunchError::Handler(other),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, LaunchError::Cancelled { .. })
    }

    /// Stable, machine readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchError::Handler(_) => "handler_execution",
            LaunchError::ArgumentResolution(_) => "argument_resolution",
            LaunchError::Cancelled { .. } => "cancelled",
            LaunchError::DoubleResumption { .. } => "double_resumption",
            LaunchError::Panicked { .. } => "panicked",
            LaunchError::SchedulerStopped => "scheduler_stopped",
            LaunchError::Spawn { .. } => "spawn_failed",
            LaunchError::RouteNotFound { .. } => "route_not_found",
            LaunchError::ContextClosed { .. } => "context_closed",
            LaunchError::ShutdownTimedOut { .. } => "shutdown_timed_out",
        }
    }

    /// Default error-to-status mapping used by `Context::send_error`.
    pub fn status_code(&self) -> u16 {
        match self {
            LaunchError::ArgumentResolution(_) => 400,
            LaunchError::RouteNotFound { .. } => 404,
            LaunchError::Cancelled { reason, .. } => match reason {
                CancelReason::ClientDisconnect => 499,
                CancelReason::Deadline => 504,
                CancelReason::Shutdown => 503,
                CancelReason::Requested => 503,
            },
            LaunchError::SchedulerStopped | LaunchError::ShutdownTimedOut { .. } => 503,
            _ => 500,
        }
    }

    /// JSON body sent to the client for this error.
    pub fn to_body(&self, request_id: &str) -> Value {
        json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "request_id": request_id,
        })
    }
}
