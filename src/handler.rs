//! The handler contract shared by synchronous handlers and launchers.

use crate::context::Context;
use crate::error::LaunchError;
use serde_json::Value;

/// What a handler produced for the request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Render this value unless the response has already started.
    Value(Value),
    /// The handler wrote the response itself; nothing is rendered.
    Written,
    /// A launched task owns completion of this request.
    Detached,
    /// Pass the request to the next handler in the route's chain.
    Next,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Value(Value::String(s.into()))
    }

    /// Serialize `value` into a JSON reply.
    pub fn json<T: serde::Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Reply::Value(serde_json::to_value(value)?))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Reply::text(s)
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Reply::text(s)
    }
}

/// A link in a route's handler chain.
///
/// Launchers implement this too, so a suspendable body can sit anywhere a
/// synchronous handler can.
pub trait Handler: Send + Sync {
    fn apply(&self, ctx: &Context) -> Result<Reply, LaunchError>;
}

impl<F> Handler for F
where
    F: Fn(&Context) -> anyhow::Result<Reply> + Send + Sync,
{
    fn apply(&self, ctx: &Context) -> Result<Reply, LaunchError> {
        self(ctx).map_err(LaunchError::from_handler)
    }
}
