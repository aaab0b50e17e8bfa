//! Controller-method launcher.
//!
//! Each route is bound at registration time to a [`MethodDescriptor`] (which
//! parameters the method takes and where they come from), an
//! [`ArgumentResolver`] and a plain closure that calls the method. Argument
//! resolution runs inside the launched task, ahead of the method, so a
//! resolution failure reaches the client through the same error path as a
//! failure of the method itself.

use super::outcome::launch_handler;
use crate::context::Context;
use crate::error::{ArgumentResolutionError, LaunchError, ResolutionFailure};
use crate::handler::{Handler, Reply};
use crate::runtime_config::StartPolicy;
use crate::scheduler::{Scheduler, Suspend, TaskOptions};
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where a parameter value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Path,
    Query,
    Header,
    /// A request attribute holding a `serde_json::Value` or a `String`.
    Attribute,
    /// A top-level field of the JSON body, or the whole body for an empty name.
    Body,
}

/// Target type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Json,
}

impl ParamKind {
    fn expected(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Json => "json",
        }
    }
}

/// One formal parameter of a controller method.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub source: ParamSource,
    pub kind: ParamKind,
    pub required: bool,
    /// Used when the value is absent. A parameter with a default is never
    /// reported missing.
    pub default: Option<Value>,
}

impl ParamSpec {
    fn new(name: &str, source: ParamSource, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            source,
            kind,
            required: true,
            default: None,
        }
    }

    pub fn path(name: &str, kind: ParamKind) -> Self {
        Self::new(name, ParamSource::Path, kind)
    }

    pub fn query(name: &str, kind: ParamKind) -> Self {
        Self::new(name, ParamSource::Query, kind)
    }

    pub fn header(name: &str, kind: ParamKind) -> Self {
        Self::new(name, ParamSource::Header, kind)
    }

    pub fn attribute(name: &str, kind: ParamKind) -> Self {
        Self::new(name, ParamSource::Attribute, kind)
    }

    pub fn body(name: &str, kind: ParamKind) -> Self {
        Self::new(name, ParamSource::Body, kind)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Registration-time description of a controller method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub controller: String,
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl MethodDescriptor {
    pub fn new(controller: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// `Controller::method`, also used as the task name.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.controller, self.name)
    }
}

/// Resolved arguments, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(Value::as_str)
    }

    pub fn i64(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(Value::as_i64)
    }

    pub fn f64(&self, index: usize) -> Option<f64> {
        self.get(index).and_then(Value::as_f64)
    }

    pub fn bool(&self, index: usize) -> Option<bool> {
        self.get(index).and_then(Value::as_bool)
    }

    /// Deserialize argument `index` into `T`.
    pub fn decode<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no argument at index {index}"))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

/// Turns a request into the argument list of a controller method.
pub trait ArgumentResolver: Send + Sync {
    fn resolve(&self, ctx: &Context, method: &MethodDescriptor)
        -> Result<Args, ArgumentResolutionError>;
}

/// Default resolver: reads each [`ParamSpec`] from its source and converts
/// it to the declared kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamResolver;

impl ParamResolver {
    fn raw(ctx: &Context, param: &ParamSpec) -> Option<Value> {
        let request = ctx.request();
        let text = |s: &str| Value::String(s.to_string());
        match param.source {
            ParamSource::Path => request.get_path_param(&param.name).map(text),
            ParamSource::Query => request.get_query_param(&param.name).map(text),
            ParamSource::Header => request.get_header(&param.name).map(text),
            ParamSource::Attribute => ctx
                .attribute::<Value>(&param.name)
                .map(|v| (*v).clone())
                .or_else(|| ctx.attribute::<String>(&param.name).map(|s| text(s.as_str()))),
            ParamSource::Body => {
                let body = request.body.as_ref()?;
                if param.name.is_empty() {
                    Some(body.clone())
                } else {
                    body.get(&param.name).cloned()
                }
            }
        }
    }

    /// Convert `value` to `kind`. Strings are parsed, other JSON values must
    /// already have the right type.
    fn coerce(value: Value, kind: ParamKind) -> Result<Value, Value> {
        match (kind, value) {
            (ParamKind::Json, value) => Ok(value),
            (ParamKind::String, Value::String(s)) => Ok(Value::String(s)),
            (ParamKind::String, value @ (Value::Number(_) | Value::Bool(_))) => {
                Ok(Value::String(value.to_string()))
            }
            (ParamKind::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(n) => Ok(Value::from(n)),
                Err(_) => Err(Value::String(s)),
            },
            (ParamKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(Value::Number(n))
            }
            (ParamKind::Number, Value::String(s)) => {
                match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                    Some(n) => Ok(Value::Number(n)),
                    None => Err(Value::String(s)),
                }
            }
            (ParamKind::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (ParamKind::Boolean, Value::String(s)) => match s.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(Value::String(s)),
            },
            (ParamKind::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (_, other) => Err(other),
        }
    }
}

impl ArgumentResolver for ParamResolver {
    fn resolve(
        &self,
        ctx: &Context,
        method: &MethodDescriptor,
    ) -> Result<Args, ArgumentResolutionError> {
        let qualified = method.qualified_name();
        let mut values = Vec::with_capacity(method.params.len());
        for param in &method.params {
            let value = match (Self::raw(ctx, param), &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => default.clone(),
                (None, None) if param.required => {
                    return Err(ArgumentResolutionError::missing(&qualified, &param.name));
                }
                (None, None) => {
                    values.push(Value::Null);
                    continue;
                }
            };
            let converted = Self::coerce(value, param.kind).map_err(|found| {
                let found = match found {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                ArgumentResolutionError::mismatch(
                    &qualified,
                    &param.name,
                    param.kind.expected(),
                    &found,
                )
            })?;
            values.push(converted);
        }
        Ok(Args(values))
    }
}

/// Supplies the controller instance for a request.
pub trait Provider<C>: Send + Sync {
    fn provide(&self, ctx: &Context) -> anyhow::Result<Arc<C>>;
}

impl<C, F> Provider<C> for F
where
    F: Fn(&Context) -> anyhow::Result<Arc<C>> + Send + Sync,
{
    fn provide(&self, ctx: &Context) -> anyhow::Result<Arc<C>> {
        self(ctx)
    }
}

/// Provider handing out one shared instance.
#[derive(Debug)]
pub struct Singleton<C>(Arc<C>);

impl<C> Singleton<C> {
    pub fn new(instance: C) -> Self {
        Self(Arc::new(instance))
    }
}

impl<C: Send + Sync> Provider<C> for Singleton<C> {
    fn provide(&self, _ctx: &Context) -> anyhow::Result<Arc<C>> {
        Ok(self.0.clone())
    }
}

type Invoke<C> = dyn Fn(&C, Args, &Context, &Suspend) -> anyhow::Result<Reply> + Send + Sync;

/// Launcher for a controller method described by a [`MethodDescriptor`].
pub struct MvcLauncher<C> {
    scheduler: Scheduler,
    provider: Arc<dyn Provider<C>>,
    method: Arc<MethodDescriptor>,
    resolver: Arc<dyn ArgumentResolver>,
    invoke: Arc<Invoke<C>>,
    policy: Option<StartPolicy>,
    deadline: Option<Duration>,
}

impl<C: Send + Sync + 'static> MvcLauncher<C> {
    pub fn new<P, I>(scheduler: Scheduler, provider: P, method: MethodDescriptor, invoke: I) -> Self
    where
        P: Provider<C> + 'static,
        I: Fn(&C, Args, &Context, &Suspend) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        Self {
            scheduler,
            provider: Arc::new(provider),
            method: Arc::new(method),
            resolver: Arc::new(ParamResolver),
            invoke: Arc::new(invoke),
            policy: None,
            deadline: None,
        }
    }

    /// Replace the default [`ParamResolver`].
    pub fn resolver(mut self, resolver: impl ArgumentResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn policy(mut self, policy: StartPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }
}

impl<C: Send + Sync + 'static> Handler for MvcLauncher<C> {
    fn apply(&self, ctx: &Context) -> Result<Reply, LaunchError> {
        let name = self.method.qualified_name();
        let mut options = TaskOptions::named(name.clone());
        if let Some(policy) = self.policy {
            options = options.policy(policy);
        }
        if let Some(deadline) = self.deadline {
            options = options.deadline(deadline);
        }

        let provider = self.provider.clone();
        let method = self.method.clone();
        let resolver = self.resolver.clone();
        let invoke = self.invoke.clone();
        launch_handler(&self.scheduler, ctx, options, move |ctx, suspend| {
            let controller = provider.provide(ctx).map_err(|err| ArgumentResolutionError {
                method: name.clone(),
                parameter: "self".to_string(),
                failure: ResolutionFailure::Provider(format!("{err:#}")),
            })?;
            let args = resolver.resolve(ctx, &method)?;
            debug!(
                request_id = %ctx.request_id(),
                method = %name,
                arg_count = args.len(),
                "Arguments resolved"
            );
            suspend.checkpoint()?;
            invoke(&*controller, args, ctx, suspend).map_err(LaunchError::from_handler)
        })
    }
}

impl<C> fmt::Debug for MvcLauncher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvcLauncher")
            .field("method", &self.method.qualified_name())
            .field("policy", &self.policy)
            .finish()
    }
}
