use crate::context::{Context, ParamVec, Request};
use crate::error::LaunchError;
use crate::handler::{Handler, Reply};
use crate::launcher::{
    context_interceptor, finish, Args, Launcher, MethodDescriptor, MvcLauncher, Outcome, Provider,
};
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::{panic_message, Scheduler, Suspend};
use http::Method;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Route-level callback observing how the handler ended. Runs after the
/// handler completes and before the response is rendered or the error sent.
pub type AfterHook = Arc<dyn Fn(&Context, &Outcome) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(Arc<str>),
}

fn compile(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if segment.starts_with('{') && segment.ends_with('}') {
                let name = segment.trim_start_matches('{').trim_end_matches('}');
                Segment::Param(Arc::from(name))
            } else {
                Segment::Literal(segment.to_string())
            }
        })
        .collect()
}

/// An immutable route: pattern, handler chain and optional after-hook.
pub struct Route {
    method: Method,
    path_pattern: String,
    name: String,
    segments: Vec<Segment>,
    chain: Vec<Arc<dyn Handler>>,
    after: Option<AfterHook>,
}

impl Route {
    pub fn builder(method: Method, path: &str) -> RouteBuilder {
        RouteBuilder {
            method,
            path: path.to_string(),
            name: None,
            chain: Vec::new(),
            after: None,
        }
    }

    /// Placeholder route carried by contexts that matched nothing.
    pub(crate) fn not_found() -> Self {
        Route::builder(Method::GET, "/").name("not_found").build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path_pattern(&self) -> &str {
        &self.path_pattern
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn after_hook(&self) -> Option<&AfterHook> {
        self.after.as_ref()
    }

    pub fn chain(&self) -> &[Arc<dyn Handler>] {
        &self.chain
    }

    /// Path parameters if `path` matches this route's pattern.
    fn matches(&self, method: &Method, path: &str) -> Option<ParamVec> {
        if &self.method != method {
            return None;
        }
        let mut params = ParamVec::new();
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => params.push((name.clone(), decode_segment(part))),
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }
}

/// Percent-decode a path segment. Invalid UTF-8 keeps the raw text.
fn decode_segment(part: &str) -> String {
    match urlencoding::decode(part) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => part.to_string(),
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path_pattern", &self.path_pattern)
            .field("name", &self.name)
            .field("chain_len", &self.chain.len())
            .field("has_after_hook", &self.after.is_some())
            .finish()
    }
}

pub struct RouteBuilder {
    method: Method,
    path: String,
    name: Option<String>,
    chain: Vec<Arc<dyn Handler>>,
    after: Option<AfterHook>,
}

impl RouteBuilder {
    /// Route name used in logs and as the default task name.
    /// Defaults to `"{METHOD} {path}"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a handler to the chain. Handlers run in order until one
    /// returns something other than [`Reply::Next`].
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.chain.push(Arc::new(handler));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &Outcome) + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Route {
        let name = self
            .name
            .unwrap_or_else(|| format!("{} {}", self.method, self.path));
        Route {
            segments: compile(&self.path),
            method: self.method,
            path_pattern: self.path,
            name,
            chain: self.chain,
            after: self.after,
        }
    }
}

/// Route table plus the scheduler its launchers run on.
///
/// Lifecycle is explicit: [`start`](Self::start) brings the scheduler up,
/// [`stop`](Self::stop) cancels and drains whatever is still in flight.
#[derive(Clone)]
pub struct Router {
    routes: Vec<Arc<Route>>,
    scheduler: Scheduler,
    not_found: Arc<Route>,
}

impl Router {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            routes: Vec::new(),
            scheduler,
            not_found: Arc::new(Route::not_found()),
        }
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::new(Scheduler::new(config))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn add_route(&mut self, route: Route) -> &mut Self {
        debug!(
            method = %route.method,
            path = %route.path_pattern,
            route = %route.name,
            chain_len = route.chain.len(),
            "Route registered"
        );
        self.routes.push(Arc::new(route));
        self
    }

    pub fn get(&mut self, path: &str, handler: impl Handler + 'static) -> &mut Self {
        self.add_route(Route::builder(Method::GET, path).handler(handler).build())
    }

    pub fn post(&mut self, path: &str, handler: impl Handler + 'static) -> &mut Self {
        self.add_route(Route::builder(Method::POST, path).handler(handler).build())
    }

    pub fn put(&mut self, path: &str, handler: impl Handler + 'static) -> &mut Self {
        self.add_route(Route::builder(Method::PUT, path).handler(handler).build())
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler + 'static) -> &mut Self {
        self.add_route(Route::builder(Method::DELETE, path).handler(handler).build())
    }

    /// Launcher for a suspendable body, bound to this router's scheduler.
    pub fn suspend<F>(&self, body: F) -> Launcher
    where
        F: Fn(&Context, &Suspend) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        Launcher::new(self.scheduler.clone(), body)
    }

    /// Launcher for a controller method, bound to this router's scheduler.
    pub fn mvc<C, P, I>(&self, provider: P, method: MethodDescriptor, invoke: I) -> MvcLauncher<C>
    where
        C: Send + Sync + 'static,
        P: Provider<C> + 'static,
        I: Fn(&C, Args, &Context, &Suspend) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        MvcLauncher::new(self.scheduler.clone(), provider, method, invoke)
    }

    pub fn start(&self) {
        self.scheduler.start();
        let routes_summary: Vec<String> = self
            .routes
            .iter()
            .take(10)
            .map(|r| format!("{} {}", r.method, r.path_pattern))
            .collect();
        info!(
            routes_count = self.routes.len(),
            routes_summary = ?routes_summary,
            "Router started"
        );
    }

    /// Stop the scheduler, cancelling in-flight tasks and waiting up to
    /// `grace` for them to finish.
    pub fn stop(&self, grace: Duration) -> Result<(), LaunchError> {
        info!(grace_ms = grace.as_millis() as u64, "Router stopping");
        self.scheduler.shutdown(grace)
    }

    /// First route matching `method` and `path`, with its path parameters.
    #[must_use]
    pub fn find(&self, method: &Method, path: &str) -> Option<(Arc<Route>, ParamVec)> {
        self.routes
            .iter()
            .find_map(|route| route.matches(method, path).map(|p| (route.clone(), p)))
    }

    /// Route `request` and run its handler chain.
    ///
    /// Returns as soon as the chain returned or a launcher detached; the
    /// response may be committed later on another thread (see
    /// [`Context::wait_response`]).
    pub fn dispatch(&self, mut request: Request) -> Context {
        let started = Instant::now();
        let Some((route, params)) = self.find(&request.method, &request.path) else {
            let err = LaunchError::RouteNotFound {
                method: request.method.to_string(),
                path: request.path.clone(),
            };
            warn!(method = %request.method, path = %request.path, "No route matched");
            let ctx = Context::new(request, self.not_found.clone());
            context_interceptor(&ctx).intercept(err);
            return ctx;
        };

        request.path_params = params;
        let ctx = Context::new(request, route.clone());
        debug!(
            request_id = %ctx.request_id(),
            method = %ctx.request().method,
            path = %ctx.request().path,
            route = %route.name,
            path_params = ?ctx.request().path_params,
            "Route matched"
        );

        run_chain(&ctx, 0);

        debug!(
            request_id = %ctx.request_id(),
            route = %route.name,
            state = ?ctx.state(),
            dispatch_us = started.elapsed().as_micros() as u64,
            "Dispatch returned"
        );
        ctx
    }
}

/// Apply the route's handlers from `start` on until one completes the request
/// or hands it to a launched task. Launched tasks call this again to carry on
/// past a handler that returned [`Reply::Next`].
pub(crate) fn run_chain(ctx: &Context, start: usize) {
    let route = ctx.route().clone();
    for (index, handler) in route.chain.iter().enumerate().skip(start) {
        ctx.set_chain_position(index);
        let result = match catch_unwind(AssertUnwindSafe(|| handler.apply(ctx))) {
            Ok(result) => result,
            Err(panic) => Err(LaunchError::Handler(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        match result {
            Ok(Reply::Next) => continue,
            Ok(Reply::Detached) => return,
            Ok(reply) => return complete(ctx, Outcome::from_reply(reply)),
            Err(err) => return complete(ctx, Outcome::Failed(err)),
        }
    }
    complete(ctx, Outcome::Rendered(Value::Null));
}

fn complete(ctx: &Context, outcome: Outcome) {
    if let Err(err) = finish(ctx, outcome) {
        context_interceptor(ctx).intercept(err);
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Route {
        Route::builder(Method::GET, path).build()
    }

    #[test]
    fn test_literal_match() {
        let r = route("/pets");
        assert!(r.matches(&Method::GET, "/pets").is_some());
        assert!(r.matches(&Method::GET, "/pets/").is_some());
        assert!(r.matches(&Method::POST, "/pets").is_none());
        assert!(r.matches(&Method::GET, "/pets/1").is_none());
        assert!(r.matches(&Method::GET, "/").is_none());
    }

    #[test]
    fn test_param_extraction() {
        let r = route("/org/{id}/user/{id}");
        let params = r.matches(&Method::GET, "/org/1/user/42").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].1, "42");
    }

    #[test]
    fn test_param_values_are_percent_decoded() {
        let r = route("/pets/{name}");
        let params = r.matches(&Method::GET, "/pets/Rex%20Jr").unwrap();
        assert_eq!(params[0].1, "Rex Jr");
        let params = r.matches(&Method::GET, "/pets/%FF").unwrap();
        assert_eq!(params[0].1, "%FF");
    }

    #[test]
    fn test_root_route() {
        let r = route("/");
        assert!(r.matches(&Method::GET, "/").is_some());
        assert!(r.matches(&Method::GET, "/x").is_none());
    }

    #[test]
    fn test_default_route_name() {
        assert_eq!(route("/delay").name(), "GET /delay");
        let named = Route::builder(Method::POST, "/pets").name("create_pet").build();
        assert_eq!(named.name(), "create_pet");
    }
}
