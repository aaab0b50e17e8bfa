use super::outcome::launch_handler;
use crate::context::Context;
use crate::error::LaunchError;
use crate::handler::{Handler, Reply};
use crate::runtime_config::StartPolicy;
use crate::scheduler::{Scheduler, Suspend, TaskOptions};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type Body = dyn Fn(&Context, &Suspend) -> anyhow::Result<Reply> + Send + Sync;

/// Wraps a suspendable body so it can sit in a handler chain.
///
/// `apply` launches the body on the scheduler and returns as soon as the body
/// first suspends (or, with [`StartPolicy::Lazy`], right after the launch).
/// The body completes the request later: after-hook, then render, or a single
/// error response if it fails.
#[derive(Clone)]
pub struct Launcher {
    scheduler: Scheduler,
    body: Arc<Body>,
    name: Option<String>,
    policy: Option<StartPolicy>,
    deadline: Option<Duration>,
}

impl Launcher {
    pub fn new<F>(scheduler: Scheduler, body: F) -> Self
    where
        F: Fn(&Context, &Suspend) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        Self {
            scheduler,
            body: Arc::new(body),
            name: None,
            policy: None,
            deadline: None,
        }
    }

    /// Task name used in logs. Defaults to the route name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
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

    fn options(&self, ctx: &Context) -> TaskOptions {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => ctx.route().name().to_string(),
        };
        let mut options = TaskOptions::named(name);
        if let Some(policy) = self.policy {
            options = options.policy(policy);
        }
        if let Some(deadline) = self.deadline {
            options = options.deadline(deadline);
        }
        options
    }
}

impl Handler for Launcher {
    fn apply(&self, ctx: &Context) -> Result<Reply, LaunchError> {
        let body = self.body.clone();
        launch_handler(&self.scheduler, ctx, self.options(ctx), move |ctx, suspend| {
            body(ctx, suspend).map_err(LaunchError::from_handler)
        })
    }
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launcher")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("deadline", &self.deadline)
            .finish()
    }
}
