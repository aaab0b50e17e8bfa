#![allow(dead_code)]

use corouter::{Context, Outcome, Request, RequestState, Response, Router, RuntimeConfig, StartPolicy};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single response in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config(policy: StartPolicy) -> RuntimeConfig {
    RuntimeConfig {
        workers: 2,
        stack_size: 0x8000,
        start_policy: policy,
        task_deadline_ms: None,
        shutdown_grace_ms: 2_000,
    }
}

/// A router whose scheduler is already running.
pub fn started_router(policy: StartPolicy) -> Router {
    may::config().set_workers(2);
    let router = Router::with_config(test_config(policy));
    router.start();
    router
}

pub fn respond(router: &Router, request: Request) -> (Context, Response) {
    let ctx = router.dispatch(request);
    let res = ctx
        .wait_response(WAIT)
        .unwrap_or_else(|| panic!("no response for {}", ctx.request().path));
    (ctx, res)
}

/// What an after-hook saw.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub value: Option<Value>,
    pub error_kind: Option<&'static str>,
    pub written: bool,
    pub response_started: bool,
    pub state: RequestState,
}

/// Records every after-hook invocation.
#[derive(Clone, Default)]
pub struct HookLog {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl HookLog {
    pub fn hook(&self) -> impl Fn(&Context, &Outcome) + Send + Sync + 'static {
        let events = self.events.clone();
        move |ctx, outcome| {
            events.lock().push(HookEvent {
                value: outcome.value().cloned(),
                error_kind: outcome.error().map(|e| e.kind()),
                written: matches!(outcome, Outcome::ResponseAlreadyWritten),
                response_started: ctx.is_response_started(),
                state: ctx.state(),
            });
        }
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    pub fn single(&self) -> HookEvent {
        let events = self.events();
        assert_eq!(events.len(), 1, "after-hook ran {} times", events.len());
        events[0].clone()
    }
}
