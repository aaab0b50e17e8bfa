use crate::context::{Context, RequestState};
use crate::error::LaunchError;
use crate::handler::Reply;
use crate::router::run_chain;
use crate::scheduler::{panic_message, Interceptor, Scheduler, Suspend, TaskOptions};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

/// How a handler ended, as seen by the after-hook.
#[derive(Debug)]
pub enum Outcome {
    /// The handler produced a value that still has to be rendered.
    Rendered(Value),
    /// The handler wrote the response itself.
    ResponseAlreadyWritten,
    Failed(LaunchError),
}

impl Outcome {
    pub(crate) fn from_reply(reply: Reply) -> Self {
        match reply {
            Reply::Value(value) => Outcome::Rendered(value),
            // A chain that only passed the request along renders nothing useful.
            Reply::Next => Outcome::Rendered(Value::Null),
            Reply::Written | Reply::Detached => Outcome::ResponseAlreadyWritten,
        }
    }

    /// The value about to be rendered. `None` for a failure and for a
    /// response the handler already wrote.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Rendered(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&LaunchError> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// Interceptor that turns the error escaping a request's handler into that
/// request's single error response.
pub(crate) fn context_interceptor(ctx: &Context) -> Interceptor {
    let ctx = ctx.clone();
    Interceptor::new(move |err| {
        ctx.send_error(&err);
        ctx.close();
    })
}

/// Completion routine shared by synchronous and launched handlers: after-hook
/// first, then render. A failure is handed back for the interceptor.
pub(crate) fn finish(ctx: &Context, outcome: Outcome) -> Result<(), LaunchError> {
    ctx.advance(RequestState::HandlerCompleted);

    if let Some(hook) = ctx.route().after_hook() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(ctx, &outcome))) {
            error!(
                request_id = %ctx.request_id(),
                route = %ctx.route().name(),
                panic_message = %panic_message(panic.as_ref()),
                "After-hook panicked"
            );
        }
    }
    ctx.advance(RequestState::AfterHookRun);

    match outcome {
        Outcome::Rendered(value) => {
            if ctx.is_response_started() {
                debug!(request_id = %ctx.request_id(), "Response already started, skipping render");
            } else {
                ctx.render(value);
            }
            ctx.close();
            Ok(())
        }
        Outcome::ResponseAlreadyWritten => {
            ctx.close();
            Ok(())
        }
        Outcome::Failed(err) => Err(err),
    }
}

/// Fold what a task body returned (or how it panicked) into an outcome.
///
/// A value produced after the task was cancelled is discarded in favour of
/// the cancellation error.
pub(crate) fn settle(
    suspend: &Suspend,
    result: thread::Result<Result<Reply, LaunchError>>,
) -> Outcome {
    let outcome = match result {
        Ok(Ok(reply)) => Outcome::from_reply(reply),
        Ok(Err(err)) => Outcome::Failed(err),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                task = %suspend.task_id(),
                task_name = %suspend.task_name(),
                panic_message = %message,
                "Handler panicked"
            );
            Outcome::Failed(LaunchError::Panicked {
                task: suspend.task_id(),
                message,
            })
        }
    };
    match (outcome, suspend.cancellation()) {
        (Outcome::Rendered(_), Some(cancelled)) => Outcome::Failed(cancelled),
        (outcome, _) => outcome,
    }
}

/// Run `run` as a task bound to `ctx` and hand completion over to it.
///
/// Always returns [`Reply::Detached`]: whether the task finishes before this
/// call returns depends on the start policy, and the Context is the only
/// place the caller should look for the response.
///
/// Inside the task, a body returning [`Reply::Next`] carries the chain on
/// from the handler after this one, and a body returning
/// [`Reply::Detached`] leaves completion to the task it launched.
pub(crate) fn launch_handler<F>(
    scheduler: &Scheduler,
    ctx: &Context,
    options: TaskOptions,
    run: F,
) -> Result<Reply, LaunchError>
where
    F: FnOnce(&Context, &Suspend) -> Result<Reply, LaunchError> + Send + 'static,
{
    let interceptor = context_interceptor(ctx);
    let options = options.observer(Arc::new(ctx.clone()));
    ctx.advance(RequestState::HandlerRunning);

    let task_ctx = ctx.clone();
    let position = ctx.chain_position();
    let launched = scheduler.launch(options, interceptor.clone(), move |suspend| {
        let result = catch_unwind(AssertUnwindSafe(|| run(&task_ctx, suspend)));
        match result {
            Ok(Ok(Reply::Detached)) => {
                debug!(
                    request_id = %task_ctx.request_id(),
                    task = %suspend.task_id(),
                    "Completion handed to nested task"
                );
                Ok(())
            }
            Ok(Ok(Reply::Next)) if suspend.cancellation().is_none() => {
                debug!(
                    request_id = %task_ctx.request_id(),
                    next = position + 1,
                    "Continuing handler chain"
                );
                run_chain(&task_ctx, position + 1);
                Ok(())
            }
            result => finish(&task_ctx, settle(suspend, result)),
        }
    });

    if let Err(err) = launched {
        if let Err(err) = finish(ctx, Outcome::Failed(err)) {
            interceptor.intercept(err);
        }
    }
    Ok(Reply::Detached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Request;
    use crate::router::Route;
    use http::Method;
    use parking_lot::Mutex;
    use serde_json::json;

    fn ctx_with_hook(seen: Arc<Mutex<Vec<String>>>) -> Context {
        let route = Route::builder(Method::GET, "/hooked")
            .after(move |ctx, outcome| {
                let started = ctx.is_response_started();
                let entry = match outcome {
                    Outcome::Rendered(v) => format!("value:{v}:{started}"),
                    Outcome::ResponseAlreadyWritten => format!("written:{started}"),
                    Outcome::Failed(e) => format!("error:{}:{started}", e.kind()),
                };
                seen.lock().push(entry);
            })
            .build();
        Context::new(Request::get("/hooked"), Arc::new(route))
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(Outcome::from_reply(Reply::text("a")).value(), Some(&json!("a")));
        assert_eq!(Outcome::from_reply(Reply::Next).value(), Some(&Value::Null));
        assert!(Outcome::from_reply(Reply::Written).value().is_none());
        assert!(Outcome::from_reply(Reply::Detached).error().is_none());
    }

    #[test]
    fn test_finish_runs_hook_before_render() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = ctx_with_hook(seen.clone());
        finish(&ctx, Outcome::Rendered(json!({"ok": true}))).unwrap();
        assert_eq!(seen.lock().as_slice(), ["value:{\"ok\":true}:false"]);
        assert_eq!(ctx.response().unwrap().body, json!({"ok": true}));
        assert!(ctx.is_closed());
    }

    #[test]
    fn test_finish_skips_render_when_handler_wrote() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = ctx_with_hook(seen.clone());
        ctx.send(202, json!("manual"));
        finish(&ctx, Outcome::ResponseAlreadyWritten).unwrap();
        assert_eq!(seen.lock().as_slice(), ["written:true"]);
        assert_eq!(ctx.response().unwrap().status, 202);
    }

    #[test]
    fn test_finish_hands_failure_back_after_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = ctx_with_hook(seen.clone());
        let err = finish(&ctx, Outcome::Failed(LaunchError::SchedulerStopped)).unwrap_err();
        assert_eq!(err.kind(), "scheduler_stopped");
        assert_eq!(seen.lock().as_slice(), ["error:scheduler_stopped:false"]);
        assert!(!ctx.is_response_started());
    }

    #[test]
    fn test_panicking_hook_does_not_block_render() {
        let route = Route::builder(Method::GET, "/p")
            .after(|_, _| panic!("hook blew up"))
            .build();
        let ctx = Context::new(Request::get("/p"), Arc::new(route));
        finish(&ctx, Outcome::Rendered(json!("fine"))).unwrap();
        assert_eq!(ctx.response().unwrap().body_text(), Some("fine"));
    }

    #[test]
    fn test_context_interceptor_sends_error_and_closes() {
        let ctx = Context::new(Request::get("/"), Arc::new(Route::not_found()));
        let interceptor = context_interceptor(&ctx);
        assert!(interceptor.intercept(LaunchError::SchedulerStopped));
        assert!(!interceptor.intercept(LaunchError::SchedulerStopped));
        assert_eq!(ctx.response().unwrap().status, 503);
        assert!(ctx.is_closed());
    }
}
