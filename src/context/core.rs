use super::request::{HeaderVec, Request, Response};
use crate::error::{CancelReason, LaunchError};
use crate::ids::RequestId;
use crate::router::Route;
use crate::scheduler::{SuspendObserver, TaskHandle};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Reserved attribute key under which a suspended handler's continuation is
/// parked, so that an external resumer holding only the Context can find it.
pub const CONTINUATION_KEY: &str = "corouter.continuation";

/// Type-erased attribute value.
pub type Attribute = Arc<dyn Any + Send + Sync>;

/// Logical per-request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    HandlerRunning,
    Suspended,
    Resumed,
    HandlerCompleted,
    AfterHookRun,
    Rendered,
    ErrorSent,
    Closed,
}

#[derive(Default)]
struct ResponseState {
    status: Option<u16>,
    headers: HeaderVec,
    committed: Option<Response>,
}

struct ContextInner {
    request: Request,
    route: Arc<Route>,
    attributes: Mutex<HashMap<String, Attribute>>,
    response: Mutex<ResponseState>,
    committed: Condvar,
    state: Mutex<RequestState>,
    task: Mutex<Option<TaskHandle>>,
    /// Index of the chain handler currently applied
    chain_position: AtomicUsize,
}

/// Per-request state carrier.
///
/// Cloning is cheap and every clone refers to the same request.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(request: Request, route: Arc<Route>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request,
                route,
                attributes: Mutex::new(HashMap::new()),
                response: Mutex::new(ResponseState::default()),
                committed: Condvar::new(),
                state: Mutex::new(RequestState::Created),
                task: Mutex::new(None),
                chain_position: AtomicUsize::new(0),
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request.request_id
    }

    /// The route currently executing for this request.
    pub fn route(&self) -> &Arc<Route> {
        &self.inner.route
    }

    pub fn state(&self) -> RequestState {
        *self.inner.state.lock()
    }

    /// Move the lifecycle forward. `Closed` is terminal.
    pub(crate) fn advance(&self, next: RequestState) {
        let mut state = self.inner.state.lock();
        if *state == RequestState::Closed {
            debug!(
                request_id = %self.request_id(),
                next = ?next,
                "Ignoring state transition on closed context"
            );
            return;
        }
        *state = next;
    }

    /// Index into the route's chain of the handler running for this request.
    pub fn chain_position(&self) -> usize {
        self.inner.chain_position.load(Ordering::Acquire)
    }

    pub(crate) fn set_chain_position(&self, index: usize) {
        self.inner.chain_position.store(index, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.advance(RequestState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RequestState::Closed
    }

    /// Typed attribute lookup. Returns `None` if absent or of another type.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.attributes.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.inner.attributes.lock().contains_key(key)
    }

    pub fn set_attribute<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), LaunchError> {
        self.insert_attribute(key.into(), Arc::new(value))
    }

    pub(crate) fn insert_attribute(&self, key: String, value: Attribute) -> Result<(), LaunchError> {
        // Hold the state lock so a concurrent close cannot slip in between.
        let state = self.inner.state.lock();
        if *state == RequestState::Closed {
            return Err(LaunchError::ContextClosed {
                request_id: self.request_id().to_string(),
            });
        }
        self.inner.attributes.lock().insert(key, value);
        drop(state);
        Ok(())
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Attribute> {
        self.inner.attributes.lock().remove(key)
    }

    /// Whether a response has been committed for this request.
    pub fn is_response_started(&self) -> bool {
        self.inner.response.lock().committed.is_some()
    }

    /// Status used by the next `render`. Defaults to 200.
    pub fn set_status(&self, status: u16) {
        self.inner.response.lock().status = Some(status);
    }

    /// Header carried by whichever response is committed next.
    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        let mut res = self.inner.response.lock();
        res.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        res.headers.push((Arc::from(name), value.into()));
    }

    /// Render a handler result. Strings go out as `text/plain`, anything else
    /// as JSON. Returns `false` if a response was already committed.
    pub fn render(&self, value: Value) -> bool {
        let content_type = if value.is_string() {
            "text/plain; charset=utf-8"
        } else {
            "application/json"
        };
        let committed = self.commit(|res| {
            let mut response = Response::new(res.status.unwrap_or(200), res.headers.clone(), value);
            if response.get_header("content-type").is_none() {
                response.set_header("content-type", content_type.to_string());
            }
            response
        });
        if committed {
            self.advance(RequestState::Rendered);
        }
        committed
    }

    /// Write a response directly from handler code.
    pub fn send(&self, status: u16, body: Value) -> bool {
        self.set_status(status);
        self.render(body)
    }

    /// Emit the error response for `err`. Returns `false` if a response was
    /// already committed.
    pub fn send_error(&self, err: &LaunchError) -> bool {
        let request_id = self.request_id().to_string();
        let committed = self.commit(|res| {
            let mut response =
                Response::new(err.status_code(), res.headers.clone(), err.to_body(&request_id));
            response.set_header("content-type", "application/json".to_string());
            response
        });
        if committed {
            warn!(
                request_id = %request_id,
                path = %self.inner.request.path,
                status = err.status_code(),
                kind = err.kind(),
                error = %err,
                "Error response sent"
            );
            self.advance(RequestState::ErrorSent);
        }
        committed
    }

    fn commit(&self, build: impl FnOnce(&ResponseState) -> Response) -> bool {
        let mut res = self.inner.response.lock();
        if let Some(existing) = &res.committed {
            error!(
                request_id = %self.request_id(),
                status = existing.status,
                "Response already committed - dropping second write"
            );
            return false;
        }
        let response = build(&res);
        res.committed = Some(response);
        self.inner.committed.notify_all();
        true
    }

    /// Snapshot of the committed response, if any.
    pub fn response(&self) -> Option<Response> {
        self.inner.response.lock().committed.clone()
    }

    /// Block the calling OS thread until a response is committed or `timeout`
    /// elapses. Meant for transports and tests, not for handler code.
    pub fn wait_response(&self, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        let mut res = self.inner.response.lock();
        while res.committed.is_none() {
            if self.inner.committed.wait_until(&mut res, deadline).timed_out() {
                break;
            }
        }
        res.committed.clone()
    }

    pub(crate) fn bind_task(&self, handle: TaskHandle) {
        *self.inner.task.lock() = Some(handle);
    }

    /// Handle of the task currently running this request's handler.
    pub fn task(&self) -> Option<TaskHandle> {
        self.inner.task.lock().clone()
    }

    /// Cancel the in-flight task, e.g. on client disconnect. Returns `false`
    /// if no task is running or it was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        match self.task() {
            Some(handle) => handle.cancel(reason),
            None => false,
        }
    }
}

impl SuspendObserver for Context {
    fn launched(&self, task: &TaskHandle) {
        self.bind_task(task.clone());
    }

    fn captured(&self, continuation: Attribute) {
        if let Err(err) = self.insert_attribute(CONTINUATION_KEY.to_string(), continuation) {
            error!(request_id = %self.request_id(), error = %err, "Cannot park continuation");
        }
    }

    fn suspended(&self) {
        self.advance(RequestState::Suspended);
    }

    fn resumed(&self) {
        self.remove_attribute(CONTINUATION_KEY);
        self.advance(RequestState::Resumed);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id())
            .field("method", &self.inner.request.method)
            .field("path", &self.inner.request.path)
            .field("route", &self.inner.route.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new(Request::get("/pets"), Arc::new(Route::not_found()))
    }

    #[test]
    fn test_typed_attributes() {
        let ctx = ctx();
        ctx.set_attribute("user", "alice".to_string()).unwrap();
        assert_eq!(ctx.attribute::<String>("user").as_deref().map(String::as_str), Some("alice"));
        assert!(ctx.attribute::<u64>("user").is_none());
        assert!(ctx.remove_attribute("user").is_some());
        assert!(!ctx.has_attribute("user"));
    }

    #[test]
    fn test_closed_context_rejects_attributes() {
        let ctx = ctx();
        ctx.close();
        let err = ctx.set_attribute("late", 1u8).unwrap_err();
        assert_eq!(err.kind(), "context_closed");
        ctx.advance(RequestState::HandlerRunning);
        assert_eq!(ctx.state(), RequestState::Closed);
    }

    #[test]
    fn test_render_commits_once() {
        let ctx = ctx();
        ctx.set_header("X-Trace", "abc");
        assert!(ctx.render(Value::String("hello".into())));
        assert!(ctx.is_response_started());
        assert!(!ctx.render(Value::String("again".into())));
        assert!(!ctx.send_error(&LaunchError::SchedulerStopped));

        let res = ctx.response().unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body_text(), Some("hello"));
        assert_eq!(res.get_header("x-trace"), Some("abc"));
        assert_eq!(res.get_header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(ctx.state(), RequestState::Rendered);
    }

    #[test]
    fn test_send_error_uses_status_mapping() {
        let ctx = ctx();
        assert!(ctx.send_error(&LaunchError::SchedulerStopped));
        let res = ctx.wait_response(Duration::from_millis(10)).unwrap();
        assert_eq!(res.status, 503);
        assert_eq!(res.body["kind"], "scheduler_stopped");
        assert_eq!(res.body["request_id"], ctx.request_id().to_string());
        assert_eq!(ctx.state(), RequestState::ErrorSent);
    }

    #[test]
    fn test_wait_response_times_out() {
        let ctx = ctx();
        assert!(ctx.wait_response(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_wait_response_wakes_on_commit_from_other_thread() {
        let ctx = ctx();
        let writer = ctx.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.send(201, serde_json::json!({"id": 7}));
        });
        let res = ctx.wait_response(Duration::from_secs(2)).unwrap();
        t.join().unwrap();
        assert_eq!(res.status, 201);
        assert_eq!(res.body["id"], 7);
    }

    #[test]
    fn test_observer_parks_and_clears_continuation() {
        let ctx = ctx();
        ctx.captured(Arc::new(42u32));
        assert_eq!(ctx.attribute::<u32>(CONTINUATION_KEY).as_deref(), Some(&42));
        ctx.suspended();
        assert_eq!(ctx.state(), RequestState::Suspended);
        ctx.resumed();
        assert!(!ctx.has_attribute(CONTINUATION_KEY));
        assert_eq!(ctx.state(), RequestState::Resumed);
    }
}
