use super::continuation::{Abort, Suspend, SuspendObserver};
use super::metrics::SchedulerMetrics;
use crate::error::{CancelReason, LaunchError};
use crate::ids::TaskId;
use crate::runtime_config::{RuntimeConfig, StartPolicy};
use dashmap::DashMap;
use may::sync::mpsc;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Spawn a detached coroutine.
#[allow(unsafe_code)]
pub(crate) fn spawn_coroutine<F>(name: &str, stack_size: usize, f: F) -> Result<(), LaunchError>
where
    F: FnOnce() + Send + 'static,
{
    // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime
    // because a coroutine must not hold thread-local references across yields.
    // Task bodies only reach shared state through Arc/Mutex handles, and every
    // suspension goes through may's own channel primitives.
    let spawned = unsafe {
        may::coroutine::Builder::new()
            .name(name.to_string())
            .stack_size(stack_size)
            .spawn(f)
    };
    match spawned {
        Ok(_detached) => Ok(()),
        Err(source) => {
            error!(
                task_name = %name,
                error = %source,
                stack_size = stack_size,
                "Failed to spawn coroutine - CRITICAL"
            );
            Err(LaunchError::Spawn {
                name: name.to_string(),
                source,
            })
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registry entry of one launched task.
pub(crate) struct TaskEntry {
    pub(crate) id: TaskId,
    pub(crate) name: Arc<str>,
    cancel: Mutex<Option<CancelReason>>,
    pending: Mutex<Option<Arc<dyn Abort>>>,
    /// Dropped when the task finishes so a deadline watchdog wakes early.
    wake: Mutex<Option<mpsc::Sender<()>>>,
    finished: AtomicBool,
}

impl TaskEntry {
    fn new(name: Arc<str>) -> Self {
        Self {
            id: TaskId::next(),
            name,
            cancel: Mutex::new(None),
            pending: Mutex::new(None),
            wake: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    /// Receiver that disconnects once the task finishes.
    fn arm_watchdog(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        *self.wake.lock() = Some(tx);
        rx
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel.lock()
    }

    pub(crate) fn park(&self, continuation: Arc<dyn Abort>) {
        *self.pending.lock() = Some(continuation);
    }

    /// Drop the parked continuation; `true` if one was still there.
    pub(crate) fn unpark(&self) -> bool {
        self.pending.lock().take().is_some()
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.pending.lock().take();
        self.wake.lock().take();
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut cancel = self.cancel.lock();
            if cancel.is_some() {
                return false;
            }
            *cancel = Some(reason);
        }
        let parked = self.pending.lock().take();
        let aborted = parked.is_some_and(|p| p.abort(reason));
        info!(
            task = %self.id,
            task_name = %self.name,
            reason = %reason,
            was_suspended = aborted,
            "Task cancelled"
        );
        true
    }
}

/// Handle to a launched task.
#[derive(Clone)]
pub struct TaskHandle {
    entry: Arc<TaskEntry>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.entry.id
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Request cancellation. A suspended task is resumed with a
    /// cancellation error; a running one observes it at its next suspension
    /// point. Returns `false` if the task already finished or was cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.entry.cancel(reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancel_reason().is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.entry.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.entry.id)
            .field("name", &self.entry.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct InterceptorInner {
    sink: Box<dyn Fn(LaunchError) + Send + Sync>,
    fired: AtomicBool,
}

/// Receives the error escaping a task body. Fires at most once; clones share
/// the same once-guard.
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<InterceptorInner>,
}

impl Interceptor {
    pub fn new(sink: impl Fn(LaunchError) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(InterceptorInner {
                sink: Box::new(sink),
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Forward `err` to the sink. Returns `false` (and drops the error) if the
    /// interceptor already fired.
    pub fn intercept(&self, err: LaunchError) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            error!(error = %err, kind = err.kind(), "Interceptor fired twice - dropping error");
            return false;
        }
        (self.inner.sink)(err);
        true
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// Per-launch settings.
#[derive(Clone)]
pub struct TaskOptions {
    name: String,
    policy: Option<StartPolicy>,
    deadline: Option<Duration>,
    observer: Option<Arc<dyn SuspendObserver>>,
}

impl TaskOptions {
    /// Options for a task tagged `name` (used in logs and as coroutine name).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: None,
            deadline: None,
            observer: None,
        }
    }

    /// Override the scheduler's default start policy.
    pub fn policy(mut self, policy: StartPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the scheduler's default task deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SuspendObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

struct SchedulerInner {
    config: RuntimeConfig,
    running: AtomicBool,
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    metrics: Arc<SchedulerMetrics>,
}

/// Launches suspendable task bodies on `may` coroutines.
///
/// Cheap to clone; clones share the task registry. Lifecycle is explicit:
/// [`start`](Self::start) before launching, [`shutdown`](Self::shutdown) to
/// cancel and drain whatever is still in flight.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                running: AtomicBool::new(false),
                tasks: DashMap::new(),
                metrics: Arc::new(SchedulerMetrics::new()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.inner.metrics
    }

    pub fn start(&self) {
        self.inner.config.apply_runtime();
        self.inner.running.store(true, Ordering::Release);
        info!(
            workers = self.inner.config.workers,
            stack_size = self.inner.config.stack_size,
            start_policy = ?self.inner.config.start_policy,
            task_deadline_ms = ?self.inner.config.task_deadline_ms,
            "Scheduler started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of launched tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Launch `body` as a new task.
    ///
    /// Errors escaping `body` (including panics and cancellation) go to
    /// `interceptor`. With [`StartPolicy::Eager`] this call returns once the
    /// body first suspends or finishes; with [`StartPolicy::Lazy`] it returns
    /// right after spawning. Fails without running `body` if the scheduler is
    /// stopped or the coroutine cannot be spawned; the interceptor is not
    /// invoked in that case.
    pub fn launch<F>(
        &self,
        options: TaskOptions,
        interceptor: Interceptor,
        body: F,
    ) -> Result<TaskHandle, LaunchError>
    where
        F: FnOnce(&Suspend) -> Result<(), LaunchError> + Send + 'static,
    {
        if !self.is_running() {
            return Err(LaunchError::SchedulerStopped);
        }

        let policy = options.policy.unwrap_or(self.inner.config.start_policy);
        let deadline = options.deadline.or_else(|| self.inner.config.task_deadline());
        let entry = Arc::new(TaskEntry::new(Arc::from(options.name.as_str())));
        let handle = TaskHandle {
            entry: entry.clone(),
        };

        let (caller_tx, caller_rx) = match policy {
            StartPolicy::Eager => {
                let (tx, rx) = mpsc::channel();
                (Some(tx), Some(rx))
            }
            StartPolicy::Lazy => (None, None),
        };
        if let Some(observer) = &options.observer {
            observer.launched(&handle);
        }
        let suspend = Suspend::new(
            entry.clone(),
            options.observer,
            caller_tx,
            self.inner.metrics.clone(),
        );

        // Armed before the body runs so a fast finish still reaches the watchdog.
        let wake = deadline.map(|deadline| (deadline, entry.arm_watchdog()));

        self.inner.tasks.insert(entry.id, entry.clone());
        self.inner.metrics.record_launch();
        debug!(
            task = %entry.id,
            task_name = %entry.name,
            policy = ?policy,
            "Launching task"
        );

        let inner = self.inner.clone();
        let task = entry.clone();
        let spawned = spawn_coroutine(&options.name, self.inner.config.stack_size, move || {
            let started = Instant::now();
            let result = match catch_unwind(AssertUnwindSafe(|| body(&suspend))) {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        task = %task.id,
                        task_name = %task.name,
                        panic_message = %message,
                        "Task panicked - CRITICAL"
                    );
                    Err(LaunchError::Panicked {
                        task: task.id,
                        message,
                    })
                }
            };
            task.finish();

            match result {
                Ok(()) => {
                    inner.metrics.record_completion();
                    debug!(
                        task = %task.id,
                        task_name = %task.name,
                        execution_time_ms = started.elapsed().as_millis() as u64,
                        "Task completed"
                    );
                }
                Err(err) => {
                    inner.metrics.record_failure(err.is_cancellation());
                    debug!(
                        task = %task.id,
                        task_name = %task.name,
                        kind = err.kind(),
                        "Task failed"
                    );
                    interceptor.intercept(err);
                }
            }

            inner.tasks.remove(&task.id);
            suspend.release_caller();
        });

        if let Err(err) = spawned {
            self.inner.tasks.remove(&entry.id);
            self.inner.metrics.record_failure(false);
            return Err(err);
        }

        if let Some((deadline, wake)) = wake {
            self.watch_deadline(&entry, deadline, wake);
        }

        if let Some(rx) = caller_rx {
            // Disconnect means the body finished (or died) without signalling.
            let _ = rx.recv();
        }

        Ok(handle)
    }

    fn watch_deadline(&self, entry: &Arc<TaskEntry>, deadline: Duration, wake: mpsc::Receiver<()>) {
        let watched: Weak<TaskEntry> = Arc::downgrade(entry);
        let name = format!("{}-deadline", entry.name);
        let metrics = self.inner.metrics.clone();
        metrics.record_watchdog_start();
        let spawned = spawn_coroutine(&name, 0x4000, move || {
            let expired = matches!(wake.recv_timeout(deadline), Err(RecvTimeoutError::Timeout));
            metrics.record_watchdog_stop();
            if !expired {
                return;
            }
            if let Some(entry) = watched.upgrade() {
                if entry.cancel(CancelReason::Deadline) {
                    warn!(
                        task = %entry.id,
                        task_name = %entry.name,
                        deadline_ms = deadline.as_millis() as u64,
                        "Task deadline exceeded"
                    );
                }
            }
        });
        if spawned.is_err() {
            self.inner.metrics.record_watchdog_stop();
            warn!(task = %entry.id, "Running without deadline watchdog");
        }
    }

    /// Cancel a task by id. Returns `false` if it is unknown or already
    /// finished/cancelled.
    pub fn cancel(&self, task: TaskId, reason: CancelReason) -> bool {
        let entry = self.inner.tasks.get(&task).map(|e| e.value().clone());
        match entry {
            Some(entry) => entry.cancel(reason),
            None => false,
        }
    }

    /// Stop accepting launches, cancel everything in flight and wait up to
    /// `grace` for the registry to drain.
    pub fn shutdown(&self, grace: Duration) -> Result<(), LaunchError> {
        self.inner.running.store(false, Ordering::Release);

        let outstanding: Vec<Arc<TaskEntry>> = self
            .inner
            .tasks
            .iter()
            .map(|e| e.value().clone())
            .collect();
        info!(outstanding = outstanding.len(), "Scheduler shutting down");
        for entry in &outstanding {
            entry.cancel(CancelReason::Shutdown);
        }

        let deadline = Instant::now() + grace;
        while !self.inner.tasks.is_empty() {
            if Instant::now() >= deadline {
                let outstanding = self.inner.tasks.len();
                error!(outstanding = outstanding, "Scheduler shutdown timed out");
                return Err(LaunchError::ShutdownTimedOut { outstanding });
            }
            may::coroutine::sleep(Duration::from_millis(5));
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("active_tasks", &self.active_tasks())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_interceptor_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let interceptor = Interceptor::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = interceptor.clone();
        assert!(interceptor.intercept(LaunchError::SchedulerStopped));
        assert!(!clone.intercept(LaunchError::SchedulerStopped));
        assert!(clone.has_fired());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_on_stopped_scheduler_fails() {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let interceptor = Interceptor::new(|_| {});
        let err = scheduler
            .launch(TaskOptions::named("never"), interceptor.clone(), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), "scheduler_stopped");
        assert!(!interceptor.has_fired());
    }

    #[test]
    fn test_entry_cancel_is_single_shot() {
        let entry = TaskEntry::new(Arc::from("t"));
        assert!(entry.cancel(CancelReason::Requested));
        assert!(!entry.cancel(CancelReason::Deadline));
        assert_eq!(entry.cancel_reason(), Some(CancelReason::Requested));
    }

    #[test]
    fn test_finish_disconnects_watchdog() {
        let entry = TaskEntry::new(Arc::from("t"));
        let wake = entry.arm_watchdog();
        entry.finish();
        assert!(matches!(
            wake.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_finished_entry_ignores_cancel() {
        let entry = TaskEntry::new(Arc::from("t"));
        entry.finish();
        assert!(!entry.cancel(CancelReason::Shutdown));
        assert_eq!(entry.cancel_reason(), None);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
