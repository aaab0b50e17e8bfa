//! Continuation capture: the only place a task suspends.

use super::core::TaskEntry;
use super::metrics::SchedulerMetrics;
use crate::context::Attribute;
use crate::error::{CancelReason, LaunchError};
use crate::ids::TaskId;
use may::sync::mpsc;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

type Delivery<T> = Result<T, LaunchError>;

enum Slot<T> {
    Pending(mpsc::Sender<Delivery<T>>),
    Resumed,
    Aborted(CancelReason),
}

struct ContinuationInner<T> {
    task: TaskId,
    name: Arc<str>,
    slot: Mutex<Slot<T>>,
}

/// Single-shot resumption handle of a suspended task.
///
/// Clones share one slot: whichever clone completes first resumes the task,
/// every later attempt is rejected without touching the task.
pub struct Continuation<T> {
    inner: Arc<ContinuationInner<T>>,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.slot.lock() {
            Slot::Pending(_) => "pending",
            Slot::Resumed => "resumed",
            Slot::Aborted(_) => "aborted",
        };
        f.debug_struct("Continuation")
            .field("task", &self.inner.task)
            .field("name", &self.inner.name)
            .field("state", &state)
            .finish()
    }
}

impl<T: Send + 'static> Continuation<T> {
    fn new(task: TaskId, name: Arc<str>, tx: mpsc::Sender<Delivery<T>>) -> Self {
        Self {
            inner: Arc::new(ContinuationInner {
                task,
                name,
                slot: Mutex::new(Slot::Pending(tx)),
            }),
        }
    }

    pub fn task(&self) -> TaskId {
        self.inner.task
    }

    /// Resume the suspended body with `value`.
    pub fn resume(&self, value: T) -> Result<(), LaunchError> {
        self.complete(Ok(value))
    }

    /// Resume the suspended body by raising `err` at its suspension point.
    pub fn resume_with_error(&self, err: impl Into<anyhow::Error>) -> Result<(), LaunchError> {
        self.complete(Err(LaunchError::from_handler(err.into())))
    }

    /// Deliver `result` to the suspension point.
    ///
    /// A second call fails with [`LaunchError::DoubleResumption`]. A call after
    /// the task was cancelled fails quietly with the cancellation.
    pub fn complete(&self, result: Result<T, LaunchError>) -> Result<(), LaunchError> {
        let mut slot = self.inner.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Resumed) {
            Slot::Pending(tx) => {
                drop(slot);
                // The receiver is gone only if the task itself already died.
                if tx.send(result).is_err() {
                    debug!(task = %self.inner.task, "Resumed continuation of a finished task");
                }
                Ok(())
            }
            Slot::Resumed => {
                error!(
                    task = %self.inner.task,
                    task_name = %self.inner.name,
                    "Continuation resumed more than once - CRITICAL"
                );
                Err(LaunchError::DoubleResumption {
                    task: self.inner.task,
                })
            }
            Slot::Aborted(reason) => {
                *slot = Slot::Aborted(reason);
                debug!(task = %self.inner.task, reason = %reason, "Resume after cancellation ignored");
                Err(LaunchError::Cancelled {
                    task: self.inner.task,
                    reason,
                })
            }
        }
    }

    pub fn is_resumed(&self) -> bool {
        !matches!(&*self.inner.slot.lock(), Slot::Pending(_))
    }
}

/// Type-erased view the scheduler keeps so it can cancel a parked task
/// without knowing the awaited type.
pub(crate) trait Abort: Send + Sync {
    /// Resume with a cancellation if still pending. Never reports double
    /// resumption.
    fn abort(&self, reason: CancelReason) -> bool;
}

impl<T: Send + 'static> Abort for Continuation<T> {
    fn abort(&self, reason: CancelReason) -> bool {
        let mut slot = self.inner.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Aborted(reason)) {
            Slot::Pending(tx) => {
                drop(slot);
                let _ = tx.send(Err(LaunchError::Cancelled {
                    task: self.inner.task,
                    reason,
                }));
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }
}

/// Notified as a task captures, parks on and resumes from a continuation.
///
/// The [`Context`](crate::context::Context) implements this to park the
/// continuation under a reserved attribute while the handler is suspended.
pub trait SuspendObserver: Send + Sync {
    /// Called once, before the body first runs.
    fn launched(&self, _task: &super::TaskHandle) {}
    fn captured(&self, _continuation: Attribute) {}
    fn suspended(&self) {}
    fn resumed(&self) {}
}

/// Capability handed to a task body; the body's only way to suspend.
pub struct Suspend {
    entry: Arc<TaskEntry>,
    observer: Option<Arc<dyn SuspendObserver>>,
    caller: Mutex<Option<mpsc::Sender<()>>>,
    metrics: Arc<SchedulerMetrics>,
}

impl Suspend {
    pub(crate) fn new(
        entry: Arc<TaskEntry>,
        observer: Option<Arc<dyn SuspendObserver>>,
        caller: Option<mpsc::Sender<()>>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            entry,
            observer,
            caller: Mutex::new(caller),
            metrics,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.entry.id
    }

    pub fn task_name(&self) -> &str {
        &self.entry.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancel_reason().is_some()
    }

    /// The cancellation error, if this task has been cancelled.
    pub fn cancellation(&self) -> Option<LaunchError> {
        self.entry.cancel_reason().map(|reason| LaunchError::Cancelled {
            task: self.entry.id,
            reason,
        })
    }

    /// Fail with the cancellation error if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), LaunchError> {
        match self.cancellation() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Let the thread that launched this task return, if it is still waiting.
    pub(crate) fn release_caller(&self) {
        if let Some(tx) = self.caller.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Obtain a value that some other agent will deliver.
    ///
    /// `register` receives the continuation and must arrange for it to be
    /// completed, either right away (the call then returns without
    /// suspending) or later from a timer, an I/O callback or another task.
    /// While waiting, the coroutine is parked and its worker thread is free.
    pub fn await_with<T, F>(&self, register: F) -> Result<T, LaunchError>
    where
        T: Send + 'static,
        F: FnOnce(Continuation<T>),
    {
        self.checkpoint()?;

        let (tx, rx) = mpsc::channel();
        let continuation = Continuation::new(self.entry.id, self.entry.name.clone(), tx);

        self.entry.park(Arc::new(continuation.clone()));
        if let Some(err) = self.cancellation() {
            // Cancel raced with parking; whoever takes the slot delivers.
            if self.entry.unpark() {
                return Err(err);
            }
        }
        if let Some(observer) = &self.observer {
            observer.captured(Arc::new(continuation.clone()));
        }

        register(continuation);

        let result = match rx.try_recv() {
            Ok(delivered) => delivered,
            Err(_) => {
                debug!(task = %self.entry.id, task_name = %self.entry.name, "Task suspended");
                if let Some(observer) = &self.observer {
                    observer.suspended();
                }
                self.metrics.record_suspend();
                self.release_caller();

                let delivered = rx.recv();
                self.metrics.record_resume();
                debug!(task = %self.entry.id, task_name = %self.entry.name, "Task resumed");
                delivered.unwrap_or_else(|_| {
                    Err(LaunchError::Cancelled {
                        task: self.entry.id,
                        reason: crate::error::CancelReason::Requested,
                    })
                })
            }
        };

        self.entry.unpark();
        if let Some(observer) = &self.observer {
            observer.resumed();
        }
        result
    }

    /// Suspend for `duration`, resumed by a timer coroutine.
    pub fn delay(&self, duration: Duration) -> Result<(), LaunchError> {
        let name = format!("{}-timer", self.entry.name);
        self.await_with(|continuation: Continuation<()>| {
            let timer = continuation.clone();
            let spawned = super::core::spawn_coroutine(&name, 0x4000, move || {
                may::coroutine::sleep(duration);
                let _ = timer.resume(());
            });
            if let Err(err) = spawned {
                let _ = continuation.complete(Err(err));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending<T: Send + 'static>() -> (Continuation<T>, mpsc::Receiver<Delivery<T>>) {
        let (tx, rx) = mpsc::channel();
        (Continuation::new(TaskId::next(), Arc::from("test"), tx), rx)
    }

    #[test]
    fn test_resume_delivers_value() {
        let (cont, rx) = pending::<u32>();
        assert!(!cont.is_resumed());
        cont.resume(7).unwrap();
        assert!(cont.is_resumed());
        assert_eq!(rx.recv().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_second_resume_is_rejected() {
        let (cont, rx) = pending::<u32>();
        let other = cont.clone();
        cont.resume(1).unwrap();
        let err = other.resume(2).unwrap_err();
        assert_eq!(err.kind(), "double_resumption");
        assert_eq!(rx.recv().unwrap().unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resume_with_error_is_a_handler_error() {
        let (cont, rx) = pending::<u32>();
        cont.resume_with_error(anyhow::anyhow!("io failed")).unwrap();
        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), "handler_execution");
    }

    #[test]
    fn test_abort_then_resume_is_quiet_cancellation() {
        let (cont, rx) = pending::<u32>();
        assert!(cont.abort(CancelReason::Deadline));
        assert!(!cont.abort(CancelReason::Shutdown));
        assert!(cont.resume(3).unwrap_err().is_cancellation());
        assert!(rx.recv().unwrap().unwrap_err().is_cancellation());
    }

    #[test]
    fn test_late_resume_reports_the_abort_reason() {
        for reason in [
            CancelReason::Deadline,
            CancelReason::Shutdown,
            CancelReason::ClientDisconnect,
        ] {
            let (cont, _rx) = pending::<u32>();
            assert!(cont.abort(reason));
            match cont.resume(1).unwrap_err() {
                LaunchError::Cancelled { reason: seen, .. } => assert_eq!(seen, reason),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn test_abort_after_resume_does_nothing() {
        let (cont, _rx) = pending::<u32>();
        cont.resume(1).unwrap();
        assert!(!cont.abort(CancelReason::Requested));
        assert_eq!(cont.resume(2).unwrap_err().kind(), "double_resumption");
    }
}
