//! Managed task handles.
//!
//! A task is the completion cell for one asynchronous operation: a status,
//! a result or exception, and the list of continuations to run when the
//! status becomes terminal. Continuations registered after completion run
//! immediately on the registering thread; the drain after a completing
//! store runs outside the lock, so a continuation may itself register
//! further continuations.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::jit::il::Value;
use crate::rt::exception;
use crate::rt::object::ObjRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Faulted,
    Canceled,
}

pub type Continuation = Box<dyn FnOnce() + Send>;

struct TaskInner {
    status: TaskStatus,
    result: Option<Value>,
    exception: Option<ObjRef>,
    continuations: Vec<Continuation>,
}

/// Completion cell shared between a builder and its awaiters.
pub struct ManagedTask {
    inner: Mutex<TaskInner>,
}

pub type TaskRef = Arc<ManagedTask>;

impl ManagedTask {
    pub fn pending() -> TaskRef {
        Arc::new(Self {
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Pending,
                result: None,
                exception: None,
                continuations: Vec::new(),
            }),
        })
    }

    /// An already-succeeded task.
    pub fn completed(result: Option<Value>) -> TaskRef {
        let task = Self::pending();
        task.complete(result);
        task
    }

    /// An already-canceled task carrying the token's exception.
    pub fn canceled(token: u32) -> TaskRef {
        let task = Self::pending();
        task.cancel(token);
        task
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.status() != TaskStatus::Pending
    }

    /// Result of a succeeded task.
    pub fn result(&self) -> Option<Value> {
        self.inner.lock().result
    }

    /// Exception of a faulted or canceled task.
    pub fn exception(&self) -> Option<ObjRef> {
        self.inner.lock().exception
    }

    fn finish(&self, status: TaskStatus, result: Option<Value>, exc: Option<ObjRef>) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.status != TaskStatus::Pending {
                // Completion is one-shot; late transitions are dropped.
                return;
            }
            inner.status = status;
            inner.result = result;
            inner.exception = exc;
            core::mem::take(&mut inner.continuations)
        };
        for continuation in drained {
            continuation();
        }
    }

    pub fn complete(&self, result: Option<Value>) {
        self.finish(TaskStatus::Succeeded, result, None);
    }

    pub fn fault(&self, exc: ObjRef) {
        self.finish(TaskStatus::Faulted, None, Some(exc));
    }

    /// Cancel with a token; awaiters observe a cancellation exception
    /// carrying it.
    pub fn cancel(&self, token: u32) {
        self.finish(
            TaskStatus::Canceled,
            None,
            Some(exception::cancellation(token)),
        );
    }

    /// Run `continuation` when the task completes; immediately if it
    /// already has.
    pub fn register_continuation(&self, continuation: Continuation) {
        let run_now = {
            let mut inner = self.inner.lock();
            if inner.status == TaskStatus::Pending {
                inner.continuations.push(continuation);
                None
            } else {
                Some(continuation)
            }
        };
        if let Some(continuation) = run_now {
            continuation();
        }
    }
}
