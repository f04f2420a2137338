//! Async state-machine builders.
//!
//! A builder owns the task handle for one asynchronous method. `start`
//! runs the state machine synchronously until it completes or reports its
//! first suspension; at that point the frame (a value) is boxed so it
//! outlives the native call, and the boxed frame's resumption is
//! registered with the awaited task as a continuation. Subsequent
//! resumptions are driven entirely by awaiter completions.
//!
//! Five variants exist: void, Task, Task-of-T, ValueTask and
//! ValueTask-of-T. The ValueTask builders short-circuit: a result set
//! before any suspension is carried inline and no task object is
//! allocated; after the first suspension the inline path is permanently
//! off, so a stale synchronous result can never be observed.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::jit::il::Value;
use crate::rt::object::ObjRef;
use crate::rt::task::{ManagedTask, TaskRef, TaskStatus};

/// What one step of a state machine did.
pub enum Step {
    /// The machine finished with a result (None for void/Task shapes).
    Done(Option<Value>),
    /// The machine finished by throwing.
    Threw(ObjRef),
    /// The machine must suspend until this awaitable completes.
    Await(TaskRef),
}

/// An async method frame: a value type advanced by `move_next`. The frame
/// is `Clone` because boxing at the first suspension copies it out of the
/// caller's stack, exactly once.
pub trait StateMachine: Send + 'static {
    fn move_next(&mut self) -> Step;
}

type BoxedFrame = Arc<Mutex<dyn StateMachine>>;

/// State shared by every builder variant.
struct BuilderCore {
    task: TaskRef,
    boxed: Mutex<Option<BoxedFrame>>,
    suspended: AtomicBool,
}

impl BuilderCore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            task: ManagedTask::pending(),
            boxed: Mutex::new(None),
            suspended: AtomicBool::new(false),
        })
    }

    fn finish(&self, step: &Step) {
        match step {
            Step::Done(result) => self.task.complete(*result),
            Step::Threw(exc) => self.task.fault(*exc),
            Step::Await(_) => unreachable!("finish on a suspending step"),
        }
    }
}

/// Run the boxed frame one step; re-register on suspension, finish the
/// task otherwise. The lock is released before acting on the step, so a
/// continuation firing inline can re-enter the frame.
fn drive(core: Arc<BuilderCore>, frame: BoxedFrame) {
    let step = frame.lock().move_next();
    match step {
        Step::Await(awaiter) => {
            let core2 = Arc::clone(&core);
            let frame2 = Arc::clone(&frame);
            awaiter.register_continuation(alloc::boxed::Box::new(move || {
                drive(core2, frame2);
            }));
        }
        step => core.finish(&step),
    }
}

/// Synchronous first execution shared by all variants. Returns `true` when
/// the machine completed without suspending.
fn start_core<S: StateMachine + Clone>(core: &Arc<BuilderCore>, machine: &mut S) -> bool {
    match machine.move_next() {
        Step::Await(awaiter) => {
            core.suspended.store(true, Ordering::Release);
            // First suspension: the frame escapes to the heap.
            let frame: BoxedFrame = Arc::new(Mutex::new(machine.clone()));
            *core.boxed.lock() = Some(Arc::clone(&frame));
            let core2 = Arc::clone(core);
            awaiter.register_continuation(alloc::boxed::Box::new(move || {
                drive(core2, frame);
            }));
            false
        }
        step => {
            core.finish(&step);
            true
        }
    }
}

macro_rules! builder_common {
    () => {
        /// `create`: a fresh builder owning a pending handle.
        pub fn create() -> Self {
            Self {
                core: BuilderCore::new(),
            }
        }

        /// `start`: run the state machine synchronously once; resumptions
        /// are driven by awaiter completions.
        pub fn start<S: StateMachine + Clone>(&self, machine: &mut S) {
            start_core(&self.core, machine);
        }

        /// `set_state_machine`: identity bookkeeping hook; the frame is
        /// already boxed by the first suspension.
        pub fn set_state_machine(&self, _frame: &dyn StateMachine) {}

        /// `set_exception`: fault the operation.
        pub fn set_exception(&self, exc: ObjRef) {
            self.core.task.fault(exc);
        }

        /// Register `continuation` to run when the operation completes
        /// (await-completion registration).
        pub fn on_completed(&self, continuation: crate::rt::task::Continuation) {
            self.core.task.register_continuation(continuation);
        }
    };
}

// ---------------------------------------------------------------------------
// Task-returning builders
// ---------------------------------------------------------------------------

/// Builder for `async void`: no handle escapes; faults are logged since no
/// awaiter can observe them.
#[derive(Clone)]
pub struct AsyncVoidBuilder {
    core: Arc<BuilderCore>,
}

impl AsyncVoidBuilder {
    builder_common!();

    pub fn set_result(&self) {
        self.core.task.complete(None);
    }

    /// Whether the operation has finished; void methods expose nothing
    /// else.
    pub fn is_completed(&self) -> bool {
        if self.core.task.status() == TaskStatus::Faulted {
            log::error!("unobserved async-void fault");
        }
        self.core.task.is_completed()
    }
}

/// Builder for `async Task`.
#[derive(Clone)]
pub struct AsyncTaskBuilder {
    core: Arc<BuilderCore>,
}

impl AsyncTaskBuilder {
    builder_common!();

    pub fn set_result(&self) {
        self.core.task.complete(None);
    }

    /// The Task handle this builder owns.
    pub fn task(&self) -> TaskRef {
        Arc::clone(&self.core.task)
    }
}

/// Builder for `async Task<T>`.
#[derive(Clone)]
pub struct AsyncTaskOfBuilder {
    core: Arc<BuilderCore>,
}

impl AsyncTaskOfBuilder {
    builder_common!();

    pub fn set_result(&self, value: Value) {
        self.core.task.complete(Some(value));
    }

    pub fn task(&self) -> TaskRef {
        Arc::clone(&self.core.task)
    }
}

// ---------------------------------------------------------------------------
// ValueTask builders
// ---------------------------------------------------------------------------

/// Handle produced by the ValueTask builders: either an inline result
/// (no allocation happened) or a real task.
pub enum ValueTask {
    Inline(Option<Value>),
    Pending(TaskRef),
}

impl ValueTask {
    pub fn is_completed(&self) -> bool {
        match self {
            ValueTask::Inline(_) => true,
            ValueTask::Pending(task) => task.is_completed(),
        }
    }

    pub fn result(&self) -> Option<Value> {
        match self {
            ValueTask::Inline(v) => *v,
            ValueTask::Pending(task) => task.result(),
        }
    }
}

/// Builder for `async ValueTask` / `async ValueTask<T>`. The -of-T shape
/// is the same machinery with a typed `set_result`.
#[derive(Clone)]
pub struct AsyncValueTaskBuilder {
    core: Arc<BuilderCore>,
}

impl AsyncValueTaskBuilder {
    builder_common!();

    pub fn set_result(&self, value: Option<Value>) {
        self.core.task.complete(value);
    }

    /// The handle: inline iff the result arrived with no suspension ever
    /// having occurred.
    pub fn value_task(&self) -> ValueTask {
        let never_suspended = !self.core.suspended.load(Ordering::Acquire);
        if never_suspended && self.core.task.status() == TaskStatus::Succeeded {
            ValueTask::Inline(self.core.task.result())
        } else {
            ValueTask::Pending(Arc::clone(&self.core.task))
        }
    }
}

/// Builder for `async ValueTask<T>`.
#[derive(Clone)]
pub struct AsyncValueTaskOfBuilder {
    core: Arc<BuilderCore>,
}

impl AsyncValueTaskOfBuilder {
    builder_common!();

    pub fn set_result(&self, value: Value) {
        self.core.task.complete(Some(value));
    }

    pub fn value_task(&self) -> ValueTask {
        let never_suspended = !self.core.suspended.load(Ordering::Acquire);
        if never_suspended && self.core.task.status() == TaskStatus::Succeeded {
            ValueTask::Inline(self.core.task.result())
        } else {
            ValueTask::Pending(Arc::clone(&self.core.task))
        }
    }
}
