//! One-shot type-initializer protocol.
//!
//! Each descriptor carries a sentinel: NotRun → Running → Completed or
//! Faulted, advanced by CAS. The initializing thread parks its token in a
//! sidecar slot, so recursive entry from the same thread observes Running
//! and proceeds against the partially initialized state (that tie-break is
//! deliberate; cyclic initializers resolve this way). Any other thread
//! arriving while Running spins until a terminal state.
//!
//! Types flagged before-field-init defer until the first touch of a
//! non-literal static; all other types trigger on any method entry too.

use core::sync::atomic::Ordering;

use crate::arch;
use crate::rt::object::ObjRef;
use crate::rt::types::{TypeDescriptor, TypeInitState};
use crate::rt::current_thread_token;

/// Outcome of an initialization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Initializer has completed (now or earlier), or re-entry proceeded.
    Ready,
    /// A previous run faulted with this exception; uses must re-raise.
    Faulted(Option<ObjRef>),
}

fn state_of(raw: u32) -> TypeInitState {
    match raw {
        0 => TypeInitState::NotRun,
        1 => TypeInitState::Running,
        2 => TypeInitState::Completed,
        _ => TypeInitState::Faulted,
    }
}

/// Ensure the type's initializer has run, invoking `run` if this thread
/// wins the NotRun → Running race. `run` returns the initializer's
/// exception on fault.
pub fn ensure<F>(ty: &'static TypeDescriptor, run: F) -> InitOutcome
where
    F: FnOnce() -> Result<(), ObjRef>,
{
    if ty.initializer().is_none() {
        return InitOutcome::Ready;
    }
    let me = current_thread_token();
    loop {
        match ty.init_state.compare_exchange(
            TypeInitState::NotRun as u32,
            TypeInitState::Running as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                ty.init_owner.store(me, Ordering::Release);
                let result = run();
                let terminal = match result {
                    Ok(()) => TypeInitState::Completed,
                    Err(_) => TypeInitState::Faulted,
                };
                ty.init_owner.store(0, Ordering::Release);
                ty.init_state.store(terminal as u32, Ordering::Release);
                return match result {
                    Ok(()) => InitOutcome::Ready,
                    Err(exc) => InitOutcome::Faulted(Some(exc)),
                };
            }
            Err(observed) => match state_of(observed) {
                TypeInitState::Completed => return InitOutcome::Ready,
                TypeInitState::Faulted => return InitOutcome::Faulted(None),
                TypeInitState::Running => {
                    if ty.init_owner.load(Ordering::Acquire) == me {
                        // Recursive entry: observe the partial state and
                        // proceed.
                        return InitOutcome::Ready;
                    }
                    // Another thread is initializing; wait it out.
                    arch::pause();
                }
                TypeInitState::NotRun => {
                    // Lost a race that then rolled back; retry the CAS.
                }
            },
        }
    }
}

/// Current sentinel state, for diagnostics and tests.
pub fn state(ty: &'static TypeDescriptor) -> TypeInitState {
    state_of(ty.init_state.load(Ordering::Acquire))
}
