//! Managed runtime services.
//!
//! Everything the bytecode execution model needs beyond raw code
//! generation: type descriptors with virtual and interface dispatch, the
//! one-shot type-initializer protocol, object headers and boxing, the
//! exception object model, delegates, and the async state-machine
//! builders. The kernel bridge (`crate::bridge`) is the doorway from this
//! world into kernel primitives.

pub mod builder;
pub mod builtins;
pub mod delegate;
pub mod exception;
pub mod object;
pub mod task;
pub mod typeinit;
pub mod types;

pub use object::ObjRef;
pub use types::{TypeDescriptor, TypeId};

/// Stable token identifying the executing thread for runtime bookkeeping
/// (type-initializer ownership). Kernel threads use their scheduler id; on
/// the host each test thread gets a distinct token.
pub fn current_thread_token() -> u64 {
    #[cfg(target_os = "none")]
    {
        crate::sched::current_thread_id().unwrap_or(0)
    }
    #[cfg(not(target_os = "none"))]
    {
        use core::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        std::thread_local! {
            static TOKEN: u64 = NEXT.fetch_add(1, Ordering::AcqRel);
        }
        TOKEN.with(|t| *t)
    }
}
