//! ProtonOS Kernel Library
//!
//! Core of a single-address-space, ring-0 operating system whose defining
//! subsystem is a managed-bytecode execution environment: physical and
//! virtual memory management, a preemptive scheduler, a single-pass JIT
//! with an architecture-neutral emitter, the managed runtime services
//! (type initialization, dispatch, boxing, exceptions, async builders),
//! and the kernel bridge that binds managed call sites to native entry
//! points at compile time.
//!
//! The crate compiles for two targets: bare metal (`target_os = "none"`),
//! where the privileged paths are real, and the build host, where the same
//! logic runs against simulated architecture capabilities so it can be
//! exercised by the standard test harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// On bare metal the kernel heap backs the global allocator. On the host the
// system allocator is used so test code allocates normally.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global allocator
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod bridge;
pub mod error;
pub mod irq;
pub mod jit;
pub mod logger;
pub mod mm;
pub mod rt;
pub mod sched;
pub mod sync;
pub mod timer;

// Re-export memory management for tests
pub use mm::{PageFlags, PageSize, PhysAddr, VirtAddr, FRAME_SIZE};
// Re-export scheduler items for tests
pub use sched::{ThreadId, ThreadState};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
