//! Kernel heap bring-up.
//!
//! The heap is a contiguous run of physical frames reached through the
//! direct map; `linked_list_allocator` manages it behind the global
//! allocator installed in `lib.rs`. On the host the system allocator is in
//! charge and this module is inert.

use crate::error::KernelResult;

/// Default heap size: 16 MiB.
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Allocate the heap frames and hand them to the global allocator.
///
/// Must run after the frame allocator is seeded and the direct map is
/// live, and before the first `alloc` use.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    use crate::error::KernelError;
    use crate::mm::{FRAME_ALLOCATOR, FRAME_SIZE};

    let frames = HEAP_SIZE / FRAME_SIZE;
    let mut fa = FRAME_ALLOCATOR.lock();
    let base = fa.allocate(frames).ok_or(KernelError::OutOfMemory {
        requested_frames: frames,
    })?;
    let virt = fa.phys_to_virt(base);
    // SAFETY: the run was just allocated, is mapped writable in the direct
    // map, and is handed to the heap exactly once.
    unsafe {
        crate::get_allocator()
            .lock()
            .init(virt.as_u64() as *mut u8, HEAP_SIZE);
    }
    log::info!(
        "heap: {} KiB at {:#x}",
        HEAP_SIZE / 1024,
        virt.as_u64()
    );
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() -> KernelResult<()> {
    Ok(())
}
