//! The JIT code buffer.
//!
//! A contiguous region the compiler appends finished method bodies into.
//! Each method's byte range is written once, patched while still open,
//! then sealed: sealing issues the instruction-stream synchronization and
//! (on bare metal) flips the filled pages from writable/no-execute to
//! execute-only, so a sealed range is immutable before the first caller
//! can reach its pointer.

#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::mm::FRAME_SIZE;

/// Default capacity reserved at JIT bring-up: 2 MiB.
pub const DEFAULT_CAPACITY: usize = 2 * 1024 * 1024;

/// Virtual window the buffer occupies on bare metal.
#[cfg(target_os = "none")]
const JIT_WINDOW_BASE: u64 = 0xFFFF_B000_0000_0000;

#[cfg(target_os = "none")]
static JIT_WINDOW_NEXT: AtomicU64 = AtomicU64::new(JIT_WINDOW_BASE);

pub struct CodeBuffer {
    base: *mut u8,
    capacity: usize,
    used: usize,
    /// Everything below this offset is sealed and immutable.
    sealed: usize,
}

// SAFETY: the buffer is owned by the compiler's lock; raw pointer aside,
// access is serialized.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Reserve a buffer of `capacity` bytes.
    ///
    /// On bare metal the backing frames are mapped writable/no-execute
    /// into the JIT window; sealing flips protection per filled page. On
    /// the host a page-aligned heap allocation stands in (never executed;
    /// the interpreter carries semantics there).
    pub fn new(capacity: usize) -> KernelResult<Self> {
        let capacity = capacity.next_multiple_of(FRAME_SIZE);
        #[cfg(target_os = "none")]
        {
            use crate::mm::{PageFlags, PhysAddr, VirtAddr, FRAME_ALLOCATOR};
            let frames = capacity / FRAME_SIZE;
            let phys = FRAME_ALLOCATOR
                .lock()
                .allocate(frames)
                .ok_or(KernelError::OutOfMemory {
                    requested_frames: frames,
                })?;
            let base =
                JIT_WINDOW_NEXT.fetch_add(capacity as u64, Ordering::AcqRel);
            crate::mm::vmm::with_kernel_space(|vmm, fa| {
                for i in 0..frames {
                    vmm.map_page(
                        fa,
                        VirtAddr::new(base + (i * FRAME_SIZE) as u64),
                        PhysAddr::new(phys.as_u64() + (i * FRAME_SIZE) as u64),
                        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
                    )?;
                }
                Ok(())
            })
            .unwrap_or(Err(KernelError::NotInitialized {
                subsystem: "kernel address space",
            }))?;
            Ok(Self {
                base: base as *mut u8,
                capacity,
                used: 0,
                sealed: 0,
            })
        }
        #[cfg(not(target_os = "none"))]
        {
            use alloc::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(capacity, FRAME_SIZE)
                .map_err(|_| KernelError::InvalidArgument { name: "capacity" })?;
            // SAFETY: non-zero, aligned layout; the buffer lives for the
            // rest of the boot.
            let base = unsafe { alloc_zeroed(layout) };
            if base.is_null() {
                return Err(KernelError::OutOfMemory {
                    requested_frames: capacity / FRAME_SIZE,
                });
            }
            Ok(Self {
                base,
                capacity,
                used: 0,
                sealed: 0,
            })
        }
    }

    /// Append a finished method body; returns its offset.
    pub fn append(&mut self, bytes: &[u8]) -> KernelResult<usize> {
        if self.used + bytes.len() > self.capacity {
            return Err(KernelError::CodeBufferFull {
                needed: bytes.len(),
                available: self.capacity - self.used,
            });
        }
        let offset = self.used;
        // SAFETY: range checked against capacity; region is owned.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(offset),
                bytes.len(),
            );
        }
        self.used += bytes.len();
        Ok(offset)
    }

    /// Absolute address of `offset`.
    pub fn addr(&self, offset: usize) -> usize {
        self.base as usize + offset
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Patch a rel32 call/jump placeholder at `site` to reach `target`.
    pub fn patch_rel32(&mut self, site: usize, target: usize) -> KernelResult<()> {
        if site < self.sealed {
            return Err(KernelError::CodeBufferSealed);
        }
        if site + 4 > self.used {
            return Err(KernelError::InvalidArgument { name: "site" });
        }
        let rel = (target as i64 - (self.addr(site) as i64 + 4)) as i32;
        // SAFETY: bounds checked; the site is an open placeholder.
        unsafe {
            core::ptr::copy_nonoverlapping(
                rel.to_le_bytes().as_ptr(),
                self.base.add(site),
                4,
            );
        }
        Ok(())
    }

    /// Patch an absolute 64-bit immediate at `site`.
    pub fn patch_abs64(&mut self, site: usize, target: usize) -> KernelResult<()> {
        if site < self.sealed {
            return Err(KernelError::CodeBufferSealed);
        }
        if site + 8 > self.used {
            return Err(KernelError::InvalidArgument { name: "site" });
        }
        // SAFETY: bounds checked; the site is an open placeholder.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (target as u64).to_le_bytes().as_ptr(),
                self.base.add(site),
                8,
            );
        }
        Ok(())
    }

    /// Seal everything emitted so far: synchronize the instruction
    /// stream, then retire write permission on every completely filled
    /// page. Later appends land above; the open tail page stays writable
    /// until it fills.
    pub fn seal(&mut self) {
        crate::arch::memory_barrier();
        #[cfg(target_os = "none")]
        {
            use crate::mm::{PageFlags, VirtAddr};
            let first_open_page = self.sealed / FRAME_SIZE;
            let last_full_page = self.used / FRAME_SIZE;
            crate::mm::vmm::with_kernel_space(|vmm, _fa| {
                for page in first_open_page..last_full_page {
                    let virt =
                        VirtAddr::new(self.base as u64 + (page * FRAME_SIZE) as u64);
                    // Execute-only from here on: present, not writable,
                    // NX cleared.
                    let _ = vmm.change_protection(virt, PageFlags::GLOBAL);
                }
            });
        }
        self.sealed = self.used;
    }

    /// Whether `offset` lies in sealed (immutable) territory.
    pub fn is_sealed(&self, offset: usize) -> bool {
        offset < self.sealed
    }
}
