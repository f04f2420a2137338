//! Physical frame allocator.
//!
//! A single free list ordered by base address, coalescing on free. The
//! bookkeeping lives in the first two words of each free run (frame count
//! and the physical address of the next run), reached through the direct
//! map; there is no separate metadata array. Every free frame is reachable
//! from exactly one list node, an allocated frame from none.
//!
//! The allocator never panics on exhaustion: `allocate` returns `None` and
//! the caller propagates. It is permitted to fail even when free frames
//! exist, if no run of the requested length does.

use crate::error::{KernelError, KernelResult};
use crate::mm::{PhysAddr, VirtAddr, FRAME_SIZE};
use crate::sync::IrqMutex;

/// Bookkeeping threaded through the leading bytes of every free run.
#[repr(C)]
struct FreeRun {
    /// Number of contiguous frames in this run.
    frames: u64,
    /// Physical address of the next run, 0 terminates the list.
    next: u64,
}

/// Free-list physical allocator over a window of the direct map.
pub struct FrameAllocator {
    /// Physical address of the first free run; 0 when empty.
    head: u64,
    /// virt = phys + offset for every frame this allocator owns.
    direct_map_offset: u64,
    /// Exclusive upper bound of seeded physical memory.
    phys_limit: u64,
    total_frames: usize,
    free_frames: usize,
}

impl FrameAllocator {
    /// An allocator that owns no memory yet.
    pub const fn empty() -> Self {
        Self {
            head: 0,
            direct_map_offset: 0,
            phys_limit: 0,
            total_frames: 0,
            free_frames: 0,
        }
    }

    /// Set the direct-map offset before any region is added.
    ///
    /// On bare metal this is [`super::DIRECT_MAP_BASE`]; tests hand in the
    /// distance between a simulated physical base and a host buffer.
    pub fn set_direct_map_offset(&mut self, offset: u64) {
        debug_assert_eq!(self.head, 0, "offset change with live free list");
        self.direct_map_offset = offset;
    }

    fn run_at(&self, phys: u64) -> *mut FreeRun {
        (phys.wrapping_add(self.direct_map_offset)) as *mut FreeRun
    }

    /// Seed the allocator with a usable region from the firmware memory map.
    ///
    /// # Safety
    /// The region must be frame-aligned, unused RAM, reachable through the
    /// configured direct-map offset, and disjoint from every region added
    /// before.
    pub unsafe fn add_region(&mut self, base: PhysAddr, frames: usize) -> KernelResult<()> {
        if !base.is_frame_aligned() {
            return Err(KernelError::Misaligned {
                addr: base.as_u64(),
                align: FRAME_SIZE as u64,
            });
        }
        if frames == 0 {
            return Err(KernelError::InvalidArgument { name: "frames" });
        }
        self.total_frames += frames;
        let end = base.as_u64() + (frames * FRAME_SIZE) as u64;
        if end > self.phys_limit {
            self.phys_limit = end;
        }
        // SAFETY: caller contract; the run header lands inside the region.
        unsafe { self.insert_run(base.as_u64(), frames as u64) };
        self.free_frames += frames;
        Ok(())
    }

    /// Allocate `count` contiguous aligned frames. First-fit over the
    /// sorted free list; splits the front of the first run that is long
    /// enough.
    pub fn allocate(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let want = count as u64;
        let mut prev: u64 = 0;
        let mut cur = self.head;
        while cur != 0 {
            // SAFETY: list nodes are headers of free runs we own.
            let run = unsafe { &mut *self.run_at(cur) };
            if run.frames >= want {
                let next = run.next;
                let remaining = run.frames - want;
                let successor = if remaining > 0 {
                    let rest = cur + want * FRAME_SIZE as u64;
                    // SAFETY: `rest` is inside the same free run.
                    unsafe {
                        let rest_run = &mut *self.run_at(rest);
                        rest_run.frames = remaining;
                        rest_run.next = next;
                    }
                    rest
                } else {
                    next
                };
                if prev == 0 {
                    self.head = successor;
                } else {
                    // SAFETY: prev is a live list node.
                    unsafe { (*self.run_at(prev)).next = successor };
                }
                self.free_frames -= count;
                return Some(PhysAddr::new(cur));
            }
            prev = cur;
            cur = run.next;
        }
        None
    }

    /// Return `count` frames starting at `base`. The frames must have been
    /// a prior allocation of at least `count`; partial frees are forbidden.
    pub fn free(&mut self, base: PhysAddr, count: usize) -> KernelResult<()> {
        if !base.is_frame_aligned() {
            return Err(KernelError::Misaligned {
                addr: base.as_u64(),
                align: FRAME_SIZE as u64,
            });
        }
        if count == 0 {
            return Err(KernelError::InvalidArgument { name: "count" });
        }
        // SAFETY: per the contract the run is allocated memory we own.
        unsafe { self.insert_run(base.as_u64(), count as u64) };
        self.free_frames += count;
        Ok(())
    }

    /// Insert a run sorted by base address, coalescing with both neighbors.
    ///
    /// # Safety
    /// The run must be owned, unused memory reachable via the direct map.
    unsafe fn insert_run(&mut self, base: u64, frames: u64) {
        let bytes = frames * FRAME_SIZE as u64;
        let mut prev: u64 = 0;
        let mut cur = self.head;
        while cur != 0 && cur < base {
            // SAFETY: live list node.
            prev = cur;
            cur = unsafe { (*self.run_at(cur)).next };
        }
        debug_assert_ne!(cur, base, "double free of frame run");

        // SAFETY: writing the header into the first words of the freed run.
        unsafe {
            let run = &mut *self.run_at(base);
            run.frames = frames;
            run.next = cur;

            // Coalesce forward.
            if cur != 0 && base + bytes == cur {
                let next_run = &*self.run_at(cur);
                run.frames += next_run.frames;
                run.next = next_run.next;
            }

            if prev == 0 {
                self.head = base;
            } else {
                let prev_run = &mut *self.run_at(prev);
                // Coalesce backward.
                if prev + prev_run.frames * FRAME_SIZE as u64 == base {
                    prev_run.frames += run.frames;
                    prev_run.next = run.next;
                } else {
                    prev_run.next = base;
                }
            }
        }
    }

    /// Translate a physical frame address into the direct map.
    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.as_u64().wrapping_add(self.direct_map_offset))
    }

    /// Inverse of [`Self::phys_to_virt`]; `None` for addresses outside the
    /// direct map window.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let phys = virt.as_u64().checked_sub(self.direct_map_offset)?;
        (phys < self.phys_limit).then(|| PhysAddr::new(phys))
    }

    /// The configured direct-map offset (virt − phys).
    pub fn direct_map_offset(&self) -> u64 {
        self.direct_map_offset
    }

    /// Exclusive upper bound of seeded physical memory.
    pub fn phys_limit(&self) -> u64 {
        self.phys_limit
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }
}

/// The system allocator. Mutated only inside an interrupt-disabling
/// critical section; the lock wrapper enforces that.
pub static FRAME_ALLOCATOR: IrqMutex<FrameAllocator> = IrqMutex::new(FrameAllocator::empty());

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};

    /// A simulated window of physical memory backed by a host allocation.
    /// `phys` addresses start at `PHYS_BASE` and map into the buffer.
    pub(crate) struct SimMemory {
        pub ptr: *mut u8,
        layout: Layout,
        pub frames: usize,
    }

    pub(crate) const PHYS_BASE: u64 = 0x10_0000;

    impl SimMemory {
        pub fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE).unwrap();
            // SAFETY: layout is non-zero.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self {
                ptr,
                layout,
                frames,
            }
        }

        pub fn offset(&self) -> u64 {
            (self.ptr as u64).wrapping_sub(PHYS_BASE)
        }

        pub fn allocator(&self) -> FrameAllocator {
            let mut fa = FrameAllocator::empty();
            fa.set_direct_map_offset(self.offset());
            // SAFETY: the buffer is owned, aligned, zeroed and disjoint.
            unsafe {
                fa.add_region(PhysAddr::new(PHYS_BASE), self.frames).unwrap();
            }
            fa
        }
    }

    impl Drop for SimMemory {
        fn drop(&mut self) {
            // SAFETY: allocated with the stored layout.
            unsafe { dealloc(self.ptr, self.layout) }
        }
    }

    #[test]
    fn allocate_and_exhaust() {
        let mem = SimMemory::new(8);
        let mut fa = mem.allocator();
        assert_eq!(fa.free_frames(), 8);
        let a = fa.allocate(8).unwrap();
        assert_eq!(a.as_u64(), PHYS_BASE);
        assert_eq!(fa.free_frames(), 0);
        assert!(fa.allocate(1).is_none());
    }

    #[test]
    fn free_coalesces_with_both_neighbors() {
        let mem = SimMemory::new(16);
        let mut fa = mem.allocator();
        let a = fa.allocate(4).unwrap();
        let b = fa.allocate(4).unwrap();
        let c = fa.allocate(4).unwrap();
        fa.free(a, 4).unwrap();
        fa.free(c, 4).unwrap();
        fa.free(b, 4).unwrap();
        // Everything coalesced back into one run.
        let whole = fa.allocate(16).unwrap();
        assert_eq!(whole.as_u64(), PHYS_BASE);
    }

    #[test]
    fn freed_middle_pair_is_reallocated_contiguously() {
        // Allocate 4 frames, free the middle 2, allocate 2 contiguous:
        // succeeds and returns the freed base.
        let mem = SimMemory::new(8);
        let mut fa = mem.allocator();
        let base = fa.allocate(4).unwrap();
        let middle = PhysAddr::new(base.as_u64() + FRAME_SIZE as u64);
        fa.free(middle, 2).unwrap();
        let again = fa.allocate(2).unwrap();
        assert_eq!(again, middle);
    }

    #[test]
    fn fragmentation_fails_contiguous_requests() {
        let mem = SimMemory::new(8);
        let mut fa = mem.allocator();
        let runs: alloc::vec::Vec<_> = (0..8).map(|_| fa.allocate(1).unwrap()).collect();
        // Free every other frame: 4 free frames, no run of 2.
        for r in runs.iter().step_by(2) {
            fa.free(*r, 1).unwrap();
        }
        assert_eq!(fa.free_frames(), 4);
        assert!(fa.allocate(2).is_none());
        assert!(fa.allocate(1).is_some());
    }

    #[test]
    fn translation_round_trips_and_rejects_outside() {
        let mem = SimMemory::new(4);
        let fa = mem.allocator();
        let p = PhysAddr::new(PHYS_BASE + FRAME_SIZE as u64);
        let v = fa.phys_to_virt(p);
        assert_eq!(fa.virt_to_phys(v), Some(p));
        // One past the window.
        let beyond = fa.phys_to_virt(PhysAddr::new(PHYS_BASE + (4 * FRAME_SIZE) as u64));
        assert_eq!(fa.virt_to_phys(beyond), None);
    }

    #[test]
    fn misaligned_free_is_rejected() {
        let mem = SimMemory::new(4);
        let mut fa = mem.allocator();
        let err = fa.free(PhysAddr::new(PHYS_BASE + 1), 1).unwrap_err();
        assert_eq!(
            err,
            KernelError::Misaligned {
                addr: PHYS_BASE + 1,
                align: FRAME_SIZE as u64
            }
        );
    }
}
