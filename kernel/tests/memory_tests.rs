//! Memory-management integration suites: the physical allocator's
//! contiguity behavior and the VMM's mapping contract, driven end to end
//! against a simulated physical window.

use proton_kernel::mm::{
    FrameAllocator, PageFlags, PhysAddr, Vmm, VirtAddr, FRAME_SIZE, LARGE_PAGE_SIZE,
};

const PHYS_BASE: u64 = 0x10_0000;

struct SimMemory {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl SimMemory {
    fn new(frames: usize) -> Self {
        let layout =
            std::alloc::Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn allocator(&self, frames: usize) -> FrameAllocator {
        let mut fa = FrameAllocator::empty();
        fa.set_direct_map_offset((self.ptr as u64).wrapping_sub(PHYS_BASE));
        unsafe {
            fa.add_region(PhysAddr::new(PHYS_BASE), frames).unwrap();
        }
        fa
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

#[test]
fn freed_middle_run_is_handed_back_contiguously() {
    // Allocate 4 frames, free the middle 2, allocate 2 contiguous:
    // succeeds and returns the freed base.
    let mem = SimMemory::new(16);
    let mut fa = mem.allocator(16);

    let base = fa.allocate(4).expect("4 frames available");
    let middle = PhysAddr::new(base.as_u64() + FRAME_SIZE as u64);
    fa.free(middle, 2).unwrap();

    let again = fa.allocate(2).expect("coalesced middle run");
    assert_eq!(again, middle);
}

#[test]
fn allocator_may_fail_with_free_but_fragmented_frames() {
    let mem = SimMemory::new(8);
    let mut fa = mem.allocator(8);
    let singles: Vec<_> = (0..8).map(|_| fa.allocate(1).unwrap()).collect();
    for frame in singles.iter().step_by(2) {
        fa.free(*frame, 1).unwrap();
    }
    assert_eq!(fa.free_frames(), 4);
    assert!(fa.allocate(2).is_none());
}

#[test]
fn large_page_mapping_walks_back_to_its_target() {
    // Map V=0x0000_0000_0020_0000 to P as a 2 MiB large page with
    // Present|Writable; walk(V) returns an entry whose masked address is
    // P; walk(0) returns 0.
    let mem = SimMemory::new(32);
    let mut fa = mem.allocator(32);
    let mut vmm = Vmm::new(&mut fa).unwrap();

    let virt = VirtAddr::new(0x0000_0000_0020_0000);
    let phys = PhysAddr::new(0x4000_0000);
    vmm.map_large(&mut fa, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
        .unwrap();

    const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    let entry = vmm.walk(virt);
    assert_eq!(entry & PHYS_ADDR_MASK, phys.as_u64());
    assert_ne!(entry & PageFlags::PRESENT.bits(), 0);
    assert_ne!(entry & PageFlags::LARGE.bits(), 0);
    assert_eq!(vmm.walk(VirtAddr::new(0)), 0);
}

#[test]
fn direct_map_invariant_holds_for_allocated_frames() {
    // Every allocated frame is visible in the direct map as
    // present + writable + no-execute.
    const DIRECT_BASE: u64 = 0x5000_0000_0000;
    let mem = SimMemory::new(64);
    let mut fa = mem.allocator(64);
    let mut vmm = Vmm::new(&mut fa).unwrap();

    // A direct-map analog over the simulated window, 4 KiB granularity so
    // the walk sees leaf entries.
    for i in 0..64u64 {
        let phys = PhysAddr::new(PHYS_BASE + i * FRAME_SIZE as u64);
        vmm.map_page(
            &mut fa,
            VirtAddr::new(DIRECT_BASE + phys.as_u64()),
            phys,
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        )
        .unwrap();
    }

    for _ in 0..8 {
        let frame = fa.allocate(1).unwrap();
        let entry = vmm.walk(VirtAddr::new(DIRECT_BASE + frame.as_u64()));
        assert_ne!(entry & PageFlags::PRESENT.bits(), 0);
        assert_ne!(entry & PageFlags::WRITABLE.bits(), 0);
        assert_ne!(entry & PageFlags::NO_EXECUTE.bits(), 0);
    }
}

#[test]
fn null_guard_page_is_never_present() {
    let mem = SimMemory::new(64);
    let mut fa = mem.allocator(64);
    let mut vmm = Vmm::new(&mut fa).unwrap();

    vmm.identity_map_low(&mut fa, 2 * LARGE_PAGE_SIZE as u64, PageFlags::WRITABLE)
        .unwrap();
    vmm.split_null_guard(&mut fa).unwrap();

    assert_eq!(vmm.walk(VirtAddr::new(0)), 0);
    // The rest of the split page stays identity-mapped.
    for i in 1..512u64 {
        let entry = vmm.walk(VirtAddr::new(i * FRAME_SIZE as u64));
        assert_ne!(entry & PageFlags::PRESENT.bits(), 0, "page {} present", i);
    }
}

#[test]
fn change_protection_returns_old_flags_and_distinguishes_unmapped() {
    let mem = SimMemory::new(32);
    let mut fa = mem.allocator(32);
    let mut vmm = Vmm::new(&mut fa).unwrap();

    let virt = VirtAddr::new(0x7000_0000);
    vmm.map_page(
        &mut fa,
        virt,
        PhysAddr::new(0x1000),
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
    )
    .unwrap();

    let old = vmm.change_protection(virt, PageFlags::empty()).unwrap();
    assert!(old.contains(PageFlags::PRESENT | PageFlags::WRITABLE));
    // Unmapped addresses yield an error, not a flag value.
    assert!(vmm
        .change_protection(VirtAddr::new(0xdead_0000), PageFlags::empty())
        .is_err());
}

#[test]
fn translation_fails_outside_the_direct_map() {
    let mem = SimMemory::new(8);
    let fa = mem.allocator(8);
    let inside = fa.phys_to_virt(PhysAddr::new(PHYS_BASE));
    assert_eq!(fa.virt_to_phys(inside), Some(PhysAddr::new(PHYS_BASE)));
    let beyond = VirtAddr::new(inside.as_u64() + (64 * FRAME_SIZE) as u64);
    assert_eq!(fa.virt_to_phys(beyond), None);
}
