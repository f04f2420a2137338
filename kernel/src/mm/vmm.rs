//! Virtual memory manager.
//!
//! Owns a root page table and satisfies mapping requests at 4 KiB and
//! 2 MiB granularity. Intermediate tables are created on demand from the
//! frame allocator, owned by the tree, and reclaimed when a subtree
//! becomes empty. The manager also performs the one narrow structural
//! transition the kernel needs: splitting the 2 MiB identity page covering
//! address 0 into 4 KiB pages so the null-guard page can be left
//! non-present.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::{PageTable, PAGE_TABLE_ENTRIES};
use crate::mm::{
    FrameAllocator, PageFlags, PhysAddr, VirtAddr, DIRECT_MAP_BASE, FRAME_SIZE, LARGE_PAGE_SIZE,
};
use crate::sync::IrqMutex;

/// Base of the bump-allocated MMIO remap window.
const MMIO_WINDOW_BASE: u64 = 0xFFFF_A000_0000_0000;

static MMIO_WINDOW_NEXT: AtomicU64 = AtomicU64::new(MMIO_WINDOW_BASE);

/// Flags for entries that point at a next-level table.
fn table_flags() -> PageFlags {
    PageFlags::PRESENT | PageFlags::WRITABLE
}

/// A 4-level address space rooted at one physical frame.
pub struct Vmm {
    root: PhysAddr,
    /// virt = phys + offset; how this manager reaches table frames.
    direct_map_offset: u64,
}

impl Vmm {
    /// Allocate and zero a root table.
    pub fn new(fa: &mut FrameAllocator) -> KernelResult<Self> {
        let offset = fa.direct_map_offset();
        let root = Self::alloc_table(fa)?;
        Ok(Self {
            root,
            direct_map_offset: offset,
        })
    }

    fn alloc_table(fa: &mut FrameAllocator) -> KernelResult<PhysAddr> {
        let frame = fa.allocate(1).ok_or(KernelError::OutOfMemory {
            requested_frames: 1,
        })?;
        let virt = fa.phys_to_virt(frame);
        // SAFETY: a freshly allocated frame, reached via the direct map.
        unsafe {
            (*(virt.as_u64() as *mut PageTable)).zero();
        }
        Ok(frame)
    }

    /// Wrap an already-live page-table tree (the one the boot hand-off
    /// left in CR3) so the kernel mutates it in place instead of
    /// rebuilding the world mid-flight.
    ///
    /// # Safety
    /// `root` must be the physical base of the active 4-level tree and
    /// every table frame must be visible through `direct_map_offset`.
    pub unsafe fn adopt(root: PhysAddr, direct_map_offset: u64) -> Self {
        Self {
            root,
            direct_map_offset,
        }
    }

    /// Physical base of the root table (the CR3 value).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    fn table_mut(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: table frames are owned by this tree and live in the
        // direct map for the life of the address space.
        unsafe { &mut *((phys.as_u64() + self.direct_map_offset) as *mut PageTable) }
    }

    /// Next-level table under `table[index]`, creating it when absent.
    fn ensure_table(
        &mut self,
        fa: &mut FrameAllocator,
        table: PhysAddr,
        index: usize,
    ) -> KernelResult<PhysAddr> {
        let entry = &mut self.table_mut(table)[index];
        if entry.is_present() {
            if entry.is_large() {
                return Err(KernelError::AlreadyMapped {
                    addr: entry.addr().as_u64(),
                });
            }
            return Ok(entry.addr());
        }
        let next = Self::alloc_table(fa)?;
        self.table_mut(table)[index].set(next, table_flags());
        Ok(next)
    }

    /// Map one 4 KiB page. Fails if either address is not page-aligned or
    /// the slot is already occupied.
    pub fn map_page(
        &mut self,
        fa: &mut FrameAllocator,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if !virt.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: virt.as_u64(),
                align: FRAME_SIZE as u64,
            });
        }
        if !phys.is_frame_aligned() {
            return Err(KernelError::Misaligned {
                addr: phys.as_u64(),
                align: FRAME_SIZE as u64,
            });
        }
        let p3 = self.ensure_table(fa, self.root, virt.p4_index())?;
        let p2 = self.ensure_table(fa, p3, virt.p3_index())?;
        let p1 = self.ensure_table(fa, p2, virt.p2_index())?;
        let entry = &mut self.table_mut(p1)[virt.p1_index()];
        if entry.is_present() {
            return Err(KernelError::AlreadyMapped {
                addr: virt.as_u64(),
            });
        }
        entry.set(phys, flags | PageFlags::PRESENT);
        arch::flush_tlb_entry(virt.as_u64());
        Ok(())
    }

    /// Map one 2 MiB large page as a leaf at level 2.
    pub fn map_large(
        &mut self,
        fa: &mut FrameAllocator,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if !virt.is_large_aligned() {
            return Err(KernelError::Misaligned {
                addr: virt.as_u64(),
                align: LARGE_PAGE_SIZE as u64,
            });
        }
        if !phys.is_large_aligned() {
            return Err(KernelError::Misaligned {
                addr: phys.as_u64(),
                align: LARGE_PAGE_SIZE as u64,
            });
        }
        let p3 = self.ensure_table(fa, self.root, virt.p4_index())?;
        let p2 = self.ensure_table(fa, p3, virt.p3_index())?;
        let entry = &mut self.table_mut(p2)[virt.p2_index()];
        if entry.is_present() {
            return Err(KernelError::AlreadyMapped {
                addr: virt.as_u64(),
            });
        }
        entry.set(phys, flags | PageFlags::PRESENT | PageFlags::LARGE);
        arch::flush_tlb_entry(virt.as_u64());
        Ok(())
    }

    /// Locate the leaf entry covering `virt`, if any. Returns the table and
    /// index so callers can mutate, plus whether it is a large leaf.
    fn find_leaf(&self, virt: VirtAddr) -> Option<(PhysAddr, usize, bool)> {
        let root = self.table_mut(self.root);
        let e4 = &root[virt.p4_index()];
        if !e4.is_present() {
            return None;
        }
        let p3 = e4.addr();
        let e3 = &self.table_mut(p3)[virt.p3_index()];
        if !e3.is_present() {
            return None;
        }
        let p2 = e3.addr();
        let e2 = &self.table_mut(p2)[virt.p2_index()];
        if !e2.is_present() {
            return None;
        }
        if e2.is_large() {
            return Some((p2, virt.p2_index(), true));
        }
        let p1 = e2.addr();
        let e1 = &self.table_mut(p1)[virt.p1_index()];
        if !e1.is_present() {
            return None;
        }
        Some((p1, virt.p1_index(), false))
    }

    /// Clear the leaf mapping `virt` and flush its TLB entry. Empty
    /// intermediate tables are returned to the frame allocator.
    pub fn unmap(&mut self, fa: &mut FrameAllocator, virt: VirtAddr) -> KernelResult<PhysAddr> {
        let (table, index, _large) = self.find_leaf(virt).ok_or(KernelError::NotMapped {
            addr: virt.as_u64(),
        })?;
        let entry = &mut self.table_mut(table)[index];
        let phys = entry.addr();
        entry.clear();
        arch::flush_tlb_entry(virt.as_u64());
        self.reclaim_empty_tables(fa, virt);
        Ok(phys)
    }

    /// Walk the path to `virt` and free any table that became empty,
    /// clearing its parent entry. The root is never freed.
    fn reclaim_empty_tables(&mut self, fa: &mut FrameAllocator, virt: VirtAddr) {
        let root = self.root;
        let e4 = self.table_mut(root)[virt.p4_index()];
        if !e4.is_present() || e4.is_large() {
            return;
        }
        let p3 = e4.addr();
        let e3 = self.table_mut(p3)[virt.p3_index()];
        if e3.is_present() && !e3.is_large() {
            let p2 = e3.addr();
            let e2 = self.table_mut(p2)[virt.p2_index()];
            if e2.is_present() && !e2.is_large() {
                let p1 = e2.addr();
                if self.table_mut(p1).is_empty() {
                    self.table_mut(p2)[virt.p2_index()].clear();
                    let _ = fa.free(p1, 1);
                }
            }
            if self.table_mut(p2).is_empty() {
                self.table_mut(p3)[virt.p3_index()].clear();
                let _ = fa.free(p2, 1);
            }
        }
        if self.table_mut(p3).is_empty() {
            self.table_mut(root)[virt.p4_index()].clear();
            let _ = fa.free(p3, 1);
        }
    }

    /// Swap the protection flags on an existing leaf; returns the previous
    /// flags. The mapping target and leaf size are preserved.
    pub fn change_protection(
        &mut self,
        virt: VirtAddr,
        flags: PageFlags,
    ) -> KernelResult<PageFlags> {
        let (table, index, large) = self.find_leaf(virt).ok_or(KernelError::NotMapped {
            addr: virt.as_u64(),
        })?;
        let entry = &mut self.table_mut(table)[index];
        let old = entry.flags();
        let phys = entry.addr();
        let mut new = flags | PageFlags::PRESENT;
        if large {
            new |= PageFlags::LARGE;
        }
        entry.set(phys, new);
        arch::flush_tlb_entry(virt.as_u64());
        Ok(old)
    }

    /// The raw leaf entry covering `virt`, or 0 when unmapped.
    pub fn walk(&self, virt: VirtAddr) -> u64 {
        match self.find_leaf(virt) {
            Some((table, index, _)) => self.table_mut(table)[index].raw(),
            None => 0,
        }
    }

    /// Identity-map `[0, limit)` with 2 MiB pages.
    pub fn identity_map_low(
        &mut self,
        fa: &mut FrameAllocator,
        limit: u64,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let mut addr = 0u64;
        while addr < limit {
            self.map_large(fa, VirtAddr::new(addr), PhysAddr::new(addr), flags)?;
            addr += LARGE_PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Map all physical memory up to `phys_limit` into the higher-half
    /// direct map, writable and non-executable.
    pub fn map_direct(&mut self, fa: &mut FrameAllocator, phys_limit: u64) -> KernelResult<()> {
        let flags = PageFlags::WRITABLE | PageFlags::NO_EXECUTE | PageFlags::GLOBAL;
        let mut addr = 0u64;
        while addr < phys_limit {
            self.map_large(
                fa,
                VirtAddr::new(DIRECT_MAP_BASE + addr),
                PhysAddr::new(addr),
                flags,
            )?;
            addr += LARGE_PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Split the 2 MiB identity page at address 0 into 512 4 KiB pages:
    /// entry 0 stays non-present (the null guard), entries 1..511 become
    /// present-writable. A full TLB flush follows.
    pub fn split_null_guard(&mut self, fa: &mut FrameAllocator) -> KernelResult<()> {
        let zero = VirtAddr::new(0);
        let p3 = self.ensure_table(fa, self.root, zero.p4_index())?;
        let e2 = {
            let entry = &self.table_mut(p3)[zero.p3_index()];
            if !entry.is_present() {
                return Err(KernelError::NotMapped { addr: 0 });
            }
            entry.addr()
        };
        let first = self.table_mut(e2)[0];
        if !first.is_large() {
            // Already split; idempotent by construction.
            return Ok(());
        }
        let l1 = Self::alloc_table(fa)?;
        {
            let table = self.table_mut(l1);
            for i in 1..PAGE_TABLE_ENTRIES {
                table[i].set(
                    PhysAddr::new((i * FRAME_SIZE) as u64),
                    PageFlags::PRESENT | PageFlags::WRITABLE,
                );
            }
            // Entry 0 stays clear: dereferencing null faults forever.
        }
        self.table_mut(e2)[0].set(l1, table_flags());
        arch::flush_tlb_all();
        Ok(())
    }

    /// Map a physical MMIO window uncacheable and return its virtual base.
    pub fn map_mmio(
        &mut self,
        fa: &mut FrameAllocator,
        phys: PhysAddr,
        len: usize,
    ) -> KernelResult<VirtAddr> {
        if !phys.is_frame_aligned() {
            return Err(KernelError::Misaligned {
                addr: phys.as_u64(),
                align: FRAME_SIZE as u64,
            });
        }
        let pages = len.div_ceil(FRAME_SIZE);
        let base = MMIO_WINDOW_NEXT.fetch_add((pages * FRAME_SIZE) as u64, Ordering::AcqRel);
        let flags = PageFlags::WRITABLE | PageFlags::NO_CACHE | PageFlags::NO_EXECUTE;
        for i in 0..pages {
            self.map_page(
                fa,
                VirtAddr::new(base + (i * FRAME_SIZE) as u64),
                PhysAddr::new(phys.as_u64() + (i * FRAME_SIZE) as u64),
                flags,
            )?;
        }
        Ok(VirtAddr::new(base))
    }

    /// Tear down an MMIO window established by [`Self::map_mmio`].
    pub fn unmap_mmio(
        &mut self,
        fa: &mut FrameAllocator,
        virt: VirtAddr,
        len: usize,
    ) -> KernelResult<()> {
        let pages = len.div_ceil(FRAME_SIZE);
        for i in 0..pages {
            self.unmap(fa, VirtAddr::new(virt.as_u64() + (i * FRAME_SIZE) as u64))?;
        }
        Ok(())
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    /// The tree must map the kernel's code, data and stacks at their
    /// current addresses, or the next instruction fetch faults.
    pub unsafe fn activate(&self) {
        // SAFETY: forwarded contract.
        unsafe { arch::write_cr3(self.root.as_u64()) }
    }
}

/// The kernel address space, established once paging is live.
pub static KERNEL_SPACE: IrqMutex<Option<Vmm>> = IrqMutex::new(None);

/// Run `f` against the kernel address space.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut Vmm, &mut FrameAllocator) -> R) -> Option<R> {
    let mut fa = super::FRAME_ALLOCATOR.lock();
    let mut space = KERNEL_SPACE.lock();
    space.as_mut().map(|vmm| f(vmm, &mut fa))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::tests::SimMemory;

    fn setup(frames: usize) -> (SimMemory, FrameAllocator) {
        let mem = SimMemory::new(frames);
        let fa = mem.allocator();
        (mem, fa)
    }

    #[test]
    fn map_walk_unmap_small_page() {
        let (_mem, mut fa) = setup(32);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        let virt = VirtAddr::new(0x4000_0000);
        let phys = fa.allocate(1).unwrap();

        vmm.map_page(&mut fa, virt, phys, PageFlags::WRITABLE).unwrap();
        let entry = vmm.walk(virt);
        assert_ne!(entry, 0);
        assert_eq!(entry & crate::mm::page_table::PHYS_ADDR_MASK, phys.as_u64());
        assert_ne!(entry & PageFlags::PRESENT.bits(), 0);

        assert_eq!(vmm.unmap(&mut fa, virt).unwrap(), phys);
        assert_eq!(vmm.walk(virt), 0);
    }

    #[test]
    fn large_page_round_trip() {
        // Map V=0x0000_0000_0020_0000 to P as a 2 MiB page; walk returns an
        // entry whose masked address is P; walk(0) returns 0.
        let (_mem, mut fa) = setup(16);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        let virt = VirtAddr::new(0x0000_0000_0020_0000);
        let phys = PhysAddr::new(0x4000_0000);

        vmm.map_large(
            &mut fa,
            virt,
            phys,
            PageFlags::PRESENT | PageFlags::WRITABLE,
        )
        .unwrap();
        let entry = vmm.walk(virt);
        assert_eq!(entry & crate::mm::page_table::PHYS_ADDR_MASK, phys.as_u64());
        assert_ne!(entry & PageFlags::LARGE.bits(), 0);
        assert_eq!(vmm.walk(VirtAddr::new(0)), 0);
    }

    #[test]
    fn misaligned_requests_are_rejected() {
        let (_mem, mut fa) = setup(16);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        assert!(matches!(
            vmm.map_page(
                &mut fa,
                VirtAddr::new(0x123),
                PhysAddr::new(0x1000),
                PageFlags::empty()
            ),
            Err(KernelError::Misaligned { .. })
        ));
        assert!(matches!(
            vmm.map_large(
                &mut fa,
                VirtAddr::new(0x20_0000),
                PhysAddr::new(0x1000),
                PageFlags::empty()
            ),
            Err(KernelError::Misaligned { .. })
        ));
    }

    #[test]
    fn double_map_is_rejected() {
        let (_mem, mut fa) = setup(16);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        let virt = VirtAddr::new(0x5000_0000);
        let phys = PhysAddr::new(0x6000_0000);
        vmm.map_page(&mut fa, virt, phys, PageFlags::WRITABLE).unwrap();
        assert_eq!(
            vmm.map_page(&mut fa, virt, phys, PageFlags::WRITABLE),
            Err(KernelError::AlreadyMapped {
                addr: virt.as_u64()
            })
        );
    }

    #[test]
    fn change_protection_swaps_and_reports_old() {
        let (_mem, mut fa) = setup(16);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        let virt = VirtAddr::new(0x7000_0000);
        let phys = PhysAddr::new(0x1000);
        vmm.map_page(
            &mut fa,
            virt,
            phys,
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        )
        .unwrap();

        let old = vmm.change_protection(virt, PageFlags::empty()).unwrap();
        assert_eq!(
            old,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE
        );
        // Now read-only; the mapping target is unchanged.
        let entry = vmm.walk(virt);
        assert_eq!(entry & PageFlags::WRITABLE.bits(), 0);
        assert_eq!(entry & crate::mm::page_table::PHYS_ADDR_MASK, phys.as_u64());

        // Unmapped addresses are distinguishable from any flag value.
        assert_eq!(
            vmm.change_protection(VirtAddr::new(0x9000_0000), PageFlags::empty()),
            Err(KernelError::NotMapped { addr: 0x9000_0000 })
        );
    }

    #[test]
    fn null_guard_split_leaves_entry_zero_unmapped() {
        let (_mem, mut fa) = setup(64);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        // Establish the low identity mapping the split transforms.
        vmm.identity_map_low(
            &mut fa,
            4 * LARGE_PAGE_SIZE as u64,
            PageFlags::WRITABLE,
        )
        .unwrap();
        vmm.split_null_guard(&mut fa).unwrap();

        // The null page is never present.
        assert_eq!(vmm.walk(VirtAddr::new(0)), 0);
        // Its neighbors are present-writable 4 KiB identity pages.
        let e = vmm.walk(VirtAddr::new(FRAME_SIZE as u64));
        assert_ne!(e & PageFlags::PRESENT.bits(), 0);
        assert_ne!(e & PageFlags::WRITABLE.bits(), 0);
        assert_eq!(
            e & crate::mm::page_table::PHYS_ADDR_MASK,
            FRAME_SIZE as u64
        );
        // The rest of the low identity map still uses large leaves.
        let e = vmm.walk(VirtAddr::new(LARGE_PAGE_SIZE as u64));
        assert_ne!(e & PageFlags::LARGE.bits(), 0);
        // Splitting twice is a no-op.
        vmm.split_null_guard(&mut fa).unwrap();
        assert_eq!(vmm.walk(VirtAddr::new(0)), 0);
    }

    #[test]
    fn empty_intermediate_tables_are_reclaimed() {
        let (_mem, mut fa) = setup(32);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        let free_before = fa.free_frames();
        let virt = VirtAddr::new(0x1234_5678_9000 & !(FRAME_SIZE as u64 - 1));
        vmm.map_page(&mut fa, virt, PhysAddr::new(0x2000), PageFlags::WRITABLE)
            .unwrap();
        // Three intermediate tables were created.
        assert_eq!(fa.free_frames(), free_before - 3);
        vmm.unmap(&mut fa, virt).unwrap();
        // All of them were empty afterwards and returned.
        assert_eq!(fa.free_frames(), free_before);
    }

    #[test]
    fn mmio_windows_map_uncached_and_unmap() {
        let (_mem, mut fa) = setup(32);
        let mut vmm = Vmm::new(&mut fa).unwrap();
        let base = vmm
            .map_mmio(&mut fa, PhysAddr::new(0xFEE0_0000), 2 * FRAME_SIZE)
            .unwrap();
        let entry = vmm.walk(base);
        assert_ne!(entry & PageFlags::NO_CACHE.bits(), 0);
        assert_ne!(entry & PageFlags::NO_EXECUTE.bits(), 0);
        vmm.unmap_mmio(&mut fa, base, 2 * FRAME_SIZE).unwrap();
        assert_eq!(vmm.walk(base), 0);
    }
}
