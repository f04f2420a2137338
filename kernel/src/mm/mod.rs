//! Memory management
//!
//! Physical frame allocation, the 4-level page-table tree, the virtual
//! memory manager, and kernel heap bring-up. The address-space layout is
//! fixed: identity-mapped low memory for kernel code and data (minus the
//! null-guard page), and a higher-half direct map of all physical RAM at
//! [`DIRECT_MAP_BASE`].

pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vmm;

use bitflags::bitflags;

pub use frame_allocator::{FrameAllocator, FRAME_ALLOCATOR};
pub use vmm::Vmm;

/// Size of a physical frame (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Size of a large page (2 MiB)
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Base of the higher-half direct map of physical memory.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn is_large_aligned(&self) -> bool {
        self.0 % LARGE_PAGE_SIZE as u64 == 0
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn is_large_aligned(&self) -> bool {
        self.0 % LARGE_PAGE_SIZE as u64 == 0
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Index into the level-4 table (bits 39..48).
    pub const fn p4_index(&self) -> usize {
        ((self.0 >> 39) & 0x1FF) as usize
    }

    /// Index into the level-3 table (bits 30..39).
    pub const fn p3_index(&self) -> usize {
        ((self.0 >> 30) & 0x1FF) as usize
    }

    /// Index into the level-2 table (bits 21..30).
    pub const fn p2_index(&self) -> usize {
        ((self.0 >> 21) & 0x1FF) as usize
    }

    /// Index into the level-1 table (bits 12..21).
    pub const fn p1_index(&self) -> usize {
        ((self.0 >> 12) & 0x1FF) as usize
    }
}

/// Page size options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB leaf at level 1
    Small,
    /// 2 MiB leaf at level 2
    Large,
}

bitflags! {
    /// Page protection flags. The set a caller may request is exactly these
    /// bitwise-or'd; the manager never adds flags beyond PRESENT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_indices_decompose() {
        // 0x0000_0000_0020_0000 = the second 2 MiB window.
        let v = VirtAddr::new(0x20_0000);
        assert_eq!(v.p4_index(), 0);
        assert_eq!(v.p3_index(), 0);
        assert_eq!(v.p2_index(), 1);
        assert_eq!(v.p1_index(), 0);

        let v = VirtAddr::new(DIRECT_MAP_BASE);
        assert_eq!(v.p4_index(), 256);
    }

    #[test]
    fn alignment_predicates() {
        assert!(PhysAddr::new(0x1000).is_frame_aligned());
        assert!(!PhysAddr::new(0x1001).is_frame_aligned());
        assert!(VirtAddr::new(0x20_0000).is_large_aligned());
        assert!(!VirtAddr::new(0x10_0000).is_large_aligned());
    }
}
