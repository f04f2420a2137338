//! Architecture hardware abstraction layer.
//!
//! Everything above this module builds exclusively on the capability surface
//! exported here: interrupt gating, memory barriers, atomics, pause/halt,
//! control-register access, TLB invalidation, port I/O, MSR access, bulk
//! memory operations, and descriptor-table loads.
//!
//! Two backends exist. On bare metal (`target_os = "none"`) the x86_64
//! implementation issues real privileged instructions. On the build host a
//! simulation backend stands in (per-thread interrupt flag, shadow CR3,
//! no-op TLB and port operations) so that the layers above can be exercised
//! by the standard test harness through the identical API.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(not(target_os = "none"))]
pub mod sim;

pub mod context;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use context::Context;

// ---------------------------------------------------------------------------
// Interrupt gating
// ---------------------------------------------------------------------------

/// Query the interrupt-enable state of the current CPU.
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::interrupts_enabled()
    }
}

/// Enable interrupts on the current CPU.
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable();
    #[cfg(not(target_os = "none"))]
    sim::set_interrupts_enabled(true);
}

/// Disable interrupts on the current CPU.
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::disable();
    #[cfg(not(target_os = "none"))]
    sim::set_interrupts_enabled(false);
}

// ---------------------------------------------------------------------------
// Barriers and CPU relaxation
// ---------------------------------------------------------------------------

/// Full memory barrier.
///
/// On x86_64 a SeqCst fence lowers to MFENCE. Any port of this kernel to an
/// ISA without store-release semantics for aligned halfword stores must keep
/// this a full fence; ring-index publication in split virtqueues depends on
/// it.
#[inline(always)]
pub fn memory_barrier() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Spin-wait hint.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halt until the next interrupt (bare metal) or yield (host).
pub fn halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::hlt();
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();
}

/// Disable interrupts and halt the CPU forever. Fatal-error terminal state.
pub fn halt_forever() -> ! {
    disable_interrupts();
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        ::x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Atomics (acquire-release, 32- and 64-bit)
// ---------------------------------------------------------------------------

/// Compare-and-swap. Returns `Ok(previous)` on success, `Err(actual)` when
/// the comparison failed.
#[inline]
pub fn atomic_cas_u32(cell: &AtomicU32, current: u32, new: u32) -> Result<u32, u32> {
    cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
}

#[inline]
pub fn atomic_cas_u64(cell: &AtomicU64, current: u64, new: u64) -> Result<u64, u64> {
    cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
}

/// Unconditional exchange; returns the previous value.
#[inline]
pub fn atomic_exchange_u32(cell: &AtomicU32, new: u32) -> u32 {
    cell.swap(new, Ordering::AcqRel)
}

#[inline]
pub fn atomic_exchange_u64(cell: &AtomicU64, new: u64) -> u64 {
    cell.swap(new, Ordering::AcqRel)
}

/// Fetch-add; returns the previous value.
#[inline]
pub fn atomic_add_u32(cell: &AtomicU32, value: u32) -> u32 {
    cell.fetch_add(value, Ordering::AcqRel)
}

#[inline]
pub fn atomic_add_u64(cell: &AtomicU64, value: u64) -> u64 {
    cell.fetch_add(value, Ordering::AcqRel)
}

// ---------------------------------------------------------------------------
// Control registers and TLB
// ---------------------------------------------------------------------------

/// Read CR2 (faulting linear address of the last page fault).
pub fn read_cr2() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::read_cr2()
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::read_cr2()
    }
}

/// Read CR3 (physical address of the root page table).
pub fn read_cr3() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::read_cr3()
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::read_cr3()
    }
}

/// Load CR3 with a new root page table, flushing all non-global TLB entries.
///
/// # Safety
/// The address must be the physical base of a valid, fully formed 4-level
/// page-table tree with the kernel mapped.
pub unsafe fn write_cr3(phys: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::write_cr3(phys)
    }
    #[cfg(not(target_os = "none"))]
    sim::write_cr3(phys);
}

/// Flush the TLB entry covering one virtual address.
pub fn flush_tlb_entry(virt: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::tlb_flush_address(virt);
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Flush the entire TLB (non-global entries).
pub fn flush_tlb_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::tlb_flush_all();
}

// ---------------------------------------------------------------------------
// Port I/O
// ---------------------------------------------------------------------------

/// Read a byte from an I/O port.
///
/// # Safety
/// Port I/O has device side effects; the caller must know the port.
pub unsafe fn inb(port: u16) -> u8 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::inb(port)
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::port_read(port) as u8
    }
}

/// Write a byte to an I/O port.
///
/// # Safety
/// Port I/O has device side effects; the caller must know the port.
pub unsafe fn outb(port: u16, value: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::outb(port, value)
    }
    #[cfg(not(target_os = "none"))]
    sim::port_write(port, value as u32);
}

/// Read a 16-bit word from an I/O port.
///
/// # Safety
/// Port I/O has device side effects; the caller must know the port.
pub unsafe fn inw(port: u16) -> u16 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::inw(port)
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::port_read(port) as u16
    }
}

/// Write a 16-bit word to an I/O port.
///
/// # Safety
/// Port I/O has device side effects; the caller must know the port.
pub unsafe fn outw(port: u16, value: u16) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::outw(port, value)
    }
    #[cfg(not(target_os = "none"))]
    sim::port_write(port, value as u32);
}

/// Read a 32-bit dword from an I/O port.
///
/// # Safety
/// Port I/O has device side effects; the caller must know the port.
pub unsafe fn inl(port: u16) -> u32 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::inl(port)
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::port_read(port)
    }
}

/// Write a 32-bit dword to an I/O port.
///
/// # Safety
/// Port I/O has device side effects; the caller must know the port.
pub unsafe fn outl(port: u16, value: u32) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        x86_64::outl(port, value)
    }
    #[cfg(not(target_os = "none"))]
    sim::port_write(port, value);
}

// ---------------------------------------------------------------------------
// Model-specific registers and timestamps
// ---------------------------------------------------------------------------

/// Read a model-specific register.
///
/// # Safety
/// The register number must name a valid MSR on the running CPU.
pub unsafe fn read_msr(msr: u32) -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::msr::rdmsr(msr)
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::read_msr(msr)
    }
}

/// Write a model-specific register.
///
/// # Safety
/// The register number must name a valid, writable MSR; the value must be
/// legal for that register.
pub unsafe fn write_msr(msr: u32, value: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::msr::wrmsr(msr, value);
    #[cfg(not(target_os = "none"))]
    sim::write_msr(msr, value);
}

/// Read the time-stamp counter.
pub fn read_tsc() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::read_tsc()
    }
    #[cfg(not(target_os = "none"))]
    {
        sim::read_tsc()
    }
}

// ---------------------------------------------------------------------------
// Bulk memory operations
// ---------------------------------------------------------------------------

/// Copy `len` bytes from `src` to `dst`. Regions must not overlap.
///
/// # Safety
/// Both pointers must be valid for `len` bytes and non-overlapping.
#[inline]
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, len: usize) {
    // SAFETY: forwarded contract.
    unsafe { core::ptr::copy_nonoverlapping(src, dst, len) }
}

/// Fill `len` bytes at `dst` with `value`.
///
/// # Safety
/// `dst` must be valid for `len` bytes of writes.
#[inline]
pub unsafe fn memset(dst: *mut u8, value: u8, len: usize) {
    // SAFETY: forwarded contract.
    unsafe { core::ptr::write_bytes(dst, value, len) }
}

/// Zero `len` bytes at `dst`.
///
/// # Safety
/// `dst` must be valid for `len` bytes of writes.
#[inline]
pub unsafe fn memzero(dst: *mut u8, len: usize) {
    // SAFETY: forwarded contract.
    unsafe { core::ptr::write_bytes(dst, 0, len) }
}

// ---------------------------------------------------------------------------
// Boot-time initialization
// ---------------------------------------------------------------------------

/// Install the descriptor tables and the interrupt dispatch stubs.
/// Bare metal only; the host backend has nothing to load.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_round_trips() {
        enable_interrupts();
        assert!(interrupts_enabled());
        disable_interrupts();
        assert!(!interrupts_enabled());
        enable_interrupts();
    }

    #[test]
    fn cas_succeeds_and_fails_structurally() {
        let cell = AtomicU64::new(5);
        assert_eq!(atomic_cas_u64(&cell, 5, 9), Ok(5));
        assert_eq!(atomic_cas_u64(&cell, 5, 11), Err(9));
        assert_eq!(atomic_exchange_u64(&cell, 1), 9);
        assert_eq!(atomic_add_u64(&cell, 41), 1);
        assert_eq!(cell.load(Ordering::Acquire), 42);
    }
}
