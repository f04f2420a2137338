//! Host simulation backend for the HAL.
//!
//! Stands in for the privileged x86_64 paths when the crate is compiled for
//! the build host, so the layers above (allocator, VMM, scheduler state
//! machine, JIT, runtime) run under the standard test harness. The
//! interrupt-enable flag is per test thread; MSRs and ports are inert
//! shadow state.

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use alloc::collections::BTreeMap;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Shadow CR3; written by `write_cr3`, read back by `read_cr3`.
static CR3: AtomicU64 = AtomicU64::new(0);

/// Simulated MSR file. Writes land here; reads return 0 for untouched MSRs.
static MSRS: Mutex<BTreeMap<u32, u64>> = Mutex::new(BTreeMap::new());

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(|f| f.get())
}

pub fn set_interrupts_enabled(enabled: bool) {
    INTERRUPTS_ENABLED.with(|f| f.set(enabled));
}

pub fn read_cr2() -> u64 {
    0
}

pub fn read_cr3() -> u64 {
    CR3.load(Ordering::Acquire)
}

pub fn write_cr3(phys: u64) {
    CR3.store(phys, Ordering::Release);
}

pub fn read_msr(msr: u32) -> u64 {
    MSRS.lock().get(&msr).copied().unwrap_or(0)
}

pub fn write_msr(msr: u32, value: u64) {
    MSRS.lock().insert(msr, value);
}

/// Ports read as all-ones (idle bus); writes are dropped.
pub fn port_read(_port: u16) -> u32 {
    u32::MAX
}

pub fn port_write(_port: u16, _value: u32) {}

pub fn read_tsc() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
