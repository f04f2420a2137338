//! System time: the monotonic tick counter and its frequency.
//!
//! The tick counter is incremented by the timer interrupt handler (after it
//! signals end-of-interrupt) and read lock-free everywhere else. On the
//! flagship target the tick source is the local APIC timer calibrated
//! against the PIT; on the host, tests advance ticks by hand through
//! [`tick`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Default tick rate programmed at boot: 1 kHz.
pub const DEFAULT_TICK_HZ: u64 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_HZ: AtomicU64 = AtomicU64::new(DEFAULT_TICK_HZ);
static TSC_HZ: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick count since boot.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Advance the tick counter by one. Called from the timer interrupt
/// handler; tests drive it directly.
#[inline]
pub fn tick() {
    TICKS.fetch_add(1, Ordering::AcqRel);
}

/// Tick frequency in Hz.
#[inline]
pub fn frequency() -> u64 {
    TICK_HZ.load(Ordering::Acquire)
}

/// Milliseconds since boot, derived from the tick counter.
pub fn uptime_ms() -> u64 {
    let hz = frequency();
    if hz == 0 {
        return 0;
    }
    ticks() * 1000 / hz
}

/// Ticks that must elapse before `ms` milliseconds of wall time have
/// passed. Rounds up and never returns 0, so a 1 ms sleep spans at least
/// one full tick.
pub fn ticks_for_ms(ms: u64) -> u64 {
    let hz = frequency();
    ((ms * hz).div_ceil(1000)).max(1)
}

/// Calibrate the platform timer and start periodic delivery at `hz`.
///
/// On bare metal this measures the APIC timer against a PIT window and
/// programs periodic mode; the measured TSC-independent timer frequency is
/// logged. Elsewhere only the bookkeeping is updated.
pub fn calibrate(hz: u64) {
    TICK_HZ.store(hz, Ordering::Release);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let apic_hz = crate::arch::x86_64::apic::calibrate_and_start(hz as u32);
        log::info!("timer: apic {} Hz, tick {} Hz", apic_hz, hz);
    }
    // A TSC rate for busy-waits: measure one tick window if never set.
    if TSC_HZ.load(Ordering::Acquire) == 0 {
        TSC_HZ.store(estimate_tsc_hz(), Ordering::Release);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn estimate_tsc_hz() -> u64 {
    // Count TSC cycles across one full tick period.
    let start_tick = ticks();
    while ticks() == start_tick {
        crate::arch::pause();
    }
    let t0 = crate::arch::read_tsc();
    let tick0 = ticks();
    while ticks() == tick0 {
        crate::arch::pause();
    }
    let t1 = crate::arch::read_tsc();
    (t1 - t0) * frequency()
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn estimate_tsc_hz() -> u64 {
    // The simulated TSC counts nanoseconds.
    1_000_000_000
}

/// TSC frequency established during calibration; 0 before.
pub fn tsc_frequency() -> u64 {
    TSC_HZ.load(Ordering::Acquire)
}

/// Busy-wait for at least `us` microseconds against the TSC.
pub fn delay_us(us: u64) {
    let hz = tsc_frequency();
    if hz == 0 {
        // Before calibration: crude fixed spin.
        for _ in 0..us * 100 {
            crate::arch::pause();
        }
        return;
    }
    let start = crate::arch::read_tsc();
    let cycles = us * hz / 1_000_000;
    while crate::arch::read_tsc().wrapping_sub(start) < cycles {
        crate::arch::pause();
    }
}

/// Busy-wait for at least `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    delay_us(ms * 1000);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_monotonically() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
    }

    #[test]
    fn ms_to_tick_conversion_rounds_up() {
        // Default 1 kHz: 1 tick per ms.
        assert_eq!(frequency(), DEFAULT_TICK_HZ);
        assert_eq!(ticks_for_ms(10), 10);
        // Zero-ms sleeps still cross one tick boundary.
        assert_eq!(ticks_for_ms(0), 1);
    }

    #[test]
    fn delay_us_returns_after_budgeted_cycles() {
        calibrate(DEFAULT_TICK_HZ);
        let t0 = crate::arch::read_tsc();
        delay_us(50);
        let t1 = crate::arch::read_tsc();
        // Simulated TSC counts nanoseconds.
        assert!(t1 - t0 >= 50_000);
    }
}
