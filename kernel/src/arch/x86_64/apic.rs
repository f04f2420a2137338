//! Local APIC timer in x2APIC mode.
//!
//! The scheduler's preemption source. Everything here is MSR-driven; no
//! MMIO window or legacy 8259 programming is required. Calibration runs the
//! APIC timer against a PIT channel-2 one-shot window, which needs only
//! port I/O.

use super::msr;

/// IA32_APIC_BASE: global enable (bit 11) and x2APIC mode (bit 10).
const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_X2APIC: u64 = 1 << 10;

/// x2APIC register MSRs.
const X2APIC_EOI: u32 = 0x80B;
const X2APIC_SPURIOUS: u32 = 0x80F;
const X2APIC_LVT_TIMER: u32 = 0x832;
const X2APIC_TIMER_INITIAL: u32 = 0x838;
const X2APIC_TIMER_CURRENT: u32 = 0x839;
const X2APIC_TIMER_DIVIDE: u32 = 0x83E;

/// LVT timer mode bits.
const LVT_TIMER_PERIODIC: u64 = 1 << 17;
const LVT_MASKED: u64 = 1 << 16;

/// Divide configuration 0b0011 = divide by 16.
const DIVIDE_BY_16: u64 = 0x3;

/// Vector the timer fires on; the IDT routes it into `irq::dispatch`.
pub const TIMER_VECTOR: u8 = 32;

/// Spurious-interrupt vector; required to software-enable the APIC.
const SPURIOUS_VECTOR: u64 = 0xFF;

/// Bring the local APIC up in x2APIC mode with the timer masked.
pub fn init() {
    let base = msr::rdmsr(IA32_APIC_BASE);
    msr::wrmsr(
        IA32_APIC_BASE,
        base | APIC_BASE_ENABLE | APIC_BASE_X2APIC,
    );
    // Software-enable via the spurious vector register.
    msr::wrmsr(X2APIC_SPURIOUS, (1 << 8) | SPURIOUS_VECTOR);
    msr::wrmsr(X2APIC_LVT_TIMER, LVT_MASKED);
    msr::wrmsr(X2APIC_TIMER_DIVIDE, DIVIDE_BY_16);
}

/// Signal end-of-interrupt for the in-service interrupt.
#[inline]
pub fn eoi() {
    msr::wrmsr(X2APIC_EOI, 0);
}

/// Measure the APIC timer frequency (ticks per second at the configured
/// divider) against a 10 ms PIT channel-2 window, then program periodic
/// delivery at `hz` interrupts per second on [`TIMER_VECTOR`].
///
/// Returns the measured APIC timer frequency.
pub fn calibrate_and_start(hz: u32) -> u64 {
    const PIT_FREQUENCY: u64 = 1_193_182;
    // 10ms window
    let pit_ticks = (PIT_FREQUENCY / 100) as u16;

    // SAFETY: Standard PIT channel-2 one-shot setup: gate via port 0x61,
    // mode register 0x43, counter 0x42. Only touches the PIT and the
    // speaker-gate bits.
    unsafe {
        // Gate on, speaker off.
        let gate = super::inb(0x61);
        super::outb(0x61, (gate & !0x02) | 0x01);
        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        super::outb(0x43, 0xB0);
        super::outb(0x42, (pit_ticks & 0xFF) as u8);
        super::outb(0x42, (pit_ticks >> 8) as u8);
    }

    // Start the APIC timer free-running from max.
    msr::wrmsr(X2APIC_TIMER_INITIAL, u32::MAX as u64);

    // Wait for the PIT output pin (bit 5 of port 0x61) to go high.
    // SAFETY: read-only poll of the PIT status bit.
    unsafe {
        while super::inb(0x61) & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }

    let remaining = msr::rdmsr(X2APIC_TIMER_CURRENT);
    msr::wrmsr(X2APIC_TIMER_INITIAL, 0); // stop

    let elapsed = u32::MAX as u64 - remaining;
    let apic_hz = elapsed * 100;

    // Periodic mode at the requested rate.
    let initial = apic_hz / hz as u64;
    msr::wrmsr(
        X2APIC_LVT_TIMER,
        LVT_TIMER_PERIODIC | TIMER_VECTOR as u64,
    );
    msr::wrmsr(X2APIC_TIMER_INITIAL, initial.max(1));

    apic_hz
}
