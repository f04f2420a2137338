//! Serial debug console (COM1 at I/O port 0x3F8).
//!
//! The first subsystem the boot entry brings up; everything the kernel
//! prints before and after paging goes through here. Output that cannot
//! be delivered (console poisoned mid-write, e.g. from a fault handler
//! racing bring-up) is counted rather than silently discarded, so a boot
//! log with holes is at least diagnosable.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};
use uart_16550::SerialPort;

const COM1_BASE: u16 = 0x3F8;

static CONSOLE: Once<Mutex<SerialPort>> = Once::new();

/// Writes that could not reach the UART, in formatting units.
static DROPPED_WRITES: AtomicU64 = AtomicU64::new(0);

fn console() -> &'static Mutex<SerialPort> {
    CONSOLE.call_once(|| {
        // SAFETY: COM1_BASE is the standard COM1 register block; the port
        // is initialized before the lock is ever handed out.
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    })
}

/// Bring the console up. The boot entry calls this first; any print that
/// somehow races ahead of it initializes the UART on first use instead.
pub fn init() {
    console();
}

/// Number of writes dropped since boot.
pub fn dropped_writes() -> u64 {
    DROPPED_WRITES.load(Ordering::Acquire)
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use x86_64::instructions::interrupts;

    // The console lock must not be interrupted by a handler that prints.
    interrupts::without_interrupts(|| {
        if console().lock().write_fmt(args).is_err() {
            DROPPED_WRITES.fetch_add(1, Ordering::AcqRel);
        }
    });
}
