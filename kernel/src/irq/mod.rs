//! Interrupt dispatch.
//!
//! A fixed 256-entry table of handler function pointers indexed by vector.
//! Registration is permitted only while interrupts are disabled; dispatch
//! is a lock-free pointer load so the hot path never touches a lock. Fatal
//! vectors without a registered handler log the interrupt frame (plus the
//! faulting linear address for page faults) and halt the CPU forever.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch;
use crate::error::{KernelError, KernelResult};

/// Number of interrupt vectors on the flagship target.
pub const VECTOR_COUNT: usize = 256;

/// First vector that is a hardware interrupt rather than a CPU exception.
pub const EXCEPTION_LIMIT: u32 = 32;

/// The timer fires on this vector.
pub const TIMER_VECTOR: u32 = 32;

/// What the dispatch stub hands a handler: the interrupt frame pushed by
/// the CPU plus the vector and error code. Remaining registers were saved
/// by the stub before the handler runs.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub vector: u32,
    /// 0 for vectors that push no error code.
    pub error_code: u64,
    pub instruction_pointer: u64,
    pub code_segment: u64,
    pub cpu_flags: u64,
    pub stack_pointer: u64,
    pub stack_segment: u64,
}

/// An interrupt handler. Runs with interrupts disabled.
pub type InterruptHandler = fn(&TrapFrame);

const HANDLER_NONE: usize = 0;

struct HandlerTable {
    slots: [AtomicUsize; VECTOR_COUNT],
}

impl HandlerTable {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicUsize = AtomicUsize::new(HANDLER_NONE);
        Self {
            slots: [EMPTY; VECTOR_COUNT],
        }
    }

    fn get(&self, vector: u32) -> Option<InterruptHandler> {
        let raw = self.slots[vector as usize].load(Ordering::Acquire);
        if raw == HANDLER_NONE {
            None
        } else {
            // SAFETY: only valid fn pointers are ever stored in the slot.
            Some(unsafe { core::mem::transmute::<usize, InterruptHandler>(raw) })
        }
    }
}

static HANDLERS: HandlerTable = HandlerTable::new();

fn check_registration(vector: u32) -> KernelResult<()> {
    if vector as usize >= VECTOR_COUNT {
        return Err(KernelError::InvalidVector { vector });
    }
    if arch::interrupts_enabled() {
        return Err(KernelError::InterruptsEnabled);
    }
    Ok(())
}

/// Install `handler` for `vector`. The slot must be free and interrupts
/// must be disabled.
pub fn register_handler(vector: u32, handler: InterruptHandler) -> KernelResult<()> {
    check_registration(vector)?;
    let raw = handler as usize;
    HANDLERS.slots[vector as usize]
        .compare_exchange(HANDLER_NONE, raw, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| KernelError::HandlerSlotBusy { vector })?;
    Ok(())
}

/// Remove the handler for `vector`. Interrupts must be disabled.
pub fn unregister_handler(vector: u32) -> KernelResult<()> {
    check_registration(vector)?;
    let prev = HANDLERS.slots[vector as usize].swap(HANDLER_NONE, Ordering::AcqRel);
    if prev == HANDLER_NONE {
        return Err(KernelError::InvalidVector { vector });
    }
    Ok(())
}

/// Route an interrupt to its registered handler.
///
/// Exceptions without a handler are fatal. Hardware vectors without one
/// still get end-of-interrupt so the controller does not wedge.
pub fn dispatch(frame: &TrapFrame) {
    match HANDLERS.get(frame.vector) {
        Some(handler) => handler(frame),
        None if frame.vector < EXCEPTION_LIMIT => fatal_fault(frame, None),
        None => {
            log::warn!("spurious interrupt on vector {}", frame.vector);
            send_eoi();
        }
    }
}

/// Signal end-of-interrupt to the platform interrupt controller.
pub fn send_eoi() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    arch::x86_64::apic::eoi();
}

/// Terminal handler for unrecoverable CPU exceptions: log the frame, the
/// faulting address when one exists, and halt this CPU forever.
pub fn fatal_fault(frame: &TrapFrame, fault_addr: Option<u64>) {
    println!("FATAL EXCEPTION: vector {}", frame.vector);
    println!("  error code: {:#x}", frame.error_code);
    println!(
        "  rip={:#x} cs={:#x} rflags={:#x}",
        frame.instruction_pointer, frame.code_segment, frame.cpu_flags
    );
    println!(
        "  rsp={:#x} ss={:#x}",
        frame.stack_pointer, frame.stack_segment
    );
    if let Some(addr) = fault_addr {
        println!("  faulting linear address: {:#x}", addr);
    }
    #[cfg(target_os = "none")]
    arch::halt_forever();
    #[cfg(not(target_os = "none"))]
    panic!("fatal fault in vector {}", frame.vector);
}

/// The timer interrupt handler: end-of-interrupt is signalled before the
/// handler body returns, the monotonic tick counter advances, then the
/// scheduler may preempt.
fn timer_interrupt(_frame: &TrapFrame) {
    send_eoi();
    crate::timer::tick();
    crate::sched::on_tick();
}

/// Install the kernel's own handlers. Interrupts must be disabled.
pub fn init() -> KernelResult<()> {
    register_handler(TIMER_VECTOR, timer_interrupt)
}
