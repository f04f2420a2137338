//! Thread scheduling.
//!
//! The scheduler proper lives in [`scheduler`]; this module owns the
//! kernel-facing API bound to the current CPU: spawning (with stack
//! allocation and the exit trampoline), the four suspension points, and
//! the queries the kernel bridge exports to managed code.

pub mod queue;
pub mod scheduler;
pub mod task;

use alloc::boxed::Box;

use crate::arch::Context;
use crate::error::{KernelError, KernelResult};
use crate::sync::PollBudget;

pub use scheduler::{Switch, DEFAULT_QUANTUM_TICKS, DEFAULT_STACK_SIZE, MAX_CPUS, SCHEDULER};
pub use task::{CpuSet, Thread, ThreadState, WaitReason};

/// Thread identifier. Never reused within a boot.
pub type ThreadId = u64;

/// Entry signature for kernel and managed threads: one opaque argument.
pub type ThreadEntry = extern "C" fn(usize);

/// Boxed start info carried into the trampoline.
struct ThreadStart {
    entry: ThreadEntry,
    arg: usize,
}

/// Every thread begins here: run the entry, then fall-off-end terminates
/// the thread with exit code 0.
extern "C" fn thread_trampoline(start: usize) {
    // SAFETY: the box was leaked by `spawn` exclusively for this thread.
    let start = unsafe { Box::from_raw(start as *mut ThreadStart) };
    (start.entry)(start.arg);
    exit_thread(0);
}

/// CPU this code is running on. The single-processor bring-up pins
/// everything to CPU 0; the `smp` build reads the local APIC id.
pub fn current_cpu() -> u8 {
    #[cfg(all(feature = "smp", target_arch = "x86_64", target_os = "none"))]
    {
        // x2APIC id (MSR 0x802), folded into the scheduler's CPU range.
        (crate::arch::x86_64::msr::rdmsr(0x802) as u8) & (MAX_CPUS as u8 - 1)
    }
    #[cfg(not(all(feature = "smp", target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Number of CPUs the scheduler manages.
pub fn cpu_count() -> u8 {
    SCHEDULER.lock().online_cpus()
}

pub fn current_thread_id() -> Option<ThreadId> {
    SCHEDULER.lock().current_id(current_cpu())
}

/// Allocate a thread stack. On bare metal: physical frames reached through
/// the direct map (writable, never executable), with an untouched guard
/// frame below the usable base. On the host: a leaked heap allocation so
/// the state machine has real addresses to carry.
fn allocate_stack(size: usize) -> KernelResult<(usize, usize)> {
    let size = size.max(crate::mm::FRAME_SIZE);
    #[cfg(target_os = "none")]
    {
        use crate::mm::{FRAME_ALLOCATOR, FRAME_SIZE};
        let frames = size.div_ceil(FRAME_SIZE) + 1; // +1 guard frame
        let mut fa = FRAME_ALLOCATOR.lock();
        let phys = fa.allocate(frames).ok_or(KernelError::OutOfMemory {
            requested_frames: frames,
        })?;
        let guard = fa.phys_to_virt(phys).as_u64() as usize;
        let base = guard + FRAME_SIZE;
        Ok((base, base + (frames - 1) * FRAME_SIZE))
    }
    #[cfg(not(target_os = "none"))]
    {
        use alloc::alloc::{alloc_zeroed, Layout};
        let layout = Layout::from_size_align(size, 16)
            .map_err(|_| KernelError::InvalidArgument { name: "stack_size" })?;
        // SAFETY: non-zero layout; intentionally leaked for the thread's
        // lifetime (host threads are test fixtures).
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(KernelError::OutOfMemory {
                requested_frames: size / crate::mm::FRAME_SIZE,
            });
        }
        Ok((ptr as usize, ptr as usize + size))
    }
}

/// Create a thread running `entry(arg)` on a fresh stack.
///
/// `stack_size` of 0 selects [`DEFAULT_STACK_SIZE`]. A thread created
/// suspended stays in Created until its first resume.
pub fn spawn(
    entry: ThreadEntry,
    arg: usize,
    stack_size: usize,
    start_suspended: bool,
) -> KernelResult<ThreadId> {
    let size = if stack_size == 0 {
        DEFAULT_STACK_SIZE
    } else {
        stack_size
    };
    let (base, top) = allocate_stack(size)?;
    let start = Box::new(ThreadStart { entry, arg });
    let context = Context::with_entry(
        thread_trampoline as usize,
        top,
        Box::into_raw(start) as usize,
    );
    let tid = SCHEDULER
        .lock()
        .admit(context, base, top - base, start_suspended);
    Ok(tid)
}

/// Perform a switch decision computed under the scheduler lock. Must be
/// called with the lock released.
fn perform(switch: Switch) {
    match switch {
        Switch::None => {}
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        Switch::To { from, to } => {
            let _irq = crate::sync::IrqGuard::new();
            if from.is_null() {
                // SAFETY: `to` points into a boxed TCB and holds a
                // resumable image; there is no previous context to save.
                unsafe { crate::arch::context::load_context(to) }
            } else {
                // SAFETY: both pointers target boxed TCBs that outlive the
                // switch; interrupts are disabled for the duration.
                unsafe { crate::arch::context::context_switch(from, to) }
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        Switch::To { .. } => {
            // Host builds drive the state machine only; there is no CPU
            // state to swap.
        }
    }
}

/// Voluntarily give up the rest of the quantum.
pub fn yield_now() {
    let switch = SCHEDULER.lock().preempt(current_cpu());
    perform(switch);
}

/// Sleep for at least `ms` milliseconds of wall time as measured by the
/// tick counter.
pub fn sleep(ms: u64) {
    let cpu = current_cpu();
    let (tid, switch) = {
        let mut sched = SCHEDULER.lock();
        (sched.current_id(cpu), sched.sleep_current(cpu, ms))
    };
    finish_block(tid, switch);
}

/// Block the current thread on an event token.
pub fn block_on_event(token: u64) {
    let cpu = current_cpu();
    let (tid, switch) = {
        let mut sched = SCHEDULER.lock();
        (
            sched.current_id(cpu),
            sched.block_current(cpu, WaitReason::Event(token)),
        )
    };
    finish_block(tid, switch);
}

/// Wake a thread blocked on an event token or deadline.
pub fn wake(tid: ThreadId) -> KernelResult<()> {
    SCHEDULER.lock().wake(tid)
}

fn finish_block(tid: Option<ThreadId>, switch: Switch) {
    match switch {
        Switch::To { .. } => perform(switch),
        // No successor: the CPU idles in place until the tick handler
        // re-readies the blocked thread, which is the one executing here.
        Switch::None => idle_until_readied(tid),
    }
}

fn idle_until_readied(tid: Option<ThreadId>) {
    #[cfg(target_os = "none")]
    {
        let Some(tid) = tid else { return };
        let cpu = current_cpu();
        loop {
            {
                let mut sched = SCHEDULER.lock();
                if sched
                    .state_of(tid)
                    .map(|s| s == ThreadState::Ready)
                    .unwrap_or(false)
                    && sched.adopt_current(cpu, tid).is_ok()
                {
                    return;
                }
            }
            crate::arch::halt();
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = tid;
    }
}

/// Terminate the current thread. On bare metal this never returns; the
/// host build marks the state and returns so tests can observe it.
pub fn exit_thread(code: i32) {
    let switch = SCHEDULER.lock().exit_current(current_cpu(), code);
    perform(switch);
    #[cfg(target_os = "none")]
    {
        // No successor: this CPU has nothing to run ever again.
        crate::arch::halt_forever();
    }
}

pub fn suspend_thread(tid: ThreadId) -> KernelResult<()> {
    SCHEDULER.lock().suspend(tid)
}

pub fn resume_thread(tid: ThreadId) -> KernelResult<()> {
    SCHEDULER.lock().resume(tid)
}

pub fn thread_state(tid: ThreadId) -> KernelResult<ThreadState> {
    SCHEDULER.lock().state_of(tid)
}

pub fn set_thread_affinity(tid: ThreadId, mask: u64) -> KernelResult<()> {
    SCHEDULER.lock().set_affinity(tid, mask)
}

pub fn thread_affinity(tid: ThreadId) -> KernelResult<u64> {
    SCHEDULER.lock().affinity(tid)
}

/// Wait for a thread to terminate and collect its exit code, polling with
/// an explicit attempt budget. Times out as a distinguished outcome.
pub fn join(tid: ThreadId, attempts: u64) -> KernelResult<i32> {
    let mut budget = PollBudget::new("thread join", attempts);
    loop {
        match SCHEDULER.lock().state_of(tid)? {
            ThreadState::Terminated => return SCHEDULER.lock().take_exit_code(tid),
            _ => {
                budget.spin()?;
                yield_now();
            }
        }
    }
}

/// Timer-tick hook: wake sleepers, charge the quantum, preempt on expiry.
/// Called from the timer interrupt handler after EOI and tick increment.
pub fn on_tick() {
    let switch = SCHEDULER.lock().tick(current_cpu());
    perform(switch);
}

/// Hand the boot CPU to the scheduler: resume the first ready thread with
/// interrupts enabled. Never returns.
#[cfg(target_os = "none")]
pub fn enter() -> ! {
    loop {
        let switch = SCHEDULER.lock().preempt(current_cpu());
        crate::arch::enable_interrupts();
        perform(switch);
        crate::arch::halt();
    }
}
