//! Preemptive round-robin scheduler.
//!
//! One ready queue per CPU, a fixed quantum in timer ticks, and a thread
//! state machine driven from exactly four suspension points: the timer
//! tick, explicit yield, explicit sleep, and entering a blocked wait.
//! State lives behind an interrupt-disabling lock; the actual context
//! switch happens after the lock is dropped, on pointers into the
//! boxed thread control blocks (which never move).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::arch::Context;
use crate::error::{KernelError, KernelResult};
use crate::sched::queue::ReadyQueue;
use crate::sched::task::{CpuSet, Thread, ThreadState, WaitReason};
use crate::sched::ThreadId;
use crate::sync::IrqMutex;
use crate::timer;

/// CPUs the scheduler will manage on the flagship target.
pub const MAX_CPUS: usize = 8;

/// Round-robin quantum in timer ticks.
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;

/// Stack handed to a thread when the creator does not size one.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Outcome of a scheduling decision: either keep running, or switch
/// between the two contexts. Pointers are into boxed TCBs and stay valid
/// until the threads are reaped.
pub enum Switch {
    None,
    To {
        from: *mut Context,
        to: *const Context,
    },
}

pub struct Scheduler {
    threads: BTreeMap<ThreadId, Box<Thread>>,
    ready: [ReadyQueue; MAX_CPUS],
    current: [Option<ThreadId>; MAX_CPUS],
    quantum_remaining: [u32; MAX_CPUS],
    quantum: u32,
    next_id: ThreadId,
    online_cpus: u8,
}

impl Scheduler {
    pub const fn new() -> Self {
        const EMPTY_QUEUE: ReadyQueue = ReadyQueue::new();
        Self {
            threads: BTreeMap::new(),
            ready: [EMPTY_QUEUE; MAX_CPUS],
            current: [None; MAX_CPUS],
            quantum_remaining: [0; MAX_CPUS],
            quantum: DEFAULT_QUANTUM_TICKS,
            next_id: 1,
            online_cpus: 1,
        }
    }

    pub fn online_cpus(&self) -> u8 {
        self.online_cpus
    }

    pub fn set_online_cpus(&mut self, cpus: u8) {
        self.online_cpus = cpus.clamp(1, MAX_CPUS as u8);
    }

    /// Register a new thread. `start_suspended` leaves it in Created until
    /// the first resume; otherwise it becomes Ready immediately.
    pub fn admit(
        &mut self,
        context: Context,
        stack_base: usize,
        stack_size: usize,
        start_suspended: bool,
    ) -> ThreadId {
        let id = self.next_id;
        self.next_id += 1;
        let mut thread = Box::new(Thread::new(id, context, stack_base, stack_size));
        if start_suspended {
            thread.state = ThreadState::Created;
        } else {
            thread.state = ThreadState::Ready;
        }
        let ready = thread.state == ThreadState::Ready;
        let cpu = self.pick_cpu(&thread.affinity);
        self.threads.insert(id, thread);
        if ready {
            self.ready[cpu as usize].enqueue(id);
        }
        id
    }

    /// Least-loaded CPU inside the affinity mask.
    fn pick_cpu(&self, affinity: &CpuSet) -> u8 {
        let mut best = 0u8;
        let mut best_len = usize::MAX;
        for cpu in 0..self.online_cpus {
            if affinity.contains(cpu) && self.ready[cpu as usize].len() < best_len {
                best = cpu;
                best_len = self.ready[cpu as usize].len();
            }
        }
        best
    }

    fn thread(&self, tid: ThreadId) -> KernelResult<&Thread> {
        self.threads
            .get(&tid)
            .map(|t| t.as_ref())
            .ok_or(KernelError::ThreadNotFound { tid })
    }

    fn thread_mut(&mut self, tid: ThreadId) -> KernelResult<&mut Thread> {
        self.threads
            .get_mut(&tid)
            .map(|t| t.as_mut())
            .ok_or(KernelError::ThreadNotFound { tid })
    }

    pub fn state_of(&self, tid: ThreadId) -> KernelResult<ThreadState> {
        Ok(self.thread(tid)?.state)
    }

    pub fn current_id(&self, cpu: u8) -> Option<ThreadId> {
        self.current[cpu as usize]
    }

    pub fn set_affinity(&mut self, tid: ThreadId, mask: u64) -> KernelResult<()> {
        if mask == 0 {
            return Err(KernelError::InvalidArgument { name: "mask" });
        }
        self.thread_mut(tid)?.affinity = CpuSet::from_mask(mask);
        Ok(())
    }

    pub fn affinity(&self, tid: ThreadId) -> KernelResult<u64> {
        Ok(self.thread(tid)?.affinity.as_mask())
    }

    /// Select and install the next Running thread for `cpu`.
    fn select_next(&mut self, cpu: u8) -> Option<ThreadId> {
        let tid = self.ready[cpu as usize].dequeue()?;
        let quantum = self.quantum;
        let thread = self.threads.get_mut(&tid).expect("ready thread exists");
        thread.state = ThreadState::Running;
        thread.current_cpu = Some(cpu);
        self.current[cpu as usize] = Some(tid);
        self.quantum_remaining[cpu as usize] = quantum;
        Some(tid)
    }

    /// Move the Running thread on `cpu` back to Ready (end of quantum or
    /// yield) and pick a successor. Returns the contexts to switch.
    pub fn preempt(&mut self, cpu: u8) -> Switch {
        let Some(cur) = self.current[cpu as usize] else {
            // CPU was idle; just try to start something.
            return match self.select_next(cpu) {
                Some(next) => {
                    let to = &self.threads[&next].context as *const Context;
                    Switch::To {
                        from: core::ptr::null_mut(),
                        to,
                    }
                }
                None => Switch::None,
            };
        };
        if self.ready[cpu as usize].is_empty() {
            // Nothing else to run; keep the quantum fresh.
            self.quantum_remaining[cpu as usize] = self.quantum;
            return Switch::None;
        }
        {
            let thread = self.threads.get_mut(&cur).expect("current thread exists");
            thread.state = ThreadState::Ready;
            thread.current_cpu = None;
        }
        self.ready[cpu as usize].enqueue(cur);
        self.current[cpu as usize] = None;
        let next = self.select_next(cpu).expect("queue was non-empty");
        let from = &mut self
            .threads
            .get_mut(&cur)
            .expect("current thread exists")
            .context as *mut Context;
        let to = &self.threads[&next].context as *const Context;
        Switch::To { from, to }
    }

    /// Timer tick on `cpu`: wake expired sleepers everywhere, then charge
    /// the quantum and preempt when it runs out.
    pub fn tick(&mut self, cpu: u8) -> Switch {
        let now = timer::ticks();
        let expired: alloc::vec::Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| {
                t.state == ThreadState::Blocked
                    && matches!(t.wait, Some(WaitReason::SleepUntil(d)) if d <= now)
            })
            .map(|t| t.id)
            .collect();
        for tid in expired {
            let _ = self.make_ready(tid);
        }

        if let Some(cur) = self.current[cpu as usize] {
            if let Some(thread) = self.threads.get_mut(&cur) {
                thread.runtime_ticks += 1;
            }
            let remaining = &mut self.quantum_remaining[cpu as usize];
            *remaining = remaining.saturating_sub(1);
            if *remaining > 0 {
                return Switch::None;
            }
        }
        self.preempt(cpu)
    }

    fn make_ready(&mut self, tid: ThreadId) -> KernelResult<()> {
        let affinity = {
            let thread = self.thread_mut(tid)?;
            thread.state = ThreadState::Ready;
            thread.wait = None;
            thread.affinity
        };
        let cpu = self.pick_cpu(&affinity);
        self.ready[cpu as usize].enqueue(tid);
        Ok(())
    }

    /// Block the Running thread on `cpu`. Returns the switch to the next
    /// thread, or `Switch::None` when the CPU goes idle.
    pub fn block_current(&mut self, cpu: u8, reason: WaitReason) -> Switch {
        let Some(cur) = self.current[cpu as usize] else {
            return Switch::None;
        };
        {
            let thread = self.threads.get_mut(&cur).expect("current thread exists");
            thread.state = ThreadState::Blocked;
            thread.wait = Some(reason);
            thread.current_cpu = None;
        }
        self.current[cpu as usize] = None;
        match self.select_next(cpu) {
            Some(next) => {
                let from = &mut self
            .threads
            .get_mut(&cur)
            .expect("current thread exists")
            .context as *mut Context;
                let to = &self.threads[&next].context as *const Context;
                Switch::To { from, to }
            }
            None => Switch::None,
        }
    }

    /// Sleep the Running thread on `cpu` for at least `ms` milliseconds.
    pub fn sleep_current(&mut self, cpu: u8, ms: u64) -> Switch {
        let deadline = timer::ticks() + timer::ticks_for_ms(ms);
        self.block_current(cpu, WaitReason::SleepUntil(deadline))
    }

    /// Wake a thread blocked on an event.
    pub fn wake(&mut self, tid: ThreadId) -> KernelResult<()> {
        let state = self.thread(tid)?.state;
        if state != ThreadState::Blocked {
            return Err(KernelError::InvalidState {
                expected: "Blocked",
                actual: state_name(state),
            });
        }
        self.make_ready(tid)
    }

    /// Suspend a thread. Counted: each suspend must be paired with a
    /// resume; only the transition from 0 changes the state.
    pub fn suspend(&mut self, tid: ThreadId) -> KernelResult<()> {
        let state = self.thread(tid)?.state;
        match state {
            ThreadState::Terminated => Err(KernelError::InvalidState {
                expected: "non-Terminated",
                actual: "Terminated",
            }),
            ThreadState::Suspended => {
                let thread = self.thread_mut(tid)?;
                thread.suspend_count = thread
                    .suspend_count
                    .checked_add(1)
                    .ok_or(KernelError::SuspendCount { tid })?;
                Ok(())
            }
            _ => {
                // Pull it off whatever structure holds it.
                for queue in &mut self.ready {
                    queue.remove(tid);
                }
                for slot in &mut self.current {
                    if *slot == Some(tid) {
                        *slot = None;
                    }
                }
                let thread = self.thread_mut(tid)?;
                thread.resume_state = state;
                thread.state = ThreadState::Suspended;
                thread.suspend_count = 1;
                thread.current_cpu = None;
                Ok(())
            }
        }
    }

    /// Resume a thread: decrement the suspend count, re-readying at zero.
    /// Also performs the Created → Ready transition of a first resume.
    pub fn resume(&mut self, tid: ThreadId) -> KernelResult<()> {
        let state = self.thread(tid)?.state;
        match state {
            ThreadState::Created => self.make_ready(tid),
            ThreadState::Suspended => {
                let remaining = {
                    let thread = self.thread_mut(tid)?;
                    thread.suspend_count = thread
                        .suspend_count
                        .checked_sub(1)
                        .ok_or(KernelError::SuspendCount { tid })?;
                    thread.suspend_count
                };
                if remaining == 0 {
                    let resume_state = self.thread(tid)?.resume_state;
                    if resume_state == ThreadState::Blocked {
                        // Still waiting on its event or deadline.
                        self.thread_mut(tid)?.state = ThreadState::Blocked;
                        Ok(())
                    } else {
                        self.make_ready(tid)
                    }
                } else {
                    Ok(())
                }
            }
            _ => Err(KernelError::InvalidState {
                expected: "Created or Suspended",
                actual: state_name(state),
            }),
        }
    }

    /// Terminate the Running thread on `cpu` with `code`. The exit code is
    /// fixed here and stays readable until reaped.
    pub fn exit_current(&mut self, cpu: u8, code: i32) -> Switch {
        let Some(cur) = self.current[cpu as usize] else {
            return Switch::None;
        };
        {
            let thread = self.threads.get_mut(&cur).expect("current thread exists");
            thread.state = ThreadState::Terminated;
            thread.exit_code = Some(code);
            thread.current_cpu = None;
            thread.wait = None;
        }
        self.current[cpu as usize] = None;
        match self.select_next(cpu) {
            Some(next) => {
                // The dying thread's context is saved but never resumed.
                let from = &mut self
            .threads
            .get_mut(&cur)
            .expect("current thread exists")
            .context as *mut Context;
                let to = &self.threads[&next].context as *const Context;
                Switch::To { from, to }
            }
            None => Switch::None,
        }
    }

    /// Read a Terminated thread's exit code and reap its control block.
    pub fn take_exit_code(&mut self, tid: ThreadId) -> KernelResult<i32> {
        let state = self.thread(tid)?.state;
        if state != ThreadState::Terminated {
            return Err(KernelError::InvalidState {
                expected: "Terminated",
                actual: state_name(state),
            });
        }
        let thread = self.threads.remove(&tid).expect("checked above");
        Ok(thread.exit_code.unwrap_or(0))
    }

    /// Adopt `tid` as the Running thread on `cpu` without a queue pass.
    /// Used when a blocked thread resumes on an otherwise idle CPU.
    pub fn adopt_current(&mut self, cpu: u8, tid: ThreadId) -> KernelResult<()> {
        let state = self.thread(tid)?.state;
        if state != ThreadState::Ready {
            return Err(KernelError::InvalidState {
                expected: "Ready",
                actual: state_name(state),
            });
        }
        for queue in &mut self.ready {
            queue.remove(tid);
        }
        let quantum = self.quantum;
        let thread = self.thread_mut(tid)?;
        thread.state = ThreadState::Running;
        thread.current_cpu = Some(cpu);
        self.current[cpu as usize] = Some(tid);
        self.quantum_remaining[cpu as usize] = quantum;
        Ok(())
    }
}

fn state_name(state: ThreadState) -> &'static str {
    match state {
        ThreadState::Created => "Created",
        ThreadState::Ready => "Ready",
        ThreadState::Running => "Running",
        ThreadState::Blocked => "Blocked",
        ThreadState::Suspended => "Suspended",
        ThreadState::Terminated => "Terminated",
    }
}

/// The system scheduler.
pub static SCHEDULER: IrqMutex<Scheduler> = IrqMutex::new(Scheduler::new());
