//! Synchronization primitives: interrupt-save critical sections and polling
//! budgets.
//!
//! The kernel's shared-state discipline is interrupt-disabling critical
//! sections around short operations (allocator free list, ready queues,
//! vector table), not sleeping locks. [`disable_and_save`]/[`restore`]
//! compose under nesting: each pair restores exactly the state it observed.

use core::ops::{Deref, DerefMut};

use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};

/// Opaque prior interrupt-enable state returned by [`disable_and_save`].
#[derive(Debug)]
#[must_use = "dropping the state without restore() leaves interrupts disabled"]
pub struct IrqState {
    was_enabled: bool,
}

/// Disable interrupts and capture the prior enable state.
pub fn disable_and_save() -> IrqState {
    let was_enabled = arch::interrupts_enabled();
    arch::disable_interrupts();
    IrqState { was_enabled }
}

/// Re-enable interrupts only if they were enabled when the paired
/// [`disable_and_save`] ran.
pub fn restore(state: IrqState) {
    if state.was_enabled {
        arch::enable_interrupts();
    }
}

/// RAII critical section: interrupts disabled for the guard's lifetime.
pub struct IrqGuard {
    state: Option<IrqState>,
}

impl IrqGuard {
    pub fn new() -> Self {
        Self {
            state: Some(disable_and_save()),
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            restore(state);
        }
    }
}

/// Spinlock that additionally disables interrupts while held.
///
/// Required for any state an interrupt handler can also touch: taking the
/// plain spinlock alone would deadlock against a handler spinning on the
/// same CPU.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

pub struct IrqMutexGuard<'a, T> {
    // Field order is drop order: release the spinlock before re-enabling
    // interrupts.
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Attempt budget for polling waits on external state.
///
/// Exhaustion is a distinguished [`KernelError::Timeout`] outcome, never an
/// exception; the caller owns the retry policy.
pub struct PollBudget {
    operation: &'static str,
    total: u64,
    used: u64,
}

impl PollBudget {
    pub const fn new(operation: &'static str, attempts: u64) -> Self {
        Self {
            operation,
            total: attempts,
            used: 0,
        }
    }

    /// Account one polling attempt and relax the CPU. Returns the timeout
    /// outcome once the budget is spent.
    pub fn spin(&mut self) -> KernelResult<()> {
        if self.used >= self.total {
            return Err(KernelError::Timeout {
                operation: self.operation,
                attempts: self.total,
            });
        }
        self.used += 1;
        arch::pause();
        Ok(())
    }

    /// Poll `condition` until it yields a value or the budget is exhausted.
    pub fn wait_for<T>(&mut self, mut condition: impl FnMut() -> Option<T>) -> KernelResult<T> {
        loop {
            if let Some(value) = condition() {
                return Ok(value);
            }
            self.spin()?;
        }
    }

    /// Attempts consumed so far.
    pub fn used(&self) -> u64 {
        self.used
    }
}
