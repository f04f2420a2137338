//! Concurrency and timeout suites: the HAL's atomic contract under real
//! parallelism, and the polling-budget timeout discipline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use proton_kernel::error::KernelError;
use proton_kernel::sched::{self, ThreadState};
use proton_kernel::sync::PollBudget;
use proton_kernel::{arch, bridge};

#[test]
fn parallel_atomic_decrements_land_exactly() {
    // A thread decrements a shared counter 1000 times with the HAL's
    // atomic add while a second thread does the same on a disjoint
    // counter: each ends exactly 1000 below its start, regardless of
    // interleaving.
    const START: u64 = 5000;
    const STEPS: u64 = 1000;
    let first = Arc::new(AtomicU64::new(START));
    let second = Arc::new(AtomicU64::new(START));

    let spawn_worker = |counter: Arc<AtomicU64>| {
        std::thread::spawn(move || {
            for _ in 0..STEPS {
                // Two's-complement -1: fetch_add of the wrapped value.
                arch::atomic_add_u64(&counter, u64::MAX);
            }
        })
    };
    let t1 = spawn_worker(Arc::clone(&first));
    let t2 = spawn_worker(Arc::clone(&second));
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(first.load(Ordering::Acquire), START - STEPS);
    assert_eq!(second.load(Ordering::Acquire), START - STEPS);
}

#[test]
fn cas_contention_converges_without_lost_updates() {
    let cell = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for _ in 0..250 {
                    loop {
                        let seen = cell.load(Ordering::Acquire);
                        if arch::atomic_cas_u64(&cell, seen, seen + 1).is_ok() {
                            break;
                        }
                        arch::pause();
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(cell.load(Ordering::Acquire), 1000);
}

#[test]
fn exhausted_poll_budget_is_an_outcome_and_the_thread_stays_schedulable() {
    // The polling analog of an unanswered ARP request: the budget runs
    // out, the caller receives the distinguished timeout outcome (no
    // exception machinery involved), and the polling thread remains an
    // ordinary Ready thread after a subsequent yield.
    extern "C" fn parked(_arg: usize) {}
    let tid = sched::spawn(parked, 0, 0, false).unwrap();

    let mut budget = PollBudget::new("neighbor resolution", 50_000);
    let outcome: Result<(), KernelError> = budget.wait_for(|| None);
    assert_eq!(
        outcome,
        Err(KernelError::Timeout {
            operation: "neighbor resolution",
            attempts: 50_000
        })
    );

    sched::yield_now();
    let state = sched::thread_state(tid).unwrap();
    assert!(
        state == ThreadState::Ready || state == ThreadState::Running,
        "poller stays schedulable, found {:?}",
        state
    );
}

#[test]
fn bridge_seal_is_the_cutoff_for_registration() {
    bridge::populate().unwrap();
    let names = bridge::export_names();
    // The §6 surface is present in full.
    for required in [
        "Kernel_InByte",
        "Kernel_OutDword",
        "Kernel_ReadMSR",
        "Kernel_AllocatePages",
        "Kernel_PhysToVirt",
        "Kernel_MapMMIO",
        "Kernel_RegisterInterruptHandler",
        "Kernel_SendEOI",
        "Kernel_EnableInterrupts",
        "Kernel_CreateThread",
        "Kernel_GetExitCodeThread",
        "Kernel_GetTickCount",
        "Kernel_DelayMicroseconds",
        "Kernel_ReadTSC",
        "Kernel_GetCpuCount",
        "Kernel_SetThreadAffinity",
        "Kernel_PciConfigReadDword",
        "Kernel_PciConfigWriteWord",
        "Kernel_PciGetBar",
        "Kernel_DebugWrite",
        "Kernel_DebugWriteHex64",
        "Kernel_DebugWriteDecimal64",
    ] {
        assert!(names.contains(&required), "missing export {}", required);
    }

    bridge::seal();
    extern "C" fn late() {}
    assert_eq!(
        bridge::register(bridge::Export {
            name: "Kernel_TooLate",
            native: late as usize,
            params: 0,
            returns: false,
            invoke: |_| Ok(None),
        }),
        Err(KernelError::BridgeSealed)
    );
}
