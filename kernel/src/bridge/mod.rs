//! Kernel bridge: the registry that binds managed call sites to native
//! entry points.
//!
//! Populated once during boot with every kernel primitive managed code
//! may call, then sealed before the first managed thread runs
//! application code. After sealing the table is read-only, so lookups
//! are lock-free and return pointers that stay stable until shutdown.
//!
//! Each export carries two faces of the same function: the raw native
//! entry point the JIT wires into a direct call at compile time (no
//! per-call indirection at run time), and a marshalling thunk the
//! interpreter uses during bootstrap.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::jit::il::Value;
use crate::mm::{PhysAddr, VirtAddr, FRAME_ALLOCATOR};
use crate::sched;
use crate::timer;

/// One kernel export.
pub struct Export {
    pub name: &'static str,
    /// Native entry point; the JIT emits direct calls to this address.
    pub native: usize,
    /// Managed-boundary parameter count.
    pub params: u8,
    pub returns: bool,
    /// Interpreter-side marshaller over the same primitive.
    pub invoke: fn(&[Value]) -> KernelResult<Option<Value>>,
}

static REGISTRY: Mutex<BTreeMap<&'static str, &'static Export>> = Mutex::new(BTreeMap::new());
static SEALED: AtomicBool = AtomicBool::new(false);

/// Register one export. Fails after sealing and on duplicates.
pub fn register(export: Export) -> KernelResult<()> {
    if SEALED.load(Ordering::Acquire) {
        return Err(KernelError::BridgeSealed);
    }
    let export = alloc::boxed::Box::leak(alloc::boxed::Box::new(export));
    let mut registry = REGISTRY.lock();
    if registry.contains_key(export.name) {
        return Err(KernelError::DuplicateExport { name: export.name });
    }
    registry.insert(export.name, export);
    Ok(())
}

/// Seal the registry; registration is over, lookups are stable.
pub fn seal() {
    SEALED.store(true, Ordering::Release);
}

pub fn is_sealed() -> bool {
    SEALED.load(Ordering::Acquire)
}

/// Resolve an identifier. After sealing the returned reference is stable
/// until shutdown.
pub fn lookup(name: &str) -> Option<&'static Export> {
    REGISTRY.lock().get(name).copied()
}

/// All registered identifiers, for diagnostics.
pub fn export_names() -> Vec<&'static str> {
    REGISTRY.lock().keys().copied().collect()
}

// ---------------------------------------------------------------------------
// Marshalling helpers
// ---------------------------------------------------------------------------

fn arg_u64(args: &[Value], index: usize) -> KernelResult<u64> {
    match args.get(index) {
        Some(Value::I64(v)) => Ok(*v as u64),
        Some(Value::I32(v)) => Ok(*v as u32 as u64),
        Some(Value::Null) => Ok(0),
        Some(Value::Ref(obj)) => Ok(obj.as_ptr() as u64),
        Some(Value::Fn(_)) | Some(Value::F64(_)) | None => {
            Err(KernelError::InvalidArgument { name: "bridge arg" })
        }
    }
}

fn ok_u64(v: u64) -> KernelResult<Option<Value>> {
    Ok(Some(Value::I64(v as i64)))
}

fn ok_unit() -> KernelResult<Option<Value>> {
    Ok(None)
}

// ---------------------------------------------------------------------------
// Native entry points
// ---------------------------------------------------------------------------
// Every export is a real extern "C" function so the JIT can emit direct
// calls; the interpreter reaches the same primitive through the typed
// marshaller next to it.

extern "C" fn k_in_byte(port: u64) -> u64 {
    // SAFETY: the caller owns the port-I/O policy; this is the exported
    // primitive itself.
    unsafe { arch::inb(port as u16) as u64 }
}

extern "C" fn k_out_byte(port: u64, value: u64) {
    // SAFETY: as above.
    unsafe { arch::outb(port as u16, value as u8) }
}

extern "C" fn k_in_word(port: u64) -> u64 {
    // SAFETY: as above.
    unsafe { arch::inw(port as u16) as u64 }
}

extern "C" fn k_out_word(port: u64, value: u64) {
    // SAFETY: as above.
    unsafe { arch::outw(port as u16, value as u16) }
}

extern "C" fn k_in_dword(port: u64) -> u64 {
    // SAFETY: as above.
    unsafe { arch::inl(port as u16) as u64 }
}

extern "C" fn k_out_dword(port: u64, value: u64) {
    // SAFETY: as above.
    unsafe { arch::outl(port as u16, value as u32) }
}

extern "C" fn k_read_msr(msr: u64) -> u64 {
    // SAFETY: exported privileged primitive.
    unsafe { arch::read_msr(msr as u32) }
}

extern "C" fn k_write_msr(msr: u64, value: u64) {
    // SAFETY: exported privileged primitive.
    unsafe { arch::write_msr(msr as u32, value) }
}

extern "C" fn k_allocate_page() -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .allocate(1)
        .map_or(0, |p| p.as_u64())
}

extern "C" fn k_allocate_pages(count: u64) -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .allocate(count as usize)
        .map_or(0, |p| p.as_u64())
}

extern "C" fn k_free_page(addr: u64) {
    let _ = FRAME_ALLOCATOR.lock().free(PhysAddr::new(addr), 1);
}

extern "C" fn k_free_pages(addr: u64, count: u64) {
    let _ = FRAME_ALLOCATOR
        .lock()
        .free(PhysAddr::new(addr), count as usize);
}

extern "C" fn k_phys_to_virt(phys: u64) -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .phys_to_virt(PhysAddr::new(phys))
        .as_u64()
}

extern "C" fn k_virt_to_phys(virt: u64) -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .virt_to_phys(VirtAddr::new(virt))
        .map_or(0, |p| p.as_u64())
}

extern "C" fn k_map_mmio(phys: u64, len: u64) -> u64 {
    crate::mm::vmm::with_kernel_space(|vmm, fa| {
        vmm.map_mmio(fa, PhysAddr::new(phys), len as usize)
            .map_or(0, |v| v.as_u64())
    })
    .unwrap_or(0)
}

extern "C" fn k_unmap_mmio(virt: u64, len: u64) {
    crate::mm::vmm::with_kernel_space(|vmm, fa| {
        let _ = vmm.unmap_mmio(fa, VirtAddr::new(virt), len as usize);
    });
}

/// Managed interrupt handlers by vector; the shim below fans out.
static MANAGED_IRQ: [AtomicUsize; 256] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE: AtomicUsize = AtomicUsize::new(0);
    [NONE; 256]
};

fn managed_irq_shim(frame: &crate::irq::TrapFrame) {
    let entry = MANAGED_IRQ[frame.vector as usize].load(Ordering::Acquire);
    if entry != 0 {
        #[cfg(target_os = "none")]
        {
            // SAFETY: the entry was registered as a compiled handler with
            // the (vector) -> () signature.
            let f: extern "C" fn(u64) = unsafe { core::mem::transmute(entry) };
            f(frame.vector as u64);
        }
    }
}

extern "C" fn k_register_interrupt_handler(vector: u64, entry: u64) -> u64 {
    let vector = vector as u32;
    MANAGED_IRQ[vector as usize & 0xFF].store(entry as usize, Ordering::Release);
    match crate::irq::register_handler(vector, managed_irq_shim) {
        Ok(()) => 1,
        Err(_) => {
            MANAGED_IRQ[vector as usize & 0xFF].store(0, Ordering::Release);
            0
        }
    }
}

extern "C" fn k_unregister_interrupt_handler(vector: u64) -> u64 {
    let vector = vector as u32;
    MANAGED_IRQ[vector as usize & 0xFF].store(0, Ordering::Release);
    match crate::irq::unregister_handler(vector) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

extern "C" fn k_send_eoi() {
    crate::irq::send_eoi();
}

extern "C" fn k_enable_interrupts() {
    arch::enable_interrupts();
}

extern "C" fn k_disable_interrupts() {
    arch::disable_interrupts();
}

extern "C" fn k_are_interrupts_enabled() -> u64 {
    arch::interrupts_enabled() as u64
}

extern "C" fn k_create_thread(entry: u64, arg: u64, stack_size: u64, suspended: u64) -> u64 {
    // SAFETY: `entry` is compiled-code or kernel text with the one-arg
    // thread signature.
    let entry: sched::ThreadEntry = unsafe { core::mem::transmute(entry as usize) };
    sched::spawn(entry, arg as usize, stack_size as usize, suspended != 0).unwrap_or(0)
}

extern "C" fn k_exit_thread(code: u64) {
    sched::exit_thread(code as i32);
}

extern "C" fn k_get_current_thread_id() -> u64 {
    sched::current_thread_id().unwrap_or(0)
}

extern "C" fn k_sleep(ms: u64) {
    sched::sleep(ms);
}

extern "C" fn k_yield() {
    sched::yield_now();
}

extern "C" fn k_suspend_thread(tid: u64) -> u64 {
    sched::suspend_thread(tid).is_ok() as u64
}

extern "C" fn k_resume_thread(tid: u64) -> u64 {
    sched::resume_thread(tid).is_ok() as u64
}

extern "C" fn k_get_thread_state(tid: u64) -> u64 {
    match sched::thread_state(tid) {
        Ok(state) => state as u64,
        Err(_) => u64::MAX,
    }
}

extern "C" fn k_get_exit_code_thread(tid: u64) -> u64 {
    match sched::SCHEDULER.lock().take_exit_code(tid) {
        Ok(code) => code as u32 as u64,
        Err(_) => u64::MAX,
    }
}

extern "C" fn k_set_thread_affinity(tid: u64, mask: u64) -> u64 {
    sched::set_thread_affinity(tid, mask).is_ok() as u64
}

extern "C" fn k_get_thread_affinity(tid: u64) -> u64 {
    sched::thread_affinity(tid).unwrap_or(0)
}

extern "C" fn k_get_tick_count() -> u64 {
    timer::ticks()
}

extern "C" fn k_get_tick_frequency() -> u64 {
    timer::frequency()
}

extern "C" fn k_get_uptime() -> u64 {
    timer::uptime_ms()
}

extern "C" fn k_delay_microseconds(us: u64) {
    timer::delay_us(us);
}

extern "C" fn k_delay_milliseconds(ms: u64) {
    timer::delay_ms(ms);
}

extern "C" fn k_read_tsc() -> u64 {
    arch::read_tsc()
}

extern "C" fn k_get_cpu_count() -> u64 {
    sched::cpu_count() as u64
}

extern "C" fn k_get_current_cpu() -> u64 {
    sched::current_cpu() as u64
}

extern "C" fn k_get_cpu_info(_index: u64) -> u64 {
    // Family/model/stepping packing is reserved; the bring-up target
    // reports a single generic CPU.
    0
}

extern "C" fn k_get_numa_node_count() -> u64 {
    1
}

extern "C" fn k_get_current_numa_node() -> u64 {
    0
}

/// Legacy PCI configuration mechanism #1: address register at 0xCF8,
/// data window at 0xCFC.
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

fn pci_config_select(bus: u64, device: u64, function: u64, offset: u64) {
    let address = 0x8000_0000u32
        | ((bus as u32 & 0xFF) << 16)
        | ((device as u32 & 0x1F) << 11)
        | ((function as u32 & 0x07) << 8)
        | (offset as u32 & 0xFC);
    // SAFETY: the exported PCI primitive itself; 0xCF8 is the
    // architectural config-address register.
    unsafe { arch::outl(PCI_CONFIG_ADDRESS, address) }
}

fn pci_config_read_dword(bus: u64, device: u64, function: u64, offset: u64) -> u32 {
    pci_config_select(bus, device, function, offset);
    // SAFETY: 0xCFC is the architectural config-data window selected
    // above.
    unsafe { arch::inl(PCI_CONFIG_DATA) }
}

extern "C" fn k_pci_config_read_byte(bus: u64, device: u64, function: u64, offset: u64) -> u64 {
    let dword = pci_config_read_dword(bus, device, function, offset);
    ((dword >> ((offset & 0x3) * 8)) & 0xFF) as u64
}

extern "C" fn k_pci_config_read_word(bus: u64, device: u64, function: u64, offset: u64) -> u64 {
    let dword = pci_config_read_dword(bus, device, function, offset);
    ((dword >> ((offset & 0x2) * 8)) & 0xFFFF) as u64
}

extern "C" fn k_pci_config_read_dword(bus: u64, device: u64, function: u64, offset: u64) -> u64 {
    pci_config_read_dword(bus, device, function, offset) as u64
}

extern "C" fn k_pci_config_write_byte(
    bus: u64,
    device: u64,
    function: u64,
    offset: u64,
    value: u64,
) {
    let shift = (offset & 0x3) * 8;
    let old = pci_config_read_dword(bus, device, function, offset);
    let new = (old & !(0xFFu32 << shift)) | ((value as u32 & 0xFF) << shift);
    pci_config_select(bus, device, function, offset);
    // SAFETY: as the read path; read-modify-write of the selected dword.
    unsafe { arch::outl(PCI_CONFIG_DATA, new) }
}

extern "C" fn k_pci_config_write_word(
    bus: u64,
    device: u64,
    function: u64,
    offset: u64,
    value: u64,
) {
    let shift = (offset & 0x2) * 8;
    let old = pci_config_read_dword(bus, device, function, offset);
    let new = (old & !(0xFFFFu32 << shift)) | ((value as u32 & 0xFFFF) << shift);
    pci_config_select(bus, device, function, offset);
    // SAFETY: as the read path.
    unsafe { arch::outl(PCI_CONFIG_DATA, new) }
}

extern "C" fn k_pci_config_write_dword(
    bus: u64,
    device: u64,
    function: u64,
    offset: u64,
    value: u64,
) {
    pci_config_select(bus, device, function, offset);
    // SAFETY: as the read path.
    unsafe { arch::outl(PCI_CONFIG_DATA, value as u32) }
}

/// Raw base-address register `index` (0..=5) of a function's header, with
/// the low type bits still in place; 64-bit memory BARs span two
/// registers and the caller reads both halves.
extern "C" fn k_pci_get_bar(bus: u64, device: u64, function: u64, index: u64) -> u64 {
    if index > 5 {
        return 0;
    }
    pci_config_read_dword(bus, device, function, 0x10 + index * 4) as u64
}

extern "C" fn k_debug_write(ptr: u64, len: u64) {
    if ptr == 0 {
        return;
    }
    // SAFETY: the caller passes a live buffer; the debug channel is a raw
    // byte sink by contract.
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
    if let Ok(s) = core::str::from_utf8(bytes) {
        print!("{}", s);
    }
}

extern "C" fn k_debug_write_line() {
    println!();
}

extern "C" fn k_debug_write_hex8(v: u64) {
    print!("{:02x}", v as u8);
}

extern "C" fn k_debug_write_hex16(v: u64) {
    print!("{:04x}", v as u16);
}

extern "C" fn k_debug_write_hex32(v: u64) {
    print!("{:08x}", v as u32);
}

extern "C" fn k_debug_write_hex64(v: u64) {
    print!("{:016x}", v);
}

extern "C" fn k_debug_write_decimal(v: u64) {
    print!("{}", v as i32);
}

extern "C" fn k_debug_write_decimal_u(v: u64) {
    print!("{}", v as u32);
}

extern "C" fn k_debug_write_decimal64(v: u64) {
    print!("{}", v as i64);
}

// ---------------------------------------------------------------------------
// Population
// ---------------------------------------------------------------------------

macro_rules! export_fn {
    ($name:literal, $params:literal, ret, $native:ident, |$args:ident| $invoke:expr) => {
        register(Export {
            name: $name,
            native: $native as usize,
            params: $params,
            returns: true,
            invoke: |$args: &[Value]| $invoke,
        })?;
    };
    ($name:literal, $params:literal, void, $native:ident, |$args:ident| $invoke:expr) => {
        register(Export {
            name: $name,
            native: $native as usize,
            params: $params,
            returns: false,
            invoke: |$args: &[Value]| $invoke,
        })?;
    };
}

static POPULATED: Once<()> = Once::new();

/// Install the full kernel export surface. Idempotent; runs during boot
/// before sealing.
pub fn populate() -> KernelResult<()> {
    let mut result = Ok(());
    POPULATED.call_once(|| {
        result = populate_inner();
    });
    result
}

fn populate_inner() -> KernelResult<()> {
    // Port I/O
    export_fn!("Kernel_InByte", 1, ret, k_in_byte, |a| ok_u64(k_in_byte(
        arg_u64(a, 0)?
    )));
    export_fn!("Kernel_OutByte", 2, void, k_out_byte, |a| {
        k_out_byte(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });
    export_fn!("Kernel_InWord", 1, ret, k_in_word, |a| ok_u64(k_in_word(
        arg_u64(a, 0)?
    )));
    export_fn!("Kernel_OutWord", 2, void, k_out_word, |a| {
        k_out_word(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });
    export_fn!("Kernel_InDword", 1, ret, k_in_dword, |a| ok_u64(k_in_dword(
        arg_u64(a, 0)?
    )));
    export_fn!("Kernel_OutDword", 2, void, k_out_dword, |a| {
        k_out_dword(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });

    // MSRs
    export_fn!("Kernel_ReadMSR", 1, ret, k_read_msr, |a| ok_u64(k_read_msr(
        arg_u64(a, 0)?
    )));
    export_fn!("Kernel_WriteMSR", 2, void, k_write_msr, |a| {
        k_write_msr(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });

    // Physical allocation
    export_fn!("Kernel_AllocatePage", 0, ret, k_allocate_page, |_a| ok_u64(
        k_allocate_page()
    ));
    export_fn!("Kernel_AllocatePages", 1, ret, k_allocate_pages, |a| ok_u64(
        k_allocate_pages(arg_u64(a, 0)?)
    ));
    export_fn!("Kernel_FreePage", 1, void, k_free_page, |a| {
        k_free_page(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!("Kernel_FreePages", 2, void, k_free_pages, |a| {
        k_free_pages(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });

    // Address translation and MMIO
    export_fn!("Kernel_PhysToVirt", 1, ret, k_phys_to_virt, |a| ok_u64(
        k_phys_to_virt(arg_u64(a, 0)?)
    ));
    export_fn!("Kernel_VirtToPhys", 1, ret, k_virt_to_phys, |a| ok_u64(
        k_virt_to_phys(arg_u64(a, 0)?)
    ));
    export_fn!("Kernel_MapMMIO", 2, ret, k_map_mmio, |a| ok_u64(k_map_mmio(
        arg_u64(a, 0)?,
        arg_u64(a, 1)?
    )));
    export_fn!("Kernel_UnmapMMIO", 2, void, k_unmap_mmio, |a| {
        k_unmap_mmio(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });

    // Interrupts
    export_fn!(
        "Kernel_RegisterInterruptHandler",
        2,
        ret,
        k_register_interrupt_handler,
        |a| ok_u64(k_register_interrupt_handler(arg_u64(a, 0)?, arg_u64(a, 1)?))
    );
    export_fn!(
        "Kernel_UnregisterInterruptHandler",
        1,
        ret,
        k_unregister_interrupt_handler,
        |a| ok_u64(k_unregister_interrupt_handler(arg_u64(a, 0)?))
    );
    export_fn!("Kernel_SendEOI", 0, void, k_send_eoi, |_a| {
        k_send_eoi();
        ok_unit()
    });
    export_fn!("Kernel_EnableInterrupts", 0, void, k_enable_interrupts, |_a| {
        k_enable_interrupts();
        ok_unit()
    });
    export_fn!(
        "Kernel_DisableInterrupts",
        0,
        void,
        k_disable_interrupts,
        |_a| {
            k_disable_interrupts();
            ok_unit()
        }
    );
    export_fn!(
        "Kernel_AreInterruptsEnabled",
        0,
        ret,
        k_are_interrupts_enabled,
        |_a| ok_u64(k_are_interrupts_enabled())
    );

    // Threads
    export_fn!("Kernel_CreateThread", 4, ret, k_create_thread, |a| ok_u64(
        k_create_thread(
            arg_u64(a, 0)?,
            arg_u64(a, 1)?,
            arg_u64(a, 2)?,
            arg_u64(a, 3)?
        )
    ));
    export_fn!("Kernel_ExitThread", 1, void, k_exit_thread, |a| {
        k_exit_thread(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!(
        "Kernel_GetCurrentThreadId",
        0,
        ret,
        k_get_current_thread_id,
        |_a| ok_u64(k_get_current_thread_id())
    );
    export_fn!("Kernel_Sleep", 1, void, k_sleep, |a| {
        k_sleep(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!("Kernel_Yield", 0, void, k_yield, |_a| {
        k_yield();
        ok_unit()
    });
    export_fn!("Kernel_SuspendThread", 1, ret, k_suspend_thread, |a| ok_u64(
        k_suspend_thread(arg_u64(a, 0)?)
    ));
    export_fn!("Kernel_ResumeThread", 1, ret, k_resume_thread, |a| ok_u64(
        k_resume_thread(arg_u64(a, 0)?)
    ));
    export_fn!("Kernel_GetThreadState", 1, ret, k_get_thread_state, |a| ok_u64(
        k_get_thread_state(arg_u64(a, 0)?)
    ));
    export_fn!(
        "Kernel_GetExitCodeThread",
        1,
        ret,
        k_get_exit_code_thread,
        |a| ok_u64(k_get_exit_code_thread(arg_u64(a, 0)?))
    );
    export_fn!(
        "Kernel_SetThreadAffinity",
        2,
        ret,
        k_set_thread_affinity,
        |a| ok_u64(k_set_thread_affinity(arg_u64(a, 0)?, arg_u64(a, 1)?))
    );
    export_fn!(
        "Kernel_GetThreadAffinity",
        1,
        ret,
        k_get_thread_affinity,
        |a| ok_u64(k_get_thread_affinity(arg_u64(a, 0)?))
    );

    // Time
    export_fn!("Kernel_GetTickCount", 0, ret, k_get_tick_count, |_a| ok_u64(
        k_get_tick_count()
    ));
    export_fn!(
        "Kernel_GetTickFrequency",
        0,
        ret,
        k_get_tick_frequency,
        |_a| ok_u64(k_get_tick_frequency())
    );
    export_fn!("Kernel_GetUptime", 0, ret, k_get_uptime, |_a| ok_u64(
        k_get_uptime()
    ));
    export_fn!(
        "Kernel_DelayMicroseconds",
        1,
        void,
        k_delay_microseconds,
        |a| {
            k_delay_microseconds(arg_u64(a, 0)?);
            ok_unit()
        }
    );
    export_fn!(
        "Kernel_DelayMilliseconds",
        1,
        void,
        k_delay_milliseconds,
        |a| {
            k_delay_milliseconds(arg_u64(a, 0)?);
            ok_unit()
        }
    );
    export_fn!("Kernel_ReadTSC", 0, ret, k_read_tsc, |_a| ok_u64(k_read_tsc()));

    // Topology
    export_fn!("Kernel_GetCpuCount", 0, ret, k_get_cpu_count, |_a| ok_u64(
        k_get_cpu_count()
    ));
    export_fn!("Kernel_GetCurrentCpu", 0, ret, k_get_current_cpu, |_a| ok_u64(
        k_get_current_cpu()
    ));
    export_fn!("Kernel_GetCpuInfo", 1, ret, k_get_cpu_info, |a| ok_u64(
        k_get_cpu_info(arg_u64(a, 0)?)
    ));
    export_fn!(
        "Kernel_GetNumaNodeCount",
        0,
        ret,
        k_get_numa_node_count,
        |_a| ok_u64(k_get_numa_node_count())
    );
    export_fn!(
        "Kernel_GetCurrentNumaNode",
        0,
        ret,
        k_get_current_numa_node,
        |_a| ok_u64(k_get_current_numa_node())
    );

    // PCI configuration space
    export_fn!(
        "Kernel_PciConfigReadByte",
        4,
        ret,
        k_pci_config_read_byte,
        |a| ok_u64(k_pci_config_read_byte(
            arg_u64(a, 0)?,
            arg_u64(a, 1)?,
            arg_u64(a, 2)?,
            arg_u64(a, 3)?
        ))
    );
    export_fn!(
        "Kernel_PciConfigReadWord",
        4,
        ret,
        k_pci_config_read_word,
        |a| ok_u64(k_pci_config_read_word(
            arg_u64(a, 0)?,
            arg_u64(a, 1)?,
            arg_u64(a, 2)?,
            arg_u64(a, 3)?
        ))
    );
    export_fn!(
        "Kernel_PciConfigReadDword",
        4,
        ret,
        k_pci_config_read_dword,
        |a| ok_u64(k_pci_config_read_dword(
            arg_u64(a, 0)?,
            arg_u64(a, 1)?,
            arg_u64(a, 2)?,
            arg_u64(a, 3)?
        ))
    );
    export_fn!(
        "Kernel_PciConfigWriteByte",
        5,
        void,
        k_pci_config_write_byte,
        |a| {
            k_pci_config_write_byte(
                arg_u64(a, 0)?,
                arg_u64(a, 1)?,
                arg_u64(a, 2)?,
                arg_u64(a, 3)?,
                arg_u64(a, 4)?,
            );
            ok_unit()
        }
    );
    export_fn!(
        "Kernel_PciConfigWriteWord",
        5,
        void,
        k_pci_config_write_word,
        |a| {
            k_pci_config_write_word(
                arg_u64(a, 0)?,
                arg_u64(a, 1)?,
                arg_u64(a, 2)?,
                arg_u64(a, 3)?,
                arg_u64(a, 4)?,
            );
            ok_unit()
        }
    );
    export_fn!(
        "Kernel_PciConfigWriteDword",
        5,
        void,
        k_pci_config_write_dword,
        |a| {
            k_pci_config_write_dword(
                arg_u64(a, 0)?,
                arg_u64(a, 1)?,
                arg_u64(a, 2)?,
                arg_u64(a, 3)?,
                arg_u64(a, 4)?,
            );
            ok_unit()
        }
    );
    export_fn!("Kernel_PciGetBar", 4, ret, k_pci_get_bar, |a| ok_u64(
        k_pci_get_bar(
            arg_u64(a, 0)?,
            arg_u64(a, 1)?,
            arg_u64(a, 2)?,
            arg_u64(a, 3)?
        )
    ));

    // Debug output
    export_fn!("Kernel_DebugWrite", 2, void, k_debug_write, |a| {
        k_debug_write(arg_u64(a, 0)?, arg_u64(a, 1)?);
        ok_unit()
    });
    export_fn!("Kernel_DebugWriteLine", 0, void, k_debug_write_line, |_a| {
        k_debug_write_line();
        ok_unit()
    });
    export_fn!("Kernel_DebugWriteHex8", 1, void, k_debug_write_hex8, |a| {
        k_debug_write_hex8(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!("Kernel_DebugWriteHex16", 1, void, k_debug_write_hex16, |a| {
        k_debug_write_hex16(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!("Kernel_DebugWriteHex32", 1, void, k_debug_write_hex32, |a| {
        k_debug_write_hex32(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!("Kernel_DebugWriteHex64", 1, void, k_debug_write_hex64, |a| {
        k_debug_write_hex64(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!("Kernel_DebugWriteDecimal", 1, void, k_debug_write_decimal, |a| {
        k_debug_write_decimal(arg_u64(a, 0)?);
        ok_unit()
    });
    export_fn!(
        "Kernel_DebugWriteDecimalU",
        1,
        void,
        k_debug_write_decimal_u,
        |a| {
            k_debug_write_decimal_u(arg_u64(a, 0)?);
            ok_unit()
        }
    );
    export_fn!(
        "Kernel_DebugWriteDecimal64",
        1,
        void,
        k_debug_write_decimal64,
        |a| {
            k_debug_write_decimal64(arg_u64(a, 0)?);
            ok_unit()
        }
    );

    Ok(())
}
