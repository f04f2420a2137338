//! ProtonOS boot entry.
//!
//! Invoked after UEFI firmware hand-off with the system table consumed by
//! the boot shim and the memory map in hand. Bring-up order is fixed:
//! debug console, HAL, page allocator from the firmware memory map, VMM
//! (adopting the live tree, then the identity map and the null-guard
//! split), kernel heap, scheduler, interrupt table, timer calibration,
//! kernel-bridge population and sealing, first-thread resume.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
use proton_kernel::*;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::{entry_point, BootInfo};

    use proton_kernel::mm::{PhysAddr, DIRECT_MAP_BASE, FRAME_SIZE};
    use proton_kernel::{arch, bridge, irq, jit, mm, sched, timer};

    /// All physical memory is mapped at the fixed higher-half base the
    /// direct map expects.
    pub static BOOT_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::FixedAddress(DIRECT_MAP_BASE));
        config
    };

    entry_point!(kernel_main, config = &BOOT_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        // Console first; everything else narrates through it.
        arch::x86_64::serial::init();
        proton_kernel::println!("ProtonOS {}", env!("CARGO_PKG_VERSION"));
        proton_kernel::logger::init();

        log::info!("boot: HAL");
        arch::init();

        log::info!("boot: physical memory");
        seed_frame_allocator(boot_info);

        log::info!("boot: virtual memory");
        init_kernel_space();

        log::info!("boot: heap");
        mm::heap::init().expect("heap bring-up cannot fail with seeded memory");

        log::info!("boot: interrupt table");
        irq::init().expect("vector 32 is free at boot");

        log::info!("boot: timer");
        arch::x86_64::apic::init();
        timer::calibrate(timer::DEFAULT_TICK_HZ);

        log::info!("boot: kernel bridge");
        bridge::populate().expect("bridge population is single-shot");
        bridge::seal();

        log::info!("boot: jit");
        jit::compiler::init(jit::code_buffer::DEFAULT_CAPACITY)
            .expect("code buffer reservation");

        log::info!("boot: first managed thread");
        sched::spawn(managed_main, 0, 0, false).expect("spawn of the root thread");
        sched::enter()
    }

    fn seed_frame_allocator(boot_info: &BootInfo) {
        use bootloader_api::info::MemoryRegionKind;

        let mut fa = mm::FRAME_ALLOCATOR.lock();
        fa.set_direct_map_offset(DIRECT_MAP_BASE);
        let mut total = 0usize;
        for region in boot_info.memory_regions.iter() {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let start = region.start.next_multiple_of(FRAME_SIZE as u64);
            let end = region.end & !(FRAME_SIZE as u64 - 1);
            if end <= start {
                continue;
            }
            let frames = ((end - start) / FRAME_SIZE as u64) as usize;
            // SAFETY: the firmware map marks the region usable and the
            // bootloader mapped all physical memory at the direct-map
            // base.
            unsafe {
                fa.add_region(PhysAddr::new(start), frames)
                    .expect("usable region is frame-aligned");
            }
            total += frames;
        }
        log::info!("physical memory: {} MiB usable", total * FRAME_SIZE / (1024 * 1024));
    }

    /// Adopt the live tree, then establish the canonical kernel map: the
    /// low identity region and the non-present null-guard page.
    fn init_kernel_space() {
        let root = PhysAddr::new(arch::read_cr3() & !(FRAME_SIZE as u64 - 1));
        // SAFETY: CR3 holds the bootloader's live tree; its frames are
        // reachable through the direct map established at hand-off.
        let mut vmm = unsafe { mm::Vmm::adopt(root, DIRECT_MAP_BASE) };

        let mut fa = mm::FRAME_ALLOCATOR.lock();
        let identity_limit = 4u64 * 1024 * 1024 * 1024;
        vmm.identity_map_low(
            &mut fa,
            identity_limit,
            mm::PageFlags::WRITABLE,
        )
        .expect("low identity window is free in the hand-off tree");
        vmm.split_null_guard(&mut fa)
            .expect("the zero large page was just mapped");
        drop(fa);

        *mm::vmm::KERNEL_SPACE.lock() = Some(vmm);
    }

    /// The root of the managed world: exercises the execution engine end
    /// to end (interpreter semantics, then a JIT-compiled entry) and
    /// parks.
    extern "C" fn managed_main(_arg: usize) {
        use proton_kernel::jit::il::{self, MethodSig, Op, Value};

        let fib = il::register_recursive("Fib", MethodSig::new(1, true), 0, |me| {
            alloc::vec![
                Op::LoadArg(0),
                Op::ConstI32(2),
                Op::LtS,
                Op::BrFalse(6),
                Op::LoadArg(0),
                Op::Ret,
                Op::LoadArg(0),
                Op::ConstI32(1),
                Op::Sub,
                Op::Call(me),
                Op::LoadArg(0),
                Op::ConstI32(2),
                Op::Sub,
                Op::Call(me),
                Op::Add,
                Op::Ret,
            ]
        });
        match proton_kernel::jit::interp::call(fib, &[Value::I32(10)]) {
            Ok(Some(Value::I32(55))) => log::info!("managed: Fib(10) = 55"),
            other => log::error!("managed: unexpected Fib result {:?}", other),
        }
        match proton_kernel::jit::compile(fib) {
            Ok(addr) => log::info!("managed: Fib compiled at {:#x}", addr),
            Err(err) => log::error!("managed: compile failed: {}", err),
        }

        loop {
            sched::sleep(1000);
            log::debug!("managed: uptime {} ms", timer::uptime_ms());
        }
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("KERNEL PANIC: {}", info);
    arch::halt_forever();
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The host build exists for the test harness; the kernel proper only
    // runs on bare metal.
    println!("proton-kernel: host build; run `cargo test` for the suites");
}
