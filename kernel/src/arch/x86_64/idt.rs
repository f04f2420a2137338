// Interrupt Descriptor Table and dispatch stubs

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::irq::TrapFrame;

/// First vector delivered by the interrupt controller for hardware IRQs.
pub const IRQ_BASE: u8 = 32;

fn trap_frame(vector: u32, error_code: u64, frame: &InterruptStackFrame) -> TrapFrame {
    TrapFrame {
        vector,
        error_code,
        instruction_pointer: frame.instruction_pointer.as_u64(),
        code_segment: frame.code_segment.0 as u64,
        cpu_flags: frame.cpu_flags.bits(),
        stack_pointer: frame.stack_pointer.as_u64(),
        stack_segment: frame.stack_segment.0 as u64,
    }
}

macro_rules! irq_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            crate::irq::dispatch(&trap_frame($vector, 0, &frame));
        }
    };
}

// Hardware interrupt window routed through the vector table. The local APIC
// timer and any managed-registered handler land here.
irq_stub!(irq32_handler, 32);
irq_stub!(irq33_handler, 33);
irq_stub!(irq34_handler, 34);
irq_stub!(irq35_handler, 35);
irq_stub!(irq36_handler, 36);
irq_stub!(irq37_handler, 37);
irq_stub!(irq38_handler, 38);
irq_stub!(irq39_handler, 39);
irq_stub!(irq40_handler, 40);
irq_stub!(irq41_handler, 41);
irq_stub!(irq42_handler, 42);
irq_stub!(irq43_handler, 43);
irq_stub!(irq44_handler, 44);
irq_stub!(irq45_handler, 45);
irq_stub!(irq46_handler, 46);
irq_stub!(irq47_handler, 47);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        // SAFETY: The IST index refers to the dedicated double-fault stack
        // installed by gdt::init before the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[32].set_handler_fn(irq32_handler);
        idt[33].set_handler_fn(irq33_handler);
        idt[34].set_handler_fn(irq34_handler);
        idt[35].set_handler_fn(irq35_handler);
        idt[36].set_handler_fn(irq36_handler);
        idt[37].set_handler_fn(irq37_handler);
        idt[38].set_handler_fn(irq38_handler);
        idt[39].set_handler_fn(irq39_handler);
        idt[40].set_handler_fn(irq40_handler);
        idt[41].set_handler_fn(irq41_handler);
        idt[42].set_handler_fn(irq42_handler);
        idt[43].set_handler_fn(irq43_handler);
        idt[44].set_handler_fn(irq44_handler);
        idt[45].set_handler_fn(irq45_handler);
        idt[46].set_handler_fn(irq46_handler);
        idt[47].set_handler_fn(irq47_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    // int3 is the JIT's trap opcode; report and continue.
    println!("BREAKPOINT at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    crate::irq::fatal_fault(&trap_frame(0, 0, &stack_frame), None);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    crate::irq::fatal_fault(&trap_frame(6, 0, &stack_frame), None);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    crate::irq::fatal_fault(&trap_frame(13, error_code, &stack_frame), None);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = super::read_cr2();
    crate::irq::fatal_fault(
        &trap_frame(14, error_code.bits(), &stack_frame),
        Some(fault_addr),
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    crate::irq::fatal_fault(&trap_frame(8, error_code, &stack_frame), None);
    crate::arch::halt_forever();
}
