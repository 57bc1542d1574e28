//! Interrupt descriptor table: all 256 gates.
//!
//! - Vectors 0-31 are CPU exceptions. Their handlers dump a diagnostic
//!   (vector, name, error code when present, saved rip/rflags/rsp) and
//!   halt forever. Nothing in this kernel recovers from an exception.
//!   The double fault runs on its own IST stack so it can be serviced
//!   even when the kernel stack itself is gone.
//! - Vectors 0x20-0x2F are hardware IRQs. Timer, keyboard and mouse
//!   forward their event to the driver interfaces, everything else just
//!   acknowledges. IRQ handlers never allocate and never enter the
//!   scheduler; they only record events for task-level code.
//! - Vector 0x80 is the software syscall gate, reachable from ring 3.

use spin::Lazy;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{
    InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
};
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::drivers::{ps2_keyboard, ps2_mouse, timer};
use crate::interrupts::{gdt, pic};
use crate::syscall;
use crate::{halt_forever, println};

static EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security",
    "reserved",
];

fn fatal_exception(vector: u8, error_code: Option<u64>, frame: &InterruptStackFrame) -> ! {
    x86_64::instructions::interrupts::disable();

    let name = EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("unknown");
    println!("==================== FATAL ====================");
    println!("exception {:#04x}: {}", vector, name);
    if let Some(code) = error_code {
        println!("error code: {:#x}", code);
    }
    println!(
        "rip={:#x} rsp={:#x} rflags={:?}",
        frame.instruction_pointer.as_u64(),
        frame.stack_pointer.as_u64(),
        frame.cpu_flags
    );
    println!("system halted");
    halt_forever()
}

macro_rules! fatal_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            fatal_exception($vector, None, &frame)
        }
    };
}

macro_rules! fatal_handler_with_code {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            fatal_exception($vector, Some(error_code), &frame)
        }
    };
}

fatal_handler!(divide_error_handler, 0);
fatal_handler!(debug_handler, 1);
fatal_handler!(non_maskable_interrupt_handler, 2);
fatal_handler!(breakpoint_handler, 3);
fatal_handler!(overflow_handler, 4);
fatal_handler!(bound_range_exceeded_handler, 5);
fatal_handler!(invalid_opcode_handler, 6);
fatal_handler!(device_not_available_handler, 7);
fatal_handler!(coprocessor_segment_overrun_handler, 9);
fatal_handler_with_code!(invalid_tss_handler, 10);
fatal_handler_with_code!(segment_not_present_handler, 11);
fatal_handler_with_code!(stack_segment_fault_handler, 12);
fatal_handler_with_code!(general_protection_fault_handler, 13);
fatal_handler!(x87_floating_point_handler, 16);
fatal_handler_with_code!(alignment_check_handler, 17);
fatal_handler!(simd_floating_point_handler, 19);
fatal_handler!(virtualization_handler, 20);
fatal_handler_with_code!(cp_protection_handler, 21);
fatal_handler!(hv_injection_handler, 28);
fatal_handler_with_code!(vmm_communication_handler, 29);
fatal_handler_with_code!(security_exception_handler, 30);

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    fatal_exception(8, Some(error_code), &frame)
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    fatal_exception(18, None, &frame)
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    println!("page fault at {:?} ({:?})", Cr2::read(), error_code);
    fatal_exception(14, Some(error_code.bits()), &frame)
}

// Hardware IRQ handlers. Record the event, acknowledge, return.

extern "x86-interrupt" fn timer_interrupt_handler(_frame: InterruptStackFrame) {
    timer::record_tick();
    // SAFETY: we are the handler for this vector.
    unsafe {
        pic::end_of_interrupt(pic::InterruptIndex::Timer.as_u8());
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_frame: InterruptStackFrame) {
    let mut port = Port::new(0x60);
    // SAFETY: reading the PS/2 data port consumes the pending byte.
    let scancode: u8 = unsafe { port.read() };
    ps2_keyboard::enqueue_scancode(scancode);
    // SAFETY: we are the handler for this vector.
    unsafe {
        pic::end_of_interrupt(pic::InterruptIndex::Keyboard.as_u8());
    }
}

extern "x86-interrupt" fn mouse_interrupt_handler(_frame: InterruptStackFrame) {
    let mut port = Port::new(0x60);
    // SAFETY: reading the PS/2 data port consumes the pending byte.
    let byte: u8 = unsafe { port.read() };
    ps2_mouse::handle_byte(byte);
    // SAFETY: we are the handler for this vector.
    unsafe {
        pic::end_of_interrupt(pic::InterruptIndex::Mouse.as_u8());
    }
}

/// Acknowledge-only handler for the remaining PIC vectors, spurious
/// interrupts from both controllers included.
macro_rules! irq_ack_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            // SAFETY: we are the handler for this vector.
            unsafe {
                pic::end_of_interrupt($vector);
            }
        }
    };
}

irq_ack_handler!(irq_ack_0x22, 0x22);
irq_ack_handler!(irq_ack_0x23, 0x23);
irq_ack_handler!(irq_ack_0x24, 0x24);
irq_ack_handler!(irq_ack_0x25, 0x25);
irq_ack_handler!(irq_ack_0x26, 0x26);
irq_ack_handler!(irq_ack_0x27, 0x27);
irq_ack_handler!(irq_ack_0x28, 0x28);
irq_ack_handler!(irq_ack_0x29, 0x29);
irq_ack_handler!(irq_ack_0x2a, 0x2A);
irq_ack_handler!(irq_ack_0x2b, 0x2B);
irq_ack_handler!(irq_ack_0x2d, 0x2D);
irq_ack_handler!(irq_ack_0x2e, 0x2E);
irq_ack_handler!(irq_ack_0x2f, 0x2F);

/// Vectors above the PIC range that nothing installs: ignore.
extern "x86-interrupt" fn unexpected_interrupt_handler(_frame: InterruptStackFrame) {}

static IDT: Lazy<InterruptDescriptorTable> = Lazy::new(|| {
    let mut idt = InterruptDescriptorTable::new();

    idt.divide_error.set_handler_fn(divide_error_handler);
    idt.debug.set_handler_fn(debug_handler);
    idt.non_maskable_interrupt
        .set_handler_fn(non_maskable_interrupt_handler);
    idt.breakpoint.set_handler_fn(breakpoint_handler);
    idt.overflow.set_handler_fn(overflow_handler);
    idt.bound_range_exceeded
        .set_handler_fn(bound_range_exceeded_handler);
    idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
    idt.device_not_available
        .set_handler_fn(device_not_available_handler);
    // The double fault must stay serviceable even with a corrupted kernel
    // stack, so it gets the dedicated IST stack from the TSS.
    // SAFETY: the IST index is populated by gdt::init before interrupts fire.
    unsafe {
        idt.double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
    }
    idt[9].set_handler_fn(coprocessor_segment_overrun_handler);
    idt.invalid_tss.set_handler_fn(invalid_tss_handler);
    idt.segment_not_present
        .set_handler_fn(segment_not_present_handler);
    idt.stack_segment_fault
        .set_handler_fn(stack_segment_fault_handler);
    idt.general_protection_fault
        .set_handler_fn(general_protection_fault_handler);
    idt.page_fault.set_handler_fn(page_fault_handler);
    idt.x87_floating_point
        .set_handler_fn(x87_floating_point_handler);
    idt.alignment_check.set_handler_fn(alignment_check_handler);
    idt.machine_check.set_handler_fn(machine_check_handler);
    idt.simd_floating_point
        .set_handler_fn(simd_floating_point_handler);
    idt.virtualization.set_handler_fn(virtualization_handler);
    idt.cp_protection_exception
        .set_handler_fn(cp_protection_handler);
    idt.hv_injection_exception
        .set_handler_fn(hv_injection_handler);
    idt.vmm_communication_exception
        .set_handler_fn(vmm_communication_handler);
    idt.security_exception
        .set_handler_fn(security_exception_handler);

    for vector in 48u8..=255 {
        idt[vector].set_handler_fn(unexpected_interrupt_handler);
    }

    idt[pic::InterruptIndex::Timer.as_u8()].set_handler_fn(timer_interrupt_handler);
    idt[pic::InterruptIndex::Keyboard.as_u8()].set_handler_fn(keyboard_interrupt_handler);
    idt[pic::InterruptIndex::Mouse.as_u8()].set_handler_fn(mouse_interrupt_handler);

    idt[0x22].set_handler_fn(irq_ack_0x22);
    idt[0x23].set_handler_fn(irq_ack_0x23);
    idt[0x24].set_handler_fn(irq_ack_0x24);
    idt[0x25].set_handler_fn(irq_ack_0x25);
    idt[0x26].set_handler_fn(irq_ack_0x26);
    idt[0x27].set_handler_fn(irq_ack_0x27);
    idt[0x28].set_handler_fn(irq_ack_0x28);
    idt[0x29].set_handler_fn(irq_ack_0x29);
    idt[0x2A].set_handler_fn(irq_ack_0x2a);
    idt[0x2B].set_handler_fn(irq_ack_0x2b);
    idt[0x2D].set_handler_fn(irq_ack_0x2d);
    idt[0x2E].set_handler_fn(irq_ack_0x2e);
    idt[0x2F].set_handler_fn(irq_ack_0x2f);

    // Software syscall gate, the one entry user code may invoke directly.
    // Trap-gate semantics: interrupts stay enabled across the syscall, so
    // a task that yields inside one hands the next task a live timer.
    // SAFETY: the stub saves every register it touches and returns via iretq.
    unsafe {
        idt[syscall::SYSCALL_VECTOR]
            .set_handler_addr(VirtAddr::new(syscall::entry_address()))
            .set_privilege_level(PrivilegeLevel::Ring3)
            .disable_interrupts(false);
    }

    idt
});

pub fn init() {
    IDT.load();
}
