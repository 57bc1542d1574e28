//! The context-switch primitive and the ring-3 entry trampoline.
//!
//! `switch_context` pushes the callee-saved registers, parks the old
//! stack pointer in the previous task's record, adopts the new stack and
//! pops the registers back. The push/pop order mirrors
//! [`frame::SwitchFrame`](super::frame::SwitchFrame); change one and you
//! must change the other.

use core::arch::global_asm;

use crate::interrupts::gdt::USER_DATA_SELECTOR;

global_asm!(
    r#"
    .section .text

    // switch_context(prev_rsp_slot: *mut u64 [rdi], next_rsp: u64 [rsi])
    //
    // Saves the current context onto the running stack, stores rsp into
    // *prev_rsp_slot, switches to next_rsp and restores. Execution
    // resumes wherever the new stack's SwitchFrame says, either back in
    // kernel code after an earlier switch or in user_entry_trampoline
    // for a task that has never run.
    .global switch_context
switch_context:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    // First resumption target for user tasks. The spawn code left an
    // iretq frame right above the SwitchFrame: rip, cs, rflags, rsp, ss
    // with ring-3 selectors. Point the data segments at the user data
    // descriptor and drop to ring 3.
    .global user_entry_trampoline
user_entry_trampoline:
    mov ax, {user_data}
    mov ds, ax
    mov es, ax
    iretq
"#,
    user_data = const USER_DATA_SELECTOR,
);

extern "C" {
    /// See the asm above. Never call with interrupts in an inconsistent
    /// state; the scheduler is the only intended caller.
    pub fn switch_context(prev_rsp_slot: *mut u64, next_rsp: u64);

    /// Not a callable function; its address goes into fabricated user
    /// frames as the first return target.
    pub fn user_entry_trampoline();
}
