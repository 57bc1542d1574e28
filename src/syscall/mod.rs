//! Software interrupt syscall surface.
//!
//! User tasks reach the kernel through `int 0x80`, the one IDT gate with
//! a ring-3 privilege level. Register convention: syscall number in
//! `rax`, one optional pointer/value argument in `rdi`, result back in
//! `rax`. The entry stub preserves every other caller-saved register and
//! returns with `iretq`, so a task that yielded inside a syscall resumes
//! exactly where it trapped.
//!
//! Unknown numbers are ignored and return 0; there is no error channel.

use core::arch::global_asm;

use crate::drivers::{clock, power, ps2_mouse};
use crate::{memory, println, task};

/// IDT vector of the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Longest line syscall 2 will read out of user memory.
const LOG_LINE_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Yield = 0,
    Exit = 1,
    LogLine = 2,
    Shutdown = 4,
    CursorState = 5,
    Allocate = 6,
    Free = 7,
    TimeString = 8,
    Unknown = u64::MAX,
}

impl From<u64> for SyscallNumber {
    fn from(number: u64) -> Self {
        match number {
            0 => Self::Yield,
            1 => Self::Exit,
            2 => Self::LogLine,
            4 => Self::Shutdown,
            5 => Self::CursorState,
            6 => Self::Allocate,
            7 => Self::Free,
            8 => Self::TimeString,
            _ => Self::Unknown,
        }
    }
}

global_asm!(
    r#"
    .section .text

    // int 0x80 lands here. The CPU already switched to the task's
    // kernel stack (TSS.RSP0) and pushed the interrupt return frame.
    // Save the caller-saved registers the dispatcher may clobber, keep
    // the stack 16-byte aligned across the call, and hand rax/rdi over
    // as arguments. rax carries the result back through iretq.
    .global syscall_entry
syscall_entry:
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    mov rsi, rdi
    mov rdi, rax
    sub rsp, 8
    call syscall_dispatch
    add rsp, 8
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    iretq
"#
);

extern "C" {
    fn syscall_entry();
}

/// Address of the asm entry stub, for the IDT gate install.
pub fn entry_address() -> u64 {
    syscall_entry as usize as u64
}

/// Routes one syscall. Called from the entry stub with interrupts
/// disabled by the gate; yield and exit may switch away and come back.
#[no_mangle]
extern "C" fn syscall_dispatch(number: u64, arg: u64) -> u64 {
    match SyscallNumber::from(number) {
        SyscallNumber::Yield => {
            task::schedule();
            0
        }
        SyscallNumber::Exit => task::exit_current_task(),
        SyscallNumber::LogLine => {
            log_user_line(arg);
            0
        }
        SyscallNumber::Shutdown => power::shutdown(),
        SyscallNumber::CursorState => {
            if arg != 0 {
                let snapshot = ps2_mouse::cursor_state();
                // SAFETY: the caller designated this address to receive
                // the snapshot; the shared address space makes it
                // directly writable from ring 0.
                unsafe {
                    (arg as *mut ps2_mouse::CursorState).write_volatile(snapshot);
                }
            }
            0
        }
        SyscallNumber::Allocate => memory::kmalloc(arg as usize) as u64,
        SyscallNumber::Free => {
            // SAFETY: the caller promises a kmalloc pointer, the same
            // precondition kfree itself documents.
            unsafe { memory::kfree(arg as *mut u8) };
            0
        }
        SyscallNumber::TimeString => {
            if arg == 0 {
                return 0;
            }
            let text = clock::now().to_text();
            // SAFETY: as for CursorState; the buffer must hold
            // `clock::TIME_TEXT_LEN + 1` bytes.
            unsafe {
                let dest = arg as *mut u8;
                for (i, byte) in text.iter().enumerate() {
                    dest.add(i).write_volatile(*byte);
                }
                dest.add(text.len()).write_volatile(0);
            }
            text.len() as u64
        }
        SyscallNumber::Unknown => 0,
    }
}

/// Syscall 2: prints a NUL-terminated line supplied by the caller.
fn log_user_line(ptr: u64) {
    if ptr == 0 {
        return;
    }
    let mut buffer = [0u8; LOG_LINE_MAX];
    let mut len = 0;
    // SAFETY: bounded byte-wise copy out of the shared address space;
    // a bad pointer faults exactly like any other wild access would.
    unsafe {
        let base = ptr as *const u8;
        while len < LOG_LINE_MAX {
            let byte = base.add(len).read_volatile();
            if byte == 0 {
                break;
            }
            buffer[len] = byte;
            len += 1;
        }
    }
    let id = task::current_task_id().unwrap_or(0);
    match core::str::from_utf8(&buffer[..len]) {
        Ok(text) => println!("task {}: {}", id, text),
        Err(_) => println!("task {}: <non-utf8 log line>", id),
    }
}
