//! Global descriptor table and task-state segment.
//!
//! The table layout is fixed and earlier boot stages already assume it:
//!
//! | offset | descriptor            |
//! |--------|-----------------------|
//! | 0x00   | null                  |
//! | 0x08   | kernel code (DPL 0)   |
//! | 0x10   | kernel data (DPL 0)   |
//! | 0x18   | user code (DPL 3)     |
//! | 0x20   | user data (DPL 3)     |
//! | 0x28   | TSS (16-byte entry)   |
//!
//! The TSS carries the ring-0 stack pointer loaded on privilege
//! transitions (repointed per task by the scheduler) and one interrupt
//! stack, a dedicated double-fault stack that stays usable even when the
//! regular kernel stack is gone. Before the table is activated its access
//! bytes are checked against the exact patterns the CPU expects; any
//! deviation is fatal, since every later privilege transition would be
//! built on a broken table.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::size_of;

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::{lgdt, load_tss};
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::{halt_forever, println};

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// IST slot reserved for the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const GDT_ENTRIES: usize = 7;
const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

// Access bytes as the CPU defines them: present | ring | code/data type.
const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
/// Present | 64-bit available TSS.
const ACCESS_TSS: u8 = 0x89;

/// L bit in the granularity byte's flag nibble, marking 64-bit code.
const FLAG_LONG_MODE: u8 = 0x20;

const ACCESS_PRESENT: u8 = 0x80;

struct GdtState {
    table: UnsafeCell<[u64; GDT_ENTRIES]>,
    tss: UnsafeCell<TaskStateSegment>,
}

// SAFETY: single-core kernel; mutation happens during boot sequencing and
// through `set_kernel_stack`, which performs one aligned 64-bit store.
unsafe impl Sync for GdtState {}

static STATE: GdtState = GdtState {
    table: UnsafeCell::new([0; GDT_ENTRIES]),
    tss: UnsafeCell::new(TaskStateSegment::new()),
};

#[repr(align(16))]
struct DoubleFaultStack(UnsafeCell<[u8; DOUBLE_FAULT_STACK_SIZE]>);

// SAFETY: only the CPU writes here, and only while handling a double fault.
unsafe impl Sync for DoubleFaultStack {}

static DOUBLE_FAULT_STACK: DoubleFaultStack =
    DoubleFaultStack(UnsafeCell::new([0; DOUBLE_FAULT_STACK_SIZE]));

/// Encodes a flat long-mode code or data descriptor. Base and limit stay
/// zero; only the access byte and the flag nibble matter in 64-bit mode.
const fn segment_descriptor(access: u8, flags: u8) -> u64 {
    ((access as u64) << 40) | (((flags & 0xF0) as u64) << 48)
}

/// Encodes the 16-byte system descriptor for a TSS at `base`.
const fn tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
    let mut low = 0u64;
    low |= (limit as u64) & 0xFFFF;
    low |= (base & 0xFFFF) << 16;
    low |= ((base >> 16) & 0xFF) << 32;
    low |= (ACCESS_TSS as u64) << 40;
    low |= (((limit >> 16) & 0x0F) as u64) << 48;
    low |= ((base >> 24) & 0xFF) << 56;
    (low, base >> 32)
}

#[inline]
fn access_byte(descriptor: u64) -> u8 {
    (descriptor >> 40) as u8
}

/// Checks the built table against the patterns the architecture mandates
/// before it is allowed anywhere near `lgdt`.
fn verify_layout(
    table: &[u64; GDT_ENTRIES],
    double_fault_stack_top: u64,
) -> Result<(), &'static str> {
    if table[0] != 0 {
        return Err("null descriptor is not null");
    }
    if access_byte(table[1]) != ACCESS_KERNEL_CODE {
        return Err("kernel code access byte mismatch");
    }
    if access_byte(table[2]) != ACCESS_KERNEL_DATA {
        return Err("kernel data access byte mismatch");
    }
    if access_byte(table[3]) != ACCESS_USER_CODE {
        return Err("user code access byte mismatch");
    }
    if access_byte(table[4]) != ACCESS_USER_DATA {
        return Err("user data access byte mismatch");
    }
    if access_byte(table[5]) & ACCESS_PRESENT == 0 {
        return Err("TSS descriptor not present");
    }
    if double_fault_stack_top == 0 {
        return Err("double fault stack missing");
    }
    Ok(())
}

#[inline]
fn read_rsp() -> u64 {
    let rsp: u64;
    // SAFETY: reading rsp has no side effects.
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    rsp
}

/// Builds the descriptor table, self-checks it, and activates it: `lgdt`,
/// a far-return reload of all segment registers, then `ltr`.
///
/// Halts with a diagnostic when the self-check fails; boot cannot proceed
/// on a malformed table.
pub fn init() {
    // SAFETY: boot-time single-threaded access to the singletons.
    let pointer = unsafe {
        let table = &mut *STATE.table.get();
        let tss = &mut *STATE.tss.get();

        let df_stack_top =
            DOUBLE_FAULT_STACK.0.get() as u64 + DOUBLE_FAULT_STACK_SIZE as u64;
        tss.privilege_stack_table[0] = VirtAddr::new(read_rsp());
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::new(df_stack_top);
        tss.iomap_base = size_of::<TaskStateSegment>() as u16;

        table[0] = 0;
        table[1] = segment_descriptor(ACCESS_KERNEL_CODE, FLAG_LONG_MODE);
        table[2] = segment_descriptor(ACCESS_KERNEL_DATA, 0);
        table[3] = segment_descriptor(ACCESS_USER_CODE, FLAG_LONG_MODE);
        table[4] = segment_descriptor(ACCESS_USER_DATA, 0);

        let tss_base = tss as *const TaskStateSegment as u64;
        let (low, high) = tss_descriptor(tss_base, (size_of::<TaskStateSegment>() - 1) as u32);
        table[5] = low;
        table[6] = high;

        if let Err(reason) = verify_layout(table, df_stack_top) {
            println!("gdt: self-check failed: {}", reason);
            halt_forever();
        }

        DescriptorTablePointer {
            limit: (size_of::<[u64; GDT_ENTRIES]>() - 1) as u16,
            base: VirtAddr::new(table.as_ptr() as u64),
        }
    };

    // SAFETY: the table was just built and verified; selectors below match
    // its fixed layout. CS::set_reg performs the far-return trampoline.
    unsafe {
        lgdt(&pointer);
        CS::set_reg(SegmentSelector(KERNEL_CODE_SELECTOR));
        DS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        ES::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        SS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        FS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        GS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        load_tss(SegmentSelector(TSS_SELECTOR));
    }
}

/// Repoints ring-0 entry at `top`. The scheduler calls this before
/// switching to a user task so traps land on that task's kernel stack.
pub fn set_kernel_stack(top: u64) {
    // SAFETY: aligned 64-bit store into the live TSS; single core.
    unsafe {
        (*STATE.tss.get()).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
