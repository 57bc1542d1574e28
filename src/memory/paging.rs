//! Boot-time page-table construction.
//!
//! One address space, built once: the first gigabyte of physical memory
//! is identity-mapped (virtual == physical), with an ordinary 4 KiB page
//! table covering the first 2 MiB (kernel code and data live there) and
//! 2 MiB huge pages for the rest. Every entry is present, writable and
//! user-accessible; user tasks deliberately share the kernel's address
//! space instead of getting isolated ones. If the framebuffer sits above
//! the identity-mapped gigabyte, a second page directory is slotted into
//! the PDPT to cover it.
//!
//! There is no error path here. Bogus boot info produces an incomplete
//! mapping that surfaces later as a page fault; this runs exactly once,
//! before anything that could recover from it anyway.

use spin::Mutex;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::PhysAddr;

/// Span of the identity-mapped region.
pub const IDENTITY_SPAN: u64 = 1 << 30;

const PAGE_SIZE: u64 = 4096;
const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
const ENTRIES: usize = 512;

/// Minimum bytes of framebuffer mapping installed above the identity span.
const FRAMEBUFFER_MIN_SPAN: u64 = 8 * 1024 * 1024;

/// Framebuffer description handed over by the bootloader stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootFrameBuffer {
    /// Physical base address of the pixel buffer.
    pub phys_addr: u64,
    /// Visible pixels per row.
    pub width: usize,
    /// Visible rows.
    pub height: usize,
    /// Bytes per row, padding included.
    pub pitch: usize,
    /// Bits per pixel.
    pub bpp: usize,
}

impl BootFrameBuffer {
    /// Bytes the pixel buffer occupies.
    pub fn byte_span(&self) -> u64 {
        (self.pitch * self.height) as u64
    }
}

/// The four table levels plus the spare directory for a high framebuffer.
pub struct AddressSpace {
    pml4: PageTable,
    pdpt: PageTable,
    directory: PageTable,
    first_table: PageTable,
    framebuffer_directory: PageTable,
}

impl AddressSpace {
    pub const fn new() -> Self {
        Self {
            pml4: PageTable::new(),
            pdpt: PageTable::new(),
            directory: PageTable::new(),
            first_table: PageTable::new(),
            framebuffer_directory: PageTable::new(),
        }
    }
}

static ADDRESS_SPACE: Mutex<AddressSpace> = Mutex::new(AddressSpace::new());

#[inline]
const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Table addresses are used as physical addresses directly. The kernel
/// image itself lives inside the identity-mapped region, so this holds
/// both before and after activation.
#[inline]
fn table_addr(table: &PageTable) -> PhysAddr {
    PhysAddr::new(table as *const PageTable as u64)
}

fn build(space: &mut AddressSpace, framebuffer: &BootFrameBuffer) {
    let leaf = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::USER_ACCESSIBLE;
    let huge = leaf | PageTableFlags::HUGE_PAGE;

    space.pml4.zero();
    space.pdpt.zero();
    space.directory.zero();
    space.first_table.zero();
    space.framebuffer_directory.zero();

    // 4 KiB pages for the first 2 MiB.
    for (i, entry) in space.first_table.iter_mut().enumerate() {
        entry.set_addr(PhysAddr::new(i as u64 * PAGE_SIZE), leaf);
    }

    // 2 MiB huge pages for the remainder of the first gigabyte. Slot 0
    // points down at the 4 KiB table instead.
    space
        .directory[0]
        .set_addr(table_addr(&space.first_table), leaf);
    for i in 1..ENTRIES {
        space.directory[i].set_addr(PhysAddr::new(i as u64 * HUGE_PAGE_SIZE), huge);
    }

    space.pdpt[0].set_addr(table_addr(&space.directory), leaf);
    space.pml4[0].set_addr(table_addr(&space.pdpt), leaf);

    map_framebuffer(space, framebuffer, huge);
}

/// Installs a dedicated page directory for a framebuffer that lies above
/// the identity-mapped gigabyte. The mapped window starts at the address
/// rounded down to a 2 MiB boundary and spans at least 8 MiB, stretched
/// to cover the whole pixel buffer when that is larger.
fn map_framebuffer(space: &mut AddressSpace, framebuffer: &BootFrameBuffer, huge: PageTableFlags) {
    let base = framebuffer.phys_addr;
    if base < IDENTITY_SPAN {
        // Already covered by the identity map.
        return;
    }

    let pdpt_index = (base >> 30) as usize;
    if pdpt_index >= ENTRIES {
        // Beyond what one PDPT can reach; the mapping stays incomplete.
        return;
    }

    let window_start = align_down(base, HUGE_PAGE_SIZE);
    let window_end = base + framebuffer.byte_span().max(FRAMEBUFFER_MIN_SPAN);

    let leaf = huge & !PageTableFlags::HUGE_PAGE;
    space.pdpt[pdpt_index].set_addr(table_addr(&space.framebuffer_directory), leaf);

    let directory_base = align_down(window_start, 1 << 30);
    let mut phys = window_start;
    while phys < window_end {
        let slot = ((phys - directory_base) / HUGE_PAGE_SIZE) as usize;
        if slot >= ENTRIES {
            break;
        }
        space.framebuffer_directory[slot].set_addr(PhysAddr::new(phys), huge);
        phys += HUGE_PAGE_SIZE;
    }
}

/// Walks `space` the way the MMU would and returns the physical address
/// and leaf flags for `virt`, or `None` where the mapping is absent.
pub fn translate(space: &AddressSpace, virt: u64) -> Option<(u64, PageTableFlags)> {
    let pml4_index = ((virt >> 39) & 0x1FF) as usize;
    let pdpt_index = ((virt >> 30) & 0x1FF) as usize;
    let dir_index = ((virt >> 21) & 0x1FF) as usize;
    let table_index = ((virt >> 12) & 0x1FF) as usize;

    let pml4_entry = &space.pml4[pml4_index];
    if !pml4_entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    // SAFETY: link entries store the addresses of tables owned by `space`,
    // which under the identity assumption can be dereferenced directly.
    let pdpt = unsafe { &*(pml4_entry.addr().as_u64() as *const PageTable) };

    let pdpt_entry = &pdpt[pdpt_index];
    if !pdpt_entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let directory = unsafe { &*(pdpt_entry.addr().as_u64() as *const PageTable) };

    let dir_entry = &directory[dir_index];
    let dir_flags = dir_entry.flags();
    if !dir_flags.contains(PageTableFlags::PRESENT) {
        return None;
    }
    if dir_flags.contains(PageTableFlags::HUGE_PAGE) {
        let offset = virt & (HUGE_PAGE_SIZE - 1);
        return Some((dir_entry.addr().as_u64() + offset, dir_flags));
    }

    let table = unsafe { &*(dir_entry.addr().as_u64() as *const PageTable) };
    let entry = &table[table_index];
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some((entry.addr().as_u64() + (virt & (PAGE_SIZE - 1)), flags))
}

/// Builds the identity mapping described by `framebuffer` and switches
/// CR3 over to it.
///
/// # Safety
///
/// Boot-time, one shot. The caller must be executing from memory that is
/// identity-mapped by the tables built here.
pub unsafe fn init(framebuffer: &BootFrameBuffer) {
    let mut space = ADDRESS_SPACE.lock();
    build(&mut space, framebuffer);

    let frame = PhysFrame::containing_address(table_addr(&space.pml4));
    Cr3::write(frame, Cr3Flags::empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(framebuffer: BootFrameBuffer) -> Box<AddressSpace> {
        let mut space = Box::new(AddressSpace::new());
        build(&mut space, &framebuffer);
        space
    }

    fn user_rw(flags: PageTableFlags) -> bool {
        flags.contains(
            PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::USER_ACCESSIBLE,
        )
    }

    #[test]
    fn first_gigabyte_is_identity_mapped() {
        let space = built(BootFrameBuffer::default());
        let samples = [
            0,
            0x1000,
            0x1F_F000,
            HUGE_PAGE_SIZE - PAGE_SIZE,
            HUGE_PAGE_SIZE,
            HUGE_PAGE_SIZE + 0x1234,
            3 * HUGE_PAGE_SIZE + 42,
            0x1000_0000,
            IDENTITY_SPAN - HUGE_PAGE_SIZE,
            IDENTITY_SPAN - 1,
        ];
        for virt in samples {
            let (phys, flags) = translate(&space, virt).expect("mapping present");
            assert_eq!(phys, virt, "identity broken at {virt:#x}");
            assert!(user_rw(flags), "flags wrong at {virt:#x}: {flags:?}");
        }
    }

    #[test]
    fn beyond_first_gigabyte_is_unmapped_by_default() {
        let space = built(BootFrameBuffer::default());
        assert!(translate(&space, IDENTITY_SPAN).is_none());
        assert!(translate(&space, 4 * IDENTITY_SPAN).is_none());
    }

    #[test]
    fn huge_bit_only_at_directory_level() {
        let space = built(BootFrameBuffer::default());
        assert!(!space.pml4[0].flags().contains(PageTableFlags::HUGE_PAGE));
        assert!(!space.pdpt[0].flags().contains(PageTableFlags::HUGE_PAGE));
        assert!(!space.directory[0].flags().contains(PageTableFlags::HUGE_PAGE));
        assert!(space.directory[1].flags().contains(PageTableFlags::HUGE_PAGE));
        for entry in space.first_table.iter() {
            assert!(!entry.flags().contains(PageTableFlags::HUGE_PAGE));
        }
    }

    #[test]
    fn first_two_megabytes_use_small_pages() {
        let space = built(BootFrameBuffer::default());
        for (i, entry) in space.first_table.iter().enumerate() {
            assert_eq!(entry.addr().as_u64(), i as u64 * PAGE_SIZE);
            assert!(user_rw(entry.flags()));
        }
    }

    #[test]
    fn low_framebuffer_needs_no_extra_directory() {
        // 0x1000_0000 sits inside the identity-mapped gigabyte and must be
        // reachable without the spare directory being installed.
        let space = built(BootFrameBuffer {
            phys_addr: 0x1000_0000,
            width: 1024,
            height: 768,
            pitch: 4096,
            bpp: 32,
        });
        let (phys, flags) = translate(&space, 0x1000_0000).unwrap();
        assert_eq!(phys, 0x1000_0000);
        assert!(user_rw(flags));
        for i in 1..ENTRIES {
            assert!(space.pdpt[i].is_unused(), "unexpected PDPT slot {i}");
        }
    }

    #[test]
    fn high_framebuffer_gets_its_own_directory() {
        let base: u64 = 0x1_0020_0000; // just above 4 GiB, 2 MiB aligned
        let space = built(BootFrameBuffer {
            phys_addr: base,
            width: 1280,
            height: 800,
            pitch: 5120,
            bpp: 32,
        });

        let slot = (base >> 30) as usize;
        assert!(!space.pdpt[slot].is_unused(), "PDPT slot {slot} missing");

        // At least 8 MiB from the rounded-down base must be mapped.
        for offset in (0..FRAMEBUFFER_MIN_SPAN).step_by(HUGE_PAGE_SIZE as usize) {
            let virt = base + offset;
            let (phys, flags) = translate(&space, virt)
                .unwrap_or_else(|| panic!("framebuffer hole at {virt:#x}"));
            assert_eq!(phys, virt);
            assert!(user_rw(flags));
        }
    }

    #[test]
    fn high_framebuffer_window_rounds_down() {
        let base: u64 = 0x1_0030_1000; // inside a 2 MiB page, above 4 GiB
        let space = built(BootFrameBuffer {
            phys_addr: base,
            width: 640,
            height: 480,
            pitch: 2560,
            bpp: 32,
        });
        let rounded = align_down(base, HUGE_PAGE_SIZE);
        let (phys, _) = translate(&space, rounded).expect("window start unmapped");
        assert_eq!(phys, rounded);
        // End of the minimum window is still covered even though the
        // framebuffer itself is tiny.
        let tail = base + FRAMEBUFFER_MIN_SPAN - 1;
        assert!(translate(&space, tail).is_some());
    }
}
