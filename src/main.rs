#![no_std]
#![no_main]

extern crate rlibc;

use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;

use helios_kernel::memory::paging::BootFrameBuffer;
use helios_kernel::{drivers, halt_forever, interrupts, memory, println, task};

entry_point!(kernel_main);

/// Flattens the bootloader's framebuffer description into the record
/// paging and the cursor bounds consume. Under the identity-mapped
/// design the buffer address doubles as its physical address.
fn boot_framebuffer(boot_info: &mut BootInfo) -> BootFrameBuffer {
    match boot_info.framebuffer.as_mut() {
        Some(framebuffer) => {
            let info = framebuffer.info();
            BootFrameBuffer {
                phys_addr: framebuffer.buffer_mut().as_mut_ptr() as u64,
                width: info.width,
                height: info.height,
                pitch: info.stride * info.bytes_per_pixel,
                bpp: info.bytes_per_pixel * 8,
            }
        }
        None => BootFrameBuffer::default(),
    }
}

pub fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    helios_kernel::init_serial();
    println!("helios: booting");

    let framebuffer = boot_framebuffer(boot_info);

    // Strict ordering: descriptors and gates must exist before anything
    // can trap, the address space before the heap is touched through it,
    // the heap before tasks can be allocated.
    interrupts::init();
    // SAFETY: boot code runs inside the first identity-mapped gigabyte.
    unsafe {
        memory::paging::init(&framebuffer);
    }
    // SAFETY: single boot-time call.
    if let Err(reason) = unsafe { memory::init_heap() } {
        println!("helios: heap init failed: {}", reason);
        halt_forever();
    }

    drivers::ps2_mouse::set_bounds(framebuffer.width, framebuffer.height);
    task::init();

    x86_64::instructions::interrupts::enable();
    println!(
        "helios: up, {} tasks, {} bytes heap free",
        task::task_count(),
        memory::free_space()
    );

    // The boot path stays alive as task 0: sleep until something
    // happens, offer the CPU around, repeat.
    loop {
        drivers::timer::wait_ticks(1);
        task::yield_now();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("PANIC: {} | {:?}", info.message(), info.location());
    halt_forever()
}
