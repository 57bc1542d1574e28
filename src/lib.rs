#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

pub mod drivers;
pub mod interrupts;
pub mod memory;
pub mod syscall;
pub mod task;

use spin::Mutex;
use uart_16550::SerialPort;

pub static SERIAL: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x3F8) });

/// Brings the serial port up. Must run before the first `println!`.
pub fn init_serial() {
    SERIAL.lock().init();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let mut serial = $crate::SERIAL.lock();
        let _ = write!(serial, $($arg)*);
    }};
}

#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let mut serial = $crate::SERIAL.lock();
        let _ = writeln!(serial, $($arg)*);
    }};
}

/// Terminal stop: interrupts off, then `hlt` until the end of time.
///
/// Every fatal path in the kernel (malformed descriptors at boot, unhandled
/// CPU exception, all tasks dead) ends up here after logging its diagnostic.
pub fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
