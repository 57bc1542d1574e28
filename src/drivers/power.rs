//! Best-effort machine power-off for the shutdown syscall.

use x86_64::instructions::port::Port;

use crate::{halt_forever, println};

/// Writes the ACPI S5 sleep command to the PM control ports QEMU and
/// Bochs expose. Real hardware would need an ACPI parser to find the
/// right port; if nothing reacts, the CPU halts instead.
pub fn shutdown() -> ! {
    println!("power: shutting down");
    // SAFETY: writing the sleep command to well-known PM ports; on
    // machines without them the write is ignored.
    unsafe {
        Port::<u16>::new(0x604).write(0x2000);
        Port::<u16>::new(0xB004).write(0x2000);
    }
    halt_forever()
}
