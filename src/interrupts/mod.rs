//! Descriptor tables and interrupt plumbing.
//!
//! `init` runs the pieces in dependency order: segments and the TSS
//! first (exception handling needs the IST stack), then the gate table,
//! then the remapped interrupt controllers. Interrupts stay disabled
//! until boot code explicitly enables them afterwards.

pub mod gdt;
pub mod idt;
pub mod pic;

pub use pic::enable_irq;

pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
}
