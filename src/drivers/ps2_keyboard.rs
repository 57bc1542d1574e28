//! Keyboard scancode queue, fed by IRQ 1.
//!
//! The handler pushes raw bytes; whoever implements the actual keyboard
//! driver pulls them out with `dequeue_scancode` from task context.
//! Single producer (the IRQ handler), single consumer.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

const QUEUE_SIZE: usize = 256;

pub struct ScancodeQueue {
    buffer: UnsafeCell<[u8; QUEUE_SIZE]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: one writer (IRQ) and one reader (task code); each slot is
// published with a release store of `head` and consumed after an
// acquire load, so the byte is visible before the index moves.
unsafe impl Sync for ScancodeQueue {}

impl ScancodeQueue {
    pub const fn new() -> Self {
        Self {
            buffer: UnsafeCell::new([0; QUEUE_SIZE]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Appends a byte; a full queue drops it.
    pub fn push(&self, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % QUEUE_SIZE;
        if next == self.tail.load(Ordering::Acquire) {
            return;
        }
        // SAFETY: `head` is only advanced by this single producer.
        unsafe {
            (*self.buffer.get())[head] = byte;
        }
        self.head.store(next, Ordering::Release);
    }

    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the producer published this slot before moving `head`.
        let byte = unsafe { (*self.buffer.get())[tail] };
        self.tail.store((tail + 1) % QUEUE_SIZE, Ordering::Release);
        Some(byte)
    }
}

static QUEUE: ScancodeQueue = ScancodeQueue::new();

/// Called by the keyboard IRQ handler with the byte from port 0x60.
pub fn enqueue_scancode(byte: u8) {
    QUEUE.push(byte);
}

/// Drains one scancode, if any. Task context only.
pub fn dequeue_scancode() -> Option<u8> {
    QUEUE.pop()
}
