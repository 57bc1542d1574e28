//! Tick counter fed by IRQ 0.
//!
//! The timer interrupt does exactly two things: bump the counter and
//! invoke the registered animation callback, if any. It never calls the
//! scheduler; task switching stays cooperative.

use core::mem;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Address of a `fn()` to run on every tick; 0 means none.
static ANIMATION_HOOK: AtomicUsize = AtomicUsize::new(0);

/// IRQ-context tick bookkeeping.
pub fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    let hook = ANIMATION_HOOK.load(Ordering::Acquire);
    if hook != 0 {
        // SAFETY: the slot only ever holds addresses of `fn()` items
        // stored by `set_animation_hook`.
        let hook: fn() = unsafe { mem::transmute(hook) };
        hook();
    }
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Registers a callback run from the timer IRQ. It is interrupt
/// context: it must not allocate, schedule or block.
pub fn set_animation_hook(hook: fn()) {
    ANIMATION_HOOK.store(hook as usize, Ordering::Release);
}

pub fn clear_animation_hook() {
    ANIMATION_HOOK.store(0, Ordering::Release);
}

/// Busy-waits `count` ticks, sleeping the CPU between interrupts. This
/// is the only suspension primitive the kernel has.
pub fn wait_ticks(count: u64) {
    let deadline = ticks() + count;
    while ticks() < deadline {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_monotonically() {
        let before = ticks();
        record_tick();
        record_tick();
        assert!(ticks() >= before + 2);
    }

    #[test]
    fn animation_hook_runs_on_every_tick() {
        static HOOK_RUNS: AtomicU64 = AtomicU64::new(0);
        fn hook() {
            HOOK_RUNS.fetch_add(1, Ordering::Relaxed);
        }

        set_animation_hook(hook);
        let before = HOOK_RUNS.load(Ordering::Relaxed);
        record_tick();
        record_tick();
        record_tick();
        clear_animation_hook();
        record_tick();

        let after = HOOK_RUNS.load(Ordering::Relaxed);
        assert!(after >= before + 3);
    }
}
