//! Cooperative task scheduler.
//!
//! Tasks live in a fixed arena of slots linked into one circular ring by
//! slot index; "next" is always a checked index, never a raw pointer.
//! The task addressed by `current` is the running one, everything else
//! in the ring is READY until it exits, at which point it turns DEAD and
//! is unlinked (and its slot reclaimed) by the next walk that passes it.
//!
//! Switches happen only when task code calls `yield_now`, `schedule` or
//! `exit_current_task` (for user tasks: through the syscall gate). The
//! timer interrupt never schedules; this kernel is cooperative by
//! policy, which also means the scheduler needs no reentrancy guard
//! against interrupt context. Nothing here may be called from an IRQ
//! handler.

pub mod frame;
pub mod switch;

use core::cell::UnsafeCell;
use core::ptr;

use crate::interrupts::gdt;
use crate::memory;
use crate::{halt_forever, println};

pub use frame::TaskEntry;

pub const MAX_TASKS: usize = 16;

const KERNEL_STACK_SIZE: usize = 32 * 1024;
const USER_STACK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable; the slot `current` points at is the one actually running.
    Ready,
    /// Exited. Terminal; the walk unlinks and reclaims these.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    NotInitialized,
    CapacityExceeded,
    OutOfMemory,
}

#[derive(Clone, Copy)]
struct TaskSlot {
    used: bool,
    id: u64,
    state: TaskState,
    privilege: Privilege,
    /// Stack pointer saved by the last switch away. Meaningless while
    /// the task is the running one.
    saved_rsp: u64,
    /// Ring-0 entry stack for user tasks, loaded into the TSS before
    /// switching to them. Zero for kernel tasks.
    kernel_stack_top: u64,
    kernel_stack: *mut u8,
    user_stack: *mut u8,
    /// Index of the ring successor.
    next: usize,
}

impl TaskSlot {
    const fn empty() -> Self {
        Self {
            used: false,
            id: 0,
            state: TaskState::Dead,
            privilege: Privilege::Kernel,
            saved_rsp: 0,
            kernel_stack_top: 0,
            kernel_stack: ptr::null_mut(),
            user_stack: ptr::null_mut(),
            next: 0,
        }
    }
}

struct SchedulerState {
    initialized: bool,
    current: usize,
    /// Last ring member in spawn order; new tasks are linked after it so
    /// spawn order is preserved around the ring.
    tail: usize,
    next_id: u64,
    slots: [TaskSlot; MAX_TASKS],
}

impl SchedulerState {
    const fn new() -> Self {
        const EMPTY: TaskSlot = TaskSlot::empty();
        Self {
            initialized: false,
            current: 0,
            tail: 0,
            next_id: 0,
            slots: [EMPTY; MAX_TASKS],
        }
    }

    /// Claims slot 0 for the code path that called `init`, forming a
    /// one-element ring. Its saved stack pointer is a placeholder that
    /// the first switch away will overwrite.
    fn bootstrap(&mut self) {
        self.slots[0] = TaskSlot {
            used: true,
            id: 0,
            state: TaskState::Ready,
            next: 0,
            ..TaskSlot::empty()
        };
        self.current = 0;
        self.tail = 0;
        self.next_id = 1;
        self.initialized = true;
    }

    fn alloc_slot(&self) -> Option<usize> {
        (0..MAX_TASKS).find(|&idx| !self.slots[idx].used)
    }

    /// Links `idx` after the ring tail, keeping spawn order.
    fn link_new(&mut self, idx: usize) {
        self.slots[idx].next = self.slots[self.tail].next;
        self.slots[self.tail].next = idx;
        self.tail = idx;
    }

    fn release_slot(&mut self, idx: usize) {
        let kernel_stack = self.slots[idx].kernel_stack;
        let user_stack = self.slots[idx].user_stack;
        self.slots[idx] = TaskSlot::empty();
        // SAFETY: both pointers came from kmalloc at spawn time (or are
        // null for the bootstrap task) and the task can never run again.
        unsafe {
            memory::kfree(kernel_stack);
            memory::kfree(user_stack);
        }
    }

    /// Walks forward from `current`, unlinking and reclaiming dead slots
    /// on the way. Returns the next READY slot index, `Some(current)`
    /// when the running task is the only runnable one, or `None` when
    /// nothing in the ring is runnable anymore.
    fn advance(&mut self) -> Option<usize> {
        let anchor = self.current;
        let mut idx = self.slots[anchor].next;
        loop {
            if idx == anchor {
                return (self.slots[idx].state == TaskState::Ready).then_some(idx);
            }
            match self.slots[idx].state {
                TaskState::Ready => return Some(idx),
                TaskState::Dead => {
                    let follow = self.slots[idx].next;
                    self.slots[anchor].next = follow;
                    if self.tail == idx {
                        self.tail = anchor;
                    }
                    self.release_slot(idx);
                    idx = follow;
                }
            }
        }
    }
}

struct SchedulerGlobal {
    state: UnsafeCell<SchedulerState>,
}

// SAFETY: single core; every access goes through `with_state`, which
// masks interrupts for the duration.
unsafe impl Sync for SchedulerGlobal {}

static SCHED: SchedulerGlobal = SchedulerGlobal {
    state: UnsafeCell::new(SchedulerState::new()),
};

#[inline]
fn with_state<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> R {
    let were_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    // SAFETY: interrupts are masked and there is one core, so this is
    // the only live reference.
    let result = unsafe { f(&mut *SCHED.state.get()) };
    if were_enabled {
        x86_64::instructions::interrupts::enable();
    }
    result
}

/// Adopts the running code path as task 0 and starts the ring.
pub fn init() {
    with_state(|state| {
        *state = SchedulerState::new();
        state.bootstrap();
    });
}

fn spawn(
    entry: TaskEntry,
    privilege: Privilege,
) -> Result<u64, SpawnError> {
    let kernel_stack = memory::kmalloc(KERNEL_STACK_SIZE);
    if kernel_stack.is_null() {
        return Err(SpawnError::OutOfMemory);
    }

    let (user_stack, saved_rsp, kernel_stack_top) = match privilege {
        Privilege::Kernel => {
            // SAFETY: the stack was just allocated with this size.
            let rsp = unsafe { frame::build_kernel_frame(kernel_stack.add(KERNEL_STACK_SIZE), entry) };
            (ptr::null_mut(), rsp, 0)
        }
        Privilege::User => {
            let user_stack = memory::kmalloc(USER_STACK_SIZE);
            if user_stack.is_null() {
                // SAFETY: kernel_stack is unused beyond this point.
                unsafe { memory::kfree(kernel_stack) };
                return Err(SpawnError::OutOfMemory);
            }
            let kernel_top = kernel_stack as u64 + KERNEL_STACK_SIZE as u64;
            let user_top = user_stack as u64 + USER_STACK_SIZE as u64;
            // SAFETY: both stacks were just allocated with these sizes.
            let rsp = unsafe {
                frame::build_user_frame(kernel_stack.add(KERNEL_STACK_SIZE), user_top, entry)
            };
            (user_stack, rsp, kernel_top & !0xF)
        }
    };

    with_state(|state| {
        if !state.initialized {
            // SAFETY: the fresh stacks escape nowhere on this path.
            unsafe {
                memory::kfree(kernel_stack);
                memory::kfree(user_stack);
            }
            return Err(SpawnError::NotInitialized);
        }
        let Some(idx) = state.alloc_slot() else {
            // SAFETY: as above.
            unsafe {
                memory::kfree(kernel_stack);
                memory::kfree(user_stack);
            }
            return Err(SpawnError::CapacityExceeded);
        };

        let id = state.next_id;
        state.next_id += 1;
        state.slots[idx] = TaskSlot {
            used: true,
            id,
            state: TaskState::Ready,
            privilege,
            saved_rsp,
            kernel_stack_top,
            kernel_stack,
            user_stack,
            next: 0,
        };
        state.link_new(idx);
        Ok(id)
    })
}

/// Creates a ring-0 task that starts at `entry` on a fresh kernel stack.
pub fn spawn_kernel_task(entry: TaskEntry) -> Result<u64, SpawnError> {
    spawn(entry, Privilege::Kernel)
}

/// Creates a ring-3 task: separate user stack, and a kernel stack whose
/// fabricated frames make the first switch drop into user mode.
pub fn spawn_user_task(entry: TaskEntry) -> Result<u64, SpawnError> {
    spawn(entry, Privilege::User)
}

enum Decision {
    /// Scheduler not initialized, or the current task stays the best pick.
    Stay,
    AllDead,
    Switch {
        prev_rsp_slot: *mut u64,
        next_rsp: u64,
        kernel_stack_top: u64,
    },
}

/// Hands the CPU to the next READY task in the ring, if any.
///
/// When every task (the current one included) is dead this does not
/// return; there is no idle task to fall back to.
pub fn schedule() {
    let decision = with_state(|state| {
        if !state.initialized {
            return Decision::Stay;
        }
        match state.advance() {
            None => Decision::AllDead,
            Some(next) if next == state.current => Decision::Stay,
            Some(next) => {
                let prev = state.current;
                state.current = next;
                Decision::Switch {
                    prev_rsp_slot: &mut state.slots[prev].saved_rsp as *mut u64,
                    next_rsp: state.slots[next].saved_rsp,
                    // Only user tasks re-enter ring 0 through the TSS.
                    kernel_stack_top: match state.slots[next].privilege {
                        Privilege::User => state.slots[next].kernel_stack_top,
                        Privilege::Kernel => 0,
                    },
                }
            }
        }
    });

    match decision {
        Decision::Stay => {}
        Decision::AllDead => {
            println!("scheduler: no runnable tasks remain; halting");
            halt_forever();
        }
        Decision::Switch {
            prev_rsp_slot,
            next_rsp,
            kernel_stack_top,
        } => {
            // Repoint ring-0 entry before the stack swap so a trap taken
            // by the incoming task lands on its own kernel stack.
            if kernel_stack_top != 0 {
                gdt::set_kernel_stack(kernel_stack_top);
            }
            // SAFETY: both stack pointers come from the arena; the
            // previous slot stays allocated at least until some other
            // task's walk reclaims it, long after this switch completed.
            unsafe {
                switch::switch_context(prev_rsp_slot, next_rsp);
            }
        }
    }
}

/// Voluntary yield for kernel tasks (user tasks go through syscall 0).
pub fn yield_now() {
    schedule();
}

/// Marks the running task dead and leaves it forever. By contract this
/// never returns to the caller: either another task takes over, or the
/// machine halts because nothing is runnable.
pub fn exit_current_task() -> ! {
    with_state(|state| {
        if state.initialized {
            let current = state.current;
            state.slots[current].state = TaskState::Dead;
        }
    });
    schedule();
    // Reached only when the scheduler was never initialized.
    halt_forever()
}

/// Identifier of the running task.
pub fn current_task_id() -> Option<u64> {
    with_state(|state| {
        state
            .initialized
            .then(|| state.slots[state.current].id)
    })
}

/// Number of live (ready or running) tasks in the ring.
pub fn task_count() -> usize {
    with_state(|state| {
        state
            .slots
            .iter()
            .filter(|slot| slot.used && slot.state == TaskState::Ready)
            .count()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrapped() -> SchedulerState {
        let mut state = SchedulerState::new();
        state.bootstrap();
        state
    }

    /// Adds a task record without touching the real heap; stacks stay
    /// null, which `release_slot` accepts.
    fn spawn_logical(state: &mut SchedulerState) -> usize {
        let idx = state.alloc_slot().expect("arena full");
        let id = state.next_id;
        state.next_id += 1;
        state.slots[idx] = TaskSlot {
            used: true,
            id,
            state: TaskState::Ready,
            next: 0,
            ..TaskSlot::empty()
        };
        state.link_new(idx);
        idx
    }

    /// Runs `advance` and moves `current` the way `schedule` would.
    fn step(state: &mut SchedulerState) -> Option<u64> {
        let next = state.advance()?;
        state.current = next;
        Some(state.slots[next].id)
    }

    #[test]
    fn round_robin_visits_tasks_in_spawn_order() {
        let mut state = bootstrapped();
        let a_idx = spawn_logical(&mut state);
        let b_idx = spawn_logical(&mut state);
        let c_idx = spawn_logical(&mut state);
        let ids = (
            state.slots[a_idx].id,
            state.slots[b_idx].id,
            state.slots[c_idx].id,
        );
        assert_eq!(ids, (1, 2, 3));

        let mut visits = Vec::new();
        for _ in 0..8 {
            visits.push(step(&mut state).unwrap());
        }
        // Starting from the bootstrap task the ring reads A, B, C, then
        // wraps through the starting task again.
        assert_eq!(visits, vec![1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn mid_cycle_spawn_is_visited_on_the_next_lap() {
        let mut state = bootstrapped();
        spawn_logical(&mut state); // A = 1
        spawn_logical(&mut state); // B = 2

        assert_eq!(step(&mut state), Some(1));
        // Spawn D while A runs; it must come after the existing tasks,
        // not barge in front of them.
        spawn_logical(&mut state); // D = 3
        assert_eq!(step(&mut state), Some(2));
        assert_eq!(step(&mut state), Some(3));
        assert_eq!(step(&mut state), Some(0));
        assert_eq!(step(&mut state), Some(1));
    }

    #[test]
    fn dead_task_is_skipped_and_reclaimed() {
        let mut state = bootstrapped();
        let a_idx = spawn_logical(&mut state);
        let b_idx = spawn_logical(&mut state);
        let c_idx = spawn_logical(&mut state);
        let _ = (a_idx, c_idx);

        state.slots[b_idx].state = TaskState::Dead;

        let mut visits = Vec::new();
        for _ in 0..6 {
            visits.push(step(&mut state).unwrap());
        }
        assert_eq!(visits, vec![1, 3, 0, 1, 3, 0]);
        assert!(!state.slots[b_idx].used, "dead slot must be reclaimed");
    }

    #[test]
    fn reclaimed_slot_is_reused_by_a_later_spawn() {
        let mut state = bootstrapped();
        spawn_logical(&mut state);
        let b_idx = spawn_logical(&mut state);
        state.slots[b_idx].state = TaskState::Dead;

        // One full lap unlinks B.
        for _ in 0..3 {
            step(&mut state);
        }
        assert!(!state.slots[b_idx].used);

        let new_idx = spawn_logical(&mut state);
        assert_eq!(new_idx, b_idx, "freed slot should be first-fit reused");
        assert_eq!(state.slots[new_idx].id, 3, "ids keep increasing");
    }

    #[test]
    fn all_dead_means_no_selection() {
        let mut state = bootstrapped();
        let a_idx = spawn_logical(&mut state);
        let b_idx = spawn_logical(&mut state);

        state.slots[0].state = TaskState::Dead;
        state.slots[a_idx].state = TaskState::Dead;
        state.slots[b_idx].state = TaskState::Dead;

        assert_eq!(state.advance(), None);
    }

    #[test]
    fn lone_ready_current_keeps_running() {
        let mut state = bootstrapped();
        assert_eq!(state.advance(), Some(0));

        let a_idx = spawn_logical(&mut state);
        state.slots[a_idx].state = TaskState::Dead;
        // The dead spawn gets cleaned up and the bootstrap task remains.
        assert_eq!(state.advance(), Some(0));
        assert!(!state.slots[a_idx].used);
    }

    #[test]
    fn arena_capacity_is_bounded() {
        let mut state = bootstrapped();
        for _ in 0..MAX_TASKS - 1 {
            spawn_logical(&mut state);
        }
        assert_eq!(state.alloc_slot(), None);
    }

    #[test]
    fn tail_unlink_keeps_later_spawns_ordered() {
        let mut state = bootstrapped();
        spawn_logical(&mut state); // 1
        let b_idx = spawn_logical(&mut state); // 2, tail
        state.slots[b_idx].state = TaskState::Dead;

        // Walk past B so it is unlinked while it holds the tail position.
        let mut visits = Vec::new();
        for _ in 0..2 {
            visits.push(step(&mut state).unwrap());
        }
        assert_eq!(visits, vec![1, 0]);

        // A spawn after the tail died must still land at the ring end.
        spawn_logical(&mut state); // 3
        let mut lap = Vec::new();
        for _ in 0..3 {
            lap.push(step(&mut state).unwrap());
        }
        assert_eq!(lap, vec![1, 3, 0]);
    }
}
