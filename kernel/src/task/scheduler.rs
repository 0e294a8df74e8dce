// =============================================================================
// MinimalOS NextGen — Preemptive Round-Robin Task Scheduler
// =============================================================================
//
// Task storage is an arena: a `Vec<Task>` guarded by the scheduler's own
// SpinLock, addressed by dense `TaskId` handles (the id is simply the
// task's index in the arena) rather than an intrusive next-pointer list.
// The ready queue, the sleeping queue (kept sorted by ascending
// `wake_up_time`), and the blocked queue each hold `TaskId`s.
//
// LIFECYCLE: Ready -> Active -> (Ready | Sleeping | Blocked | Zombie).
// A Zombie is never rescheduled. Its kernel stack is not freed inline by
// `task_exit` — the task is still running on that stack at the moment it
// marks itself Zombie — it is freed by the reaper step at the top of the
// next `schedule()` call, after control has already moved to another
// task's stack.
//
// CONTEXT SWITCH: `task_switch_asm` is the only routine that crosses
// stacks. It saves every general-purpose register and RFLAGS onto the
// outgoing stack, records the resulting stack pointer, loads the
// incoming stack pointer, and restores the mirror image. Because it
// restores RDI along with everything else, a freshly created task's
// very first "return" lands directly in its entry function with the
// task's argument already sitting in RDI — no separate trampoline for
// entry is needed. A second return address beneath the entry point's in
// the initial frame catches the case where `entry` returns normally,
// routing into `task_exit_trampoline` instead of off the end of the
// stack.
//
// No lock is ever held across `task_switch_asm`.
// =============================================================================

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::arch::global_asm;

use crate::arch::cpu;
use crate::kprintln;
use crate::sync::spinlock::SpinLock;
use crate::task::clock;

/// Kernel stack allocated per task.
const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Ticks (assumed ~1ms each, set by the timer's calibration at boot)
/// granted to a task per scheduling round.
const DEFAULT_TIME_SLICE: u32 = 10;

/// Dense handle into the task arena. Equal to the task's index in
/// `Scheduler::tasks`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskId(usize);

impl TaskId {
    const INVALID: TaskId = TaskId(usize::MAX);

    fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TaskState {
    Invalid,
    Active,
    Ready,
    Blocked,
    Sleeping,
    Zombie,
}

struct Task {
    id: TaskId,
    name: [u8; 32],
    name_len: u8,
    kernel_stack: Option<Box<[u8]>>,
    rsp: u64,
    state: TaskState,
    priority: u8,
    time_slice: u32,
    ticks_remaining: u32,
    wake_up_time: u64,
}

impl Task {
    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("?")
    }
}

fn copy_name(name: &str) -> ([u8; 32], u8) {
    let mut buf = [0u8; 32];
    let bytes = name.as_bytes();
    let len = bytes.len().min(31);
    buf[..len].copy_from_slice(&bytes[..len]);
    (buf, len as u8)
}

struct Scheduler {
    tasks: Vec<Task>,
    current: TaskId,
    ready_queue: VecDeque<TaskId>,
    sleeping_queue: Vec<TaskId>,
    blocked_queue: Vec<TaskId>,
    zombies_pending_reap: Vec<TaskId>,
}

// SAFETY: all access goes through `SCHEDULER`'s SpinLock.
unsafe impl Send for Scheduler {}

impl Scheduler {
    const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current: TaskId::INVALID,
            ready_queue: VecDeque::new(),
            sleeping_queue: Vec::new(),
            blocked_queue: Vec::new(),
            zombies_pending_reap: Vec::new(),
        }
    }

    fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.index()]
    }

    fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.index()]
    }

    /// Frees the kernel stack of any task marked Zombie since the last
    /// reap pass. Run at the top of every `schedule()`.
    fn reap(&mut self) {
        for id in core::mem::take(&mut self.zombies_pending_reap) {
            let task = self.task_mut(id);
            task.kernel_stack = None;
        }
    }

    /// Moves sleeping tasks whose wake time has arrived onto the tail of
    /// the ready queue. `sleeping_queue` is sorted by ascending
    /// `wake_up_time`, so the walk stops at the first task not yet due.
    fn wake_sleepers(&mut self, now_ms: u64) {
        let mut split_at = 0;
        while split_at < self.sleeping_queue.len() {
            let id = self.sleeping_queue[split_at];
            if self.task(id).wake_up_time > now_ms {
                break;
            }
            split_at += 1;
        }
        for id in self.sleeping_queue.drain(..split_at) {
            self.task_mut(id).state = TaskState::Ready;
            self.ready_queue.push_back(id);
        }
    }
}

static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

/// Installs the bootstrap task representing the code currently running
/// (the boot thread that called this function), as task id 0, state
/// Active. Must be called once, after the heap is initialized.
pub fn init_multitasking() {
    let mut sched = SCHEDULER.lock();
    let (name, name_len) = copy_name("kernel");
    sched.tasks.push(Task {
        id: TaskId(0),
        name,
        name_len,
        kernel_stack: None,
        rsp: 0,
        state: TaskState::Active,
        priority: 0,
        time_slice: DEFAULT_TIME_SLICE,
        ticks_remaining: DEFAULT_TIME_SLICE,
        wake_up_time: 0,
    });
    sched.current = TaskId(0);
    kprintln!("[sched] bootstrap task installed as task 0");
}

/// Creates a new Ready task. `entry` runs with `arg` in RDI on first
/// dispatch; if it returns, the task exits automatically.
pub fn task_create(entry: extern "C" fn(usize) -> !, arg: usize, name: &str, priority: u8) -> TaskId {
    let mut stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = stack.as_mut_ptr() as u64 + KERNEL_STACK_SIZE as u64;
    let rsp = unsafe { prepare_initial_stack(stack_top, entry, arg) };

    let (name_buf, name_len) = copy_name(name);

    let mut sched = SCHEDULER.lock();
    let id = TaskId(sched.tasks.len());
    sched.tasks.push(Task {
        id,
        name: name_buf,
        name_len,
        kernel_stack: Some(stack),
        rsp,
        state: TaskState::Ready,
        priority,
        time_slice: DEFAULT_TIME_SLICE,
        ticks_remaining: DEFAULT_TIME_SLICE,
        wake_up_time: 0,
    });
    sched.ready_queue.push_back(id);
    kprintln!("[sched] task {} '{}' created", id.0, sched.task(id).name_str());
    id
}

/// Number of (GPR + RFLAGS + entry + fallback-exit) 8-byte slots written
/// by `prepare_initial_stack`; must match `task_switch_asm`'s pop count.
const INITIAL_FRAME_WORDS: usize = 18;

/// Writes an initial stack frame so that the first `task_switch_asm`
/// restore lands directly in `entry(arg)` with RFLAGS = 0x202 (interrupts
/// enabled), and so that `entry` returning normally falls into
/// `task_exit_trampoline` rather than off the end of the stack.
unsafe fn prepare_initial_stack(stack_top: u64, entry: extern "C" fn(usize) -> !, arg: usize) -> u64 {
    let frame_size = (INITIAL_FRAME_WORDS * 8) as u64;
    let sp = stack_top - frame_size;
    let words = sp as *mut u64;

    unsafe {
        // Popped in this order by task_switch_asm: r15 r14 r13 r12 r11 r10
        // r9 r8 rbp rdi rsi rdx rcx rbx rax, then rflags, then `ret`
        // targets entry, then (if entry itself returns) the exit
        // trampoline.
        words.add(0).write(0); // r15
        words.add(1).write(0); // r14
        words.add(2).write(0); // r13
        words.add(3).write(0); // r12
        words.add(4).write(0); // r11
        words.add(5).write(0); // r10
        words.add(6).write(0); // r9
        words.add(7).write(0); // r8
        words.add(8).write(0); // rbp
        words.add(9).write(arg as u64); // rdi — first argument in the C ABI
        words.add(10).write(0); // rsi
        words.add(11).write(0); // rdx
        words.add(12).write(0); // rcx
        words.add(13).write(0); // rbx
        words.add(14).write(0); // rax
        words.add(15).write(0x202); // rflags: IF set
        words.add(16).write(entry as usize as u64);
        words.add(17).write(task_exit_trampoline as usize as u64);
    }

    sp
}

extern "C" fn task_exit_trampoline() -> ! {
    task_exit();
}

unsafe extern "C" {
    /// Saves the outgoing task's register state, writes the resulting
    /// stack pointer to `*old_sp_slot`, switches to `new_sp`, and
    /// restores the incoming task's register state.
    fn task_switch_asm(old_sp_slot: *mut u64, new_sp: u64);
}

global_asm!(
    ".global task_switch_asm",
    "task_switch_asm:",
    "pushfq",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "popfq",
    "ret",
);

fn now_ms() -> u64 {
    clock::now()
}

/// Called from the timer IRQ handler after EOI. Decrements the current
/// task's remaining quantum; calls `schedule()` once it hits zero.
///
/// A no-op until `init_multitasking` has installed the bootstrap task —
/// the local APIC timer is armed before multitasking is, so a tick landing
/// in that window must not index an empty task arena.
pub fn task_timer_tick() {
    clock::tick();
    let should_schedule = {
        let mut sched = SCHEDULER.lock();
        if sched.tasks.is_empty() || sched.current == TaskId::INVALID {
            return;
        }
        let current = sched.current;
        let task = sched.task_mut(current);
        if task.ticks_remaining > 0 {
            task.ticks_remaining -= 1;
        }
        task.ticks_remaining == 0
    };
    if should_schedule {
        schedule();
    }
}

/// Runs one scheduling decision. Always safe to call from task context;
/// never called directly from an interrupt handler's body (the timer
/// handler calls it only after returning IRQ bookkeeping to a normal
/// call, per the single-CPU cooperative-within-a-task model).
pub fn schedule() {
    let now = now_ms();

    let switch: Option<(*mut u64, u64)> = {
        let mut sched = SCHEDULER.lock();
        sched.reap();
        sched.wake_sleepers(now);

        if sched.ready_queue.is_empty() {
            let current = sched.current;
            let task = sched.task_mut(current);
            task.ticks_remaining = task.time_slice;
            return;
        }

        let next = sched.ready_queue.pop_front().unwrap();
        let current = sched.current;

        if sched.task(current).state == TaskState::Active {
            sched.task_mut(current).state = TaskState::Ready;
            sched.ready_queue.push_back(current);
        }

        sched.task_mut(next).state = TaskState::Active;
        let slice = sched.task(next).time_slice;
        sched.task_mut(next).ticks_remaining = slice;

        if next == current {
            None
        } else {
            sched.current = next;
            let old_rsp_ptr = &mut sched.tasks[current.index()].rsp as *mut u64;
            let new_rsp = sched.task(next).rsp;
            Some((old_rsp_ptr, new_rsp))
        }
    };

    if let Some((old_sp_slot, new_sp)) = switch {
        unsafe {
            task_switch_asm(old_sp_slot, new_sp);
        }
    }
}

/// Suspends the current task for at least `ms` milliseconds.
pub fn task_sleep(ms: u64) {
    if ms == 0 {
        return;
    }
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        let wake_up_time = now_ms() + ms;
        {
            let task = sched.task_mut(current);
            task.wake_up_time = wake_up_time;
            task.state = TaskState::Sleeping;
        }
        let pos = sched
            .sleeping_queue
            .iter()
            .position(|&id| sched.task(id).wake_up_time > wake_up_time)
            .unwrap_or(sched.sleeping_queue.len());
        sched.sleeping_queue.insert(pos, current);
    }
    schedule();
}

/// Blocks the current task until a later `task_unblock`.
pub fn task_block() {
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        sched.task_mut(current).state = TaskState::Blocked;
        sched.blocked_queue.push(current);
    }
    schedule();
}

/// Moves a blocked task back onto the ready queue.
pub fn task_unblock(id: TaskId) {
    let mut sched = SCHEDULER.lock();
    if let Some(pos) = sched.blocked_queue.iter().position(|&t| t == id) {
        sched.blocked_queue.remove(pos);
        sched.task_mut(id).state = TaskState::Ready;
        sched.ready_queue.push_back(id);
    }
}

/// Terminates the current task. Marks it Zombie (its stack is freed by
/// the reaper on a later `schedule()` pass, never synchronously here —
/// the caller is still running on that stack) and never returns.
pub fn task_exit() -> ! {
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        sched.task_mut(current).state = TaskState::Zombie;
        sched.zombies_pending_reap.push(current);
    }
    schedule();
    // `schedule()` never returns into a Zombie task — this is a safety
    // net in case every other task has also exited.
    cpu::halt_forever();
}

/// Returns the currently running task's id.
pub fn task_get_current() -> TaskId {
    SCHEDULER.lock().current
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests exercise the queue/state bookkeeping directly against
    // a private `Scheduler` instance rather than the global `SCHEDULER`,
    // since the real thing requires an actual context switch primitive
    // and a running CPU to do anything beyond bookkeeping.

    fn bootstrap() -> Scheduler {
        let mut sched = Scheduler::new();
        let (name, name_len) = copy_name("kernel");
        sched.tasks.push(Task {
            id: TaskId(0),
            name,
            name_len,
            kernel_stack: None,
            rsp: 0,
            state: TaskState::Active,
            priority: 0,
            time_slice: DEFAULT_TIME_SLICE,
            ticks_remaining: DEFAULT_TIME_SLICE,
            wake_up_time: 0,
        });
        sched.current = TaskId(0);
        sched
    }

    fn push_ready(sched: &mut Scheduler, name: &str) -> TaskId {
        let (name_buf, name_len) = copy_name(name);
        let id = TaskId(sched.tasks.len());
        sched.tasks.push(Task {
            id,
            name: name_buf,
            name_len,
            kernel_stack: None,
            rsp: 0,
            state: TaskState::Ready,
            priority: 0,
            time_slice: DEFAULT_TIME_SLICE,
            ticks_remaining: DEFAULT_TIME_SLICE,
            wake_up_time: 0,
        });
        sched.ready_queue.push_back(id);
        id
    }

    #[test]
    fn ready_queue_is_fifo() {
        let mut sched = bootstrap();
        let a = push_ready(&mut sched, "a");
        let b = push_ready(&mut sched, "b");
        assert_eq!(sched.ready_queue.pop_front(), Some(a));
        assert_eq!(sched.ready_queue.pop_front(), Some(b));
    }

    #[test]
    fn sleeping_queue_stays_sorted_by_wake_time() {
        let mut sched = bootstrap();
        let a = push_ready(&mut sched, "a");
        let b = push_ready(&mut sched, "b");
        sched.task_mut(a).wake_up_time = 500;
        sched.task_mut(b).wake_up_time = 100;
        sched.sleeping_queue.clear();

        for (id, wake) in [(a, 500u64), (b, 100u64)] {
            let pos = sched
                .sleeping_queue
                .iter()
                .position(|&t| sched.task(t).wake_up_time > wake)
                .unwrap_or(sched.sleeping_queue.len());
            sched.sleeping_queue.insert(pos, id);
        }

        assert_eq!(sched.sleeping_queue, alloc::vec![b, a]);
    }

    #[test]
    fn wake_sleepers_moves_due_tasks_to_ready() {
        let mut sched = bootstrap();
        let a = push_ready(&mut sched, "a");
        sched.ready_queue.clear();
        sched.task_mut(a).state = TaskState::Sleeping;
        sched.task_mut(a).wake_up_time = 1000;
        sched.sleeping_queue.push(a);

        sched.wake_sleepers(999);
        assert!(sched.ready_queue.is_empty());

        sched.wake_sleepers(1000);
        assert_eq!(sched.ready_queue.pop_front(), Some(a));
        assert_eq!(sched.task(a).state, TaskState::Ready);
    }

    #[test]
    fn reaper_frees_zombie_stack() {
        let mut sched = bootstrap();
        let a = push_ready(&mut sched, "a");
        sched.task_mut(a).kernel_stack = Some(alloc::vec![0u8; 16].into_boxed_slice());
        sched.zombies_pending_reap.push(a);

        sched.reap();
        assert!(sched.task(a).kernel_stack.is_none());
        assert!(sched.zombies_pending_reap.is_empty());
    }

    #[test]
    fn block_then_unblock_round_trips() {
        let mut sched = bootstrap();
        let a = push_ready(&mut sched, "a");
        sched.ready_queue.clear();
        sched.task_mut(a).state = TaskState::Blocked;
        sched.blocked_queue.push(a);

        let pos = sched.blocked_queue.iter().position(|&t| t == a).unwrap();
        sched.blocked_queue.remove(pos);
        sched.task_mut(a).state = TaskState::Ready;
        sched.ready_queue.push_back(a);

        assert!(sched.blocked_queue.is_empty());
        assert_eq!(sched.ready_queue.pop_front(), Some(a));
    }
}
