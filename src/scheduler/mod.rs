//! Thread scheduler: priority scheduling with donation, an optional 4.4BSD
//! MLFQ mode, and the central thread table every other subsystem (locks,
//! the frame table, the page-fault handler, process lifecycle) looks
//! threads up in by stable [`ThreadId`] rather than by raw pointer.

pub mod task;
pub mod context;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::sync::LockId;
use context::Context;
pub use task::{ThreadId, ThreadState, DONATION_DEPTH, FD_BASE, FD_LIMIT, PRI_DEFAULT, PRI_MAX, PRI_MIN};
use task::Thread;

/// Kernel stack handed to every thread this scheduler creates directly
/// (process threads get a stack of the same size from `process::spawn_user_thread`).
const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Ticks a thread may run before it is forced to yield to a same-or-higher
/// priority peer, matching the reference kernel's `TIME_SLICE`.
const TIME_SLICE: u32 = 4;

/// Timer ticks per second, used by the MLFQ `load_avg`/`recent_cpu` decay.
const TIMER_FREQ: u64 = 100;

type ThreadTable = BTreeMap<ThreadId, Box<Thread>>;

lazy_static! {
    static ref THREADS: Mutex<ThreadTable> = Mutex::new(BTreeMap::new());
    static ref READY_QUEUE: Mutex<VecDeque<ThreadId>> = Mutex::new(VecDeque::new());
    static ref SLEEPERS: Mutex<Vec<ThreadId>> = Mutex::new(Vec::new());
    /// Which thread currently holds each lock, maintained by
    /// `note_lock_held`/`forget_lock_held` so a donation chain can be walked
    /// without `sync::Lock` exposing its internals to the scheduler.
    static ref LOCK_OWNERS: Mutex<BTreeMap<LockId, ThreadId>> = Mutex::new(BTreeMap::new());
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static CURRENT: AtomicU64 = AtomicU64::new(0);
static TICKS: AtomicU64 = AtomicU64::new(0);
static LOAD_AVG: AtomicI64 = AtomicI64::new(0);

mod fixed {
    //! 17.14 fixed-point arithmetic for the MLFQ formulas.
    pub const F: i64 = 1 << 14;
    pub fn from_int(n: i64) -> i64 {
        n * F
    }
    pub fn mul(a: i64, b: i64) -> i64 {
        (a * b) / F
    }
    pub fn div(a: i64, b: i64) -> i64 {
        (a * F) / b
    }
    pub fn round(a: i64) -> i64 {
        if a >= 0 {
            (a + F / 2) / F
        } else {
            (a - F / 2) / F
        }
    }
}

/// Bring up the scheduler: register the currently executing boot flow as
/// thread 0 and create the idle thread. Must run once, with interrupts
/// still disabled.
pub fn init() {
    let boot = Box::new(Thread::new(
        ThreadId(0),
        String::from("main"),
        PRI_DEFAULT,
        Context::empty(),
        Vec::new().into_boxed_slice(),
    ));
    THREADS.lock().insert(ThreadId(0), boot);
    CURRENT.store(0, Ordering::SeqCst);

    create_idle_thread();

    let mlfqs = crate::config::CONFIG.lock().mlfqs;
    crate::log_info!(
        "scheduler initialized ({})",
        if mlfqs { "mlfqs" } else { "priority donation" }
    );
}

extern "C" fn idle_loop(_arg: usize) {
    loop {
        x86_64::instructions::interrupts::enable();
        x86_64::instructions::hlt();
        yield_now();
    }
}

fn create_idle_thread() {
    create("idle", PRI_MIN, idle_loop, 0);
}

/// Allocate a fresh, never-reused thread identifier.
pub fn alloc_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Register a fully constructed thread (used by `process::fork`/`exec`,
/// which build the `Thread` themselves to install a pml4 and fd table
/// before it ever runs) and make it ready.
pub fn spawn_thread(thread: Box<Thread>) -> ThreadId {
    let tid = thread.tid;
    THREADS.lock().insert(tid, thread);
    READY_QUEUE.lock().push_back(tid);
    tid
}

/// Create and schedule a plain kernel thread. `entry` receives `arg`; its
/// return value (if it returns at all) is treated as an implicit `exit(0)`.
pub fn create(name: &str, priority: u8, entry: extern "C" fn(usize), arg: usize) -> ThreadId {
    let tid = alloc_tid();
    let stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = (stack.as_ptr() as u64 + stack.len() as u64) & !0xF;
    let ctx = make_kernel_context(entry, arg, stack_top);

    let thread = Box::new(Thread::new(tid, String::from(name), priority, ctx, stack));
    spawn_thread(thread)
}

/// Allocate a kernel stack of the default size, sized the same way `create`
/// sizes one, for a caller (`process::fork`) that needs to build its own
/// [`Thread`] by hand instead of going through `create`.
pub fn alloc_kernel_stack() -> alloc::boxed::Box<[u8]> {
    alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice()
}

/// Build a [`Context`] that, when first switched to, runs `entry(arg)` on
/// `stack_top` via the same trampoline every plain kernel thread uses. Used
/// directly by `create` and by `process::fork`, which needs to install its
/// own process-lifecycle fields on the `Thread` before `spawn_thread` makes
/// it schedulable.
pub fn make_kernel_context(entry: extern "C" fn(usize), arg: usize, stack_top: u64) -> Context {
    let mut ctx = Context::new(kernel_thread_trampoline as *const () as u64, stack_top);
    ctx.r12 = entry as u64;
    ctx.r13 = arg as u64;
    ctx
}

#[unsafe(naked)]
extern "C" fn kernel_thread_trampoline() {
    core::arch::naked_asm!(
        "mov rdi, r13",
        "call r12",
        "jmp {exit}",
        exit = sym kernel_thread_exit,
    );
}

extern "C" fn kernel_thread_exit() -> ! {
    exit_current(0);
}

pub fn current_tid() -> ThreadId {
    ThreadId(CURRENT.load(Ordering::SeqCst))
}

/// Run `f` against the currently running thread's mutable state.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    with_thread(current_tid(), f).expect("with_current: current thread missing from table")
}

/// Run `f` against `tid`'s mutable state, if it still exists. This is the
/// seam every cross-thread lookup (lock donation, frame eviction, page
/// fault handling) goes through instead of holding a raw `&mut Thread`.
pub fn with_thread<R>(tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    THREADS.lock().get_mut(&tid).map(|t| f(&mut *t))
}

pub fn effective_priority_of(tid: ThreadId) -> u8 {
    with_thread(tid, |t| t.effective_priority).unwrap_or(0)
}

pub fn set_base_priority(tid: ThreadId, priority: u8) {
    let mut threads = THREADS.lock();
    if let Some(t) = threads.get_mut(&tid) {
        t.base_priority = priority;
        t.init_priority = priority;
    }
    recompute_effective_priority(&mut threads, tid);
}

fn recompute_effective_priority(threads: &mut ThreadTable, tid: ThreadId) {
    let donor_max = match threads.get(&tid) {
        Some(t) => t
            .donors
            .iter()
            .filter_map(|d| threads.get(d).map(|dt| dt.effective_priority))
            .max()
            .unwrap_or(0),
        None => return,
    };
    if let Some(t) = threads.get_mut(&tid) {
        t.effective_priority = core::cmp::max(t.init_priority, donor_max);
    }
}

/// Pick the highest-priority ready thread, breaking ties FIFO. `None` only
/// if the ready queue is empty (never happens once the idle thread exists).
fn pick_next() -> Option<ThreadId> {
    let mut queue = READY_QUEUE.lock();
    if queue.is_empty() {
        return None;
    }
    let threads = THREADS.lock();
    let mut best_idx = 0;
    let mut best_pri = threads.get(&queue[0]).map(|t| t.effective_priority).unwrap_or(0);
    for (i, tid) in queue.iter().enumerate().skip(1) {
        let pri = threads.get(tid).map(|t| t.effective_priority).unwrap_or(0);
        if pri > best_pri {
            best_pri = pri;
            best_idx = i;
        }
    }
    drop(threads);
    queue.remove(best_idx)
}

/// Switch execution from the current thread to `next`, saving the current
/// thread's register context first. Loads `next`'s page table (if it has
/// one) and TSS.RSP0 before the asm handoff.
fn context_switch(next: ThreadId) {
    let prev = ThreadId(CURRENT.load(Ordering::SeqCst));
    if prev == next {
        return;
    }

    {
        let threads = THREADS.lock();
        if let Some(t) = threads.get(&next) {
            if !t.kernel_stack.is_empty() {
                let top = (t.kernel_stack.as_ptr() as u64 + t.kernel_stack.len() as u64) & !0xF;
                crate::interrupts::gdt::set_tss_rsp0(top);
            }
            if let Some(pml4) = &t.pml4 {
                crate::memory::paging::pml4_activate(Some(pml4));
            }
        }
    }

    CURRENT.store(next.0, Ordering::SeqCst);

    let mut threads = THREADS.lock();
    let prev_ptr: *mut Context = threads.get_mut(&prev).map(|t| &mut t.context as *mut Context).unwrap_or(core::ptr::null_mut());
    let next_ptr: *const Context = threads
        .get(&next)
        .map(|t| &t.context as *const Context)
        .expect("context_switch: target thread missing");
    drop(threads);

    if prev_ptr.is_null() {
        unsafe { context::restore_context(next_ptr) };
    } else {
        unsafe { context::switch_context(prev_ptr, next_ptr) };
    }
}

/// Cooperatively give up the CPU. The calling thread is requeued as ready
/// (unless it went on to block itself some other way first).
pub fn yield_now() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let current = current_tid();
        requeue_current_if_running(current);
        if let Some(next) = pick_next() {
            context_switch(next);
        }
    });
}

fn requeue_current_if_running(tid: ThreadId) {
    let mut threads = THREADS.lock();
    if let Some(t) = threads.get_mut(&tid) {
        if t.status == ThreadState::Running || t.status == ThreadState::Ready {
            t.status = ThreadState::Ready;
            drop(threads);
            READY_QUEUE.lock().push_back(tid);
        }
    }
}

/// Block the current thread (mark it `Blocked`, remove it from scheduling)
/// and switch to the next ready thread. The caller is responsible for
/// having already recorded *why* it is blocked (a semaphore waiter list, a
/// sleep wake tick, ...); `unblock` is what makes it ready again.
pub fn block_current() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let current = current_tid();
        {
            let mut threads = THREADS.lock();
            if let Some(t) = threads.get_mut(&current) {
                t.status = ThreadState::Blocked;
            }
        }
        match pick_next() {
            Some(next) => context_switch(next),
            None => panic!("block_current: no ready thread to run"),
        }
    });
}

/// Make a blocked thread ready again.
pub fn unblock(tid: ThreadId) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut threads = THREADS.lock();
        if let Some(t) = threads.get_mut(&tid) {
            if t.status == ThreadState::Blocked {
                t.status = ThreadState::Ready;
                drop(threads);
                READY_QUEUE.lock().push_back(tid);
            }
        }
    });
}

/// Block the current thread until `tick() >= wake_tick`.
pub fn sleep(wake_tick: u64) {
    let current = current_tid();
    if let Some(t) = THREADS.lock().get_mut(&current) {
        t.wake_tick = wake_tick;
    }
    SLEEPERS.lock().push(current);
    block_current();
}

fn wake_sleepers(now: u64) {
    let mut sleepers = SLEEPERS.lock();
    let mut to_wake = Vec::new();
    sleepers.retain(|&tid| {
        let due = THREADS.lock().get(&tid).map(|t| t.wake_tick <= now).unwrap_or(true);
        if due {
            to_wake.push(tid);
            false
        } else {
            true
        }
    });
    drop(sleepers);
    for tid in to_wake {
        unblock(tid);
    }
}

/// Drop the table entry of any thread that finished running. Safe to call
/// from any other thread's context since a `Dying` thread is, by
/// definition, never the one currently executing.
fn reap_dying() {
    let current = current_tid();
    let finished: Vec<ThreadId> = {
        let threads = THREADS.lock();
        threads
            .iter()
            .filter(|(tid, t)| **tid != current && t.status == ThreadState::Dying)
            .map(|(tid, _)| *tid)
            .collect()
    };
    for tid in finished {
        THREADS.lock().remove(&tid);
    }
}

/// Timer-interrupt tick: advance the clock, wake due sleepers, run the
/// MLFQ recalculation (if enabled), and enforce the scheduling time slice.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    wake_sleepers(now);
    reap_dying();

    if crate::config::CONFIG.lock().mlfqs {
        mlfq_tick(now);
    }

    let mut need_yield = false;
    {
        let current = current_tid();
        let mut threads = THREADS.lock();
        if let Some(t) = threads.get_mut(&current) {
            t.ticks_this_slice += 1;
            if t.ticks_this_slice >= TIME_SLICE {
                t.ticks_this_slice = 0;
                need_yield = true;
            }
        }
    }
    if need_yield {
        yield_now();
    }
}

fn mlfq_tick(now: u64) {
    {
        let current = current_tid();
        let mut threads = THREADS.lock();
        if let Some(t) = threads.get_mut(&current) {
            if t.name != "idle" {
                t.recent_cpu = (t.recent_cpu as i64 + fixed::from_int(1)) as i32;
            }
        }
    }

    if now % TIMER_FREQ == 0 {
        let ready_len = READY_QUEUE.lock().len() as i64;
        let running_is_idle = with_current(|t| t.name == "idle");
        let ready_threads = ready_len + if running_is_idle { 0 } else { 1 };

        let old_load_avg = LOAD_AVG.load(Ordering::SeqCst);
        let c59 = fixed::div(fixed::from_int(59), fixed::from_int(60));
        let c1 = fixed::div(fixed::from_int(1), fixed::from_int(60));
        let new_load_avg = fixed::mul(c59, old_load_avg) + fixed::mul(c1, fixed::from_int(ready_threads));
        LOAD_AVG.store(new_load_avg, Ordering::SeqCst);

        let two_load = 2 * new_load_avg;
        let coeff = fixed::div(two_load, two_load + fixed::from_int(1));
        let mut threads = THREADS.lock();
        for t in threads.values_mut() {
            if t.name == "idle" {
                continue;
            }
            t.recent_cpu = (fixed::mul(coeff, t.recent_cpu as i64) + fixed::from_int(t.nice as i64)) as i32;
        }
    }

    if now % 4 == 0 {
        let mut threads = THREADS.lock();
        for t in threads.values_mut() {
            if t.name == "idle" {
                continue;
            }
            let recent_cpu_int = fixed::round(t.recent_cpu as i64);
            let pri = PRI_MAX as i64 - recent_cpu_int / 4 - (t.nice as i64) * 2;
            let clamped = pri.clamp(PRI_MIN as i64, PRI_MAX as i64) as u8;
            t.base_priority = clamped;
            t.init_priority = clamped;
            t.effective_priority = clamped;
        }
    }
}

/// Permanently stop the current thread with `status` and switch away. Does
/// not touch process-level state (fds, address space, parent/child
/// bookkeeping) — `process::exit` does that before calling this.
pub fn exit_current(status: i32) -> ! {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let current = current_tid();
        {
            let mut threads = THREADS.lock();
            if let Some(t) = threads.get_mut(&current) {
                t.status = ThreadState::Dying;
                t.exit_status = status;
            }
        }
        READY_QUEUE.lock().retain(|&t| t != current);
        match pick_next() {
            Some(next) => context_switch(next),
            None => panic!("exit_current: no thread left to run"),
        }
    });
    unreachable!("exit_current should never return");
}

// ---- priority donation, called from sync::Lock ----

/// `me` is about to block waiting on `lock_id`, currently held by `owner`.
/// `me` becomes a direct donor of `owner` only — each link further up the
/// chain already has its own direct waiter recorded as a donor, from when
/// that link itself blocked — so the walk beyond `owner` just recomputes
/// each ancestor's effective priority (recursively, via its own donors'
/// effective priorities) rather than adding `me` again at every hop.
/// Bounded to [`DONATION_DEPTH`] hops.
pub fn begin_donation(me: ThreadId, lock_id: LockId, owner: ThreadId) {
    {
        let mut threads = THREADS.lock();
        if let Some(t) = threads.get_mut(&me) {
            t.waiting_lock = Some(lock_id);
        }
    }

    {
        let mut threads = THREADS.lock();
        if let Some(t) = threads.get_mut(&owner) {
            if !t.donors.contains(&me) {
                t.donors.push(me);
            }
        }
        recompute_effective_priority(&mut threads, owner);
    }

    let mut cur = owner;
    for _ in 0..DONATION_DEPTH {
        let next_lock = THREADS.lock().get(&cur).and_then(|t| t.waiting_lock);
        let next_owner = match next_lock {
            Some(lid) => LOCK_OWNERS.lock().get(&lid).copied(),
            None => None,
        };
        match next_owner {
            Some(next) if next != cur => {
                let mut threads = THREADS.lock();
                recompute_effective_priority(&mut threads, next);
                cur = next;
            }
            _ => break,
        }
    }
}

/// `me` has acquired the lock it was waiting on (or gave up waiting).
pub fn end_donation_wait(me: ThreadId) {
    if let Some(t) = THREADS.lock().get_mut(&me) {
        t.waiting_lock = None;
    }
}

/// `me` now owns `lock_id`; record it so future donation chains through
/// this lock can find their way to `me`.
pub fn note_lock_held(me: ThreadId, lock_id: LockId) {
    LOCK_OWNERS.lock().insert(lock_id, me);
    if let Some(t) = THREADS.lock().get_mut(&me) {
        if !t.locks_held.contains(&lock_id) {
            t.locks_held.push(lock_id);
        }
    }
}

/// `me` is releasing `lock_id`; strip donations that were made on account
/// of this lock specifically (a thread holding several locks keeps the
/// donations tied to the ones it still holds).
pub fn revoke_donations_for_lock(me: ThreadId, lock_id: LockId) {
    LOCK_OWNERS.lock().remove(&lock_id);

    let mut threads = THREADS.lock();
    let stale: Vec<ThreadId> = match threads.get(&me) {
        Some(t) => t
            .donors
            .iter()
            .copied()
            .filter(|d| threads.get(d).map(|dt| dt.waiting_lock == Some(lock_id)).unwrap_or(false))
            .collect(),
        None => Vec::new(),
    };
    if let Some(t) = threads.get_mut(&me) {
        t.donors.retain(|d| !stale.contains(d));
    }
    recompute_effective_priority(&mut threads, me);
}

pub fn forget_lock_held(me: ThreadId, lock_id: LockId) {
    if let Some(t) = THREADS.lock().get_mut(&me) {
        t.locks_held.retain(|&l| l != lock_id);
    }
}
