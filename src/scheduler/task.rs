use alloc::string::String;
use alloc::vec::Vec;
use alloc::sync::Arc;
use spin::Mutex;
use super::context::Context;
use crate::sync::LockId;
use crate::vm::spt::SupplementalPageTable;
use crate::fs::file::FileHandle;

/// Thread/process identifier. The reference kernel calls this a `tid_t`;
/// at the process layer the same value is used as a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;

pub const FD_BASE: usize = 2;
pub const FD_LIMIT: usize = 128;

/// Donation-chain walk depth guard — matches the reference kernel's bound.
pub const DONATION_DEPTH: usize = 8;

/// Stack-overflow sentinel, written at a fixed offset into the kernel stack
/// page at thread creation and checked on context switch. The reference
/// kernel calls this the thread's `magic` number.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// A thread is the unit of scheduling; when used to host a user program it
/// also carries the process-lifecycle fields below (pml4, fd table, exit
/// status, handshake semaphores) — the reference kernel merges both into a
/// single `struct thread` and this crate keeps that shape rather than
/// splitting into two structs linked by a pointer.
pub struct Thread {
    pub tid: ThreadId,
    pub name: String,
    pub status: ThreadState,

    pub base_priority: u8,
    pub effective_priority: u8,

    /// Global tick at/after which a sleeping thread must be woken; unused otherwise.
    pub wake_tick: u64,
    /// Lock this thread is blocked on, for donation-chain walks.
    pub waiting_lock: Option<LockId>,
    /// Threads currently donating priority to this one.
    pub donors: Vec<ThreadId>,
    /// Priority as set by the user, independent of any donation boost.
    pub init_priority: u8,

    // MLFQ-only fields (ignored unless scheduler is in MLFQ mode).
    pub nice: i32,
    pub recent_cpu: i32,

    /// Ticks charged to this thread since it last ran, for TIME_SLICE preemption.
    pub ticks_this_slice: u32,

    pub context: Context,
    pub kernel_stack: alloc::boxed::Box<[u8]>,
    /// Sentinel written at kernel-stack-base + 0 at creation; checked on every
    /// switch into this thread to detect a blown kernel stack.
    pub magic: u32,

    /// Locks currently held by this thread (its donors come from these).
    pub locks_held: Vec<LockId>,

    // ---- process-lifecycle fields ----
    pub parent: Option<ThreadId>,
    pub children: Vec<ThreadId>,
    pub exit_status: i32,
    pub pml4: Option<crate::memory::paging::Pml4>,
    pub spt: SupplementalPageTable,
    /// Top of the user stack the last time it was observed; stack-growth heuristic anchor.
    pub user_stack_pointer: u64,
    /// Saved user register frame, snapshotted on syscall entry; `fork` copies
    /// this verbatim into the child so it resumes at the same instruction.
    pub user_regs: Option<crate::interrupts::usermode::TrapFrame>,

    pub fd_table: Vec<Option<Arc<Mutex<FileHandle>>>>,
    pub exec_file: Option<Arc<Mutex<FileHandle>>>,

    /// Raised by the child once fork/exec has finished initializing.
    pub sema_load: Arc<crate::sync::Semaphore>,
    /// Raised by the child once exit() cleanup has completed (parent may read exit_status).
    pub sema_wait: Arc<crate::sync::Semaphore>,
    /// Raised by the parent once it has read the child's exit_status.
    pub sema_exit: Arc<crate::sync::Semaphore>,

    /// Set when this thread's initial load (fork or exec) failed.
    pub load_failed: bool,
    /// True once this thread has had its exit_status consumed by a waiter,
    /// to reject a second `wait` on the same child (exact-once semantics).
    pub reaped: bool,
}

impl Thread {
    pub fn effective_priority_from_donors(&self, lookup: impl Fn(ThreadId) -> u8) -> u8 {
        let donor_max = self.donors.iter().map(|&d| lookup(d)).max().unwrap_or(0);
        core::cmp::max(self.init_priority, donor_max)
    }

    /// Build a fresh thread with an empty process identity (no address space,
    /// no fds beyond stdin/stdout). `kernel_stack` must be a freshly allocated
    /// boxed slice; its first word is stamped with [`THREAD_MAGIC`].
    pub fn new(
        tid: ThreadId,
        name: String,
        priority: u8,
        context: Context,
        mut kernel_stack: alloc::boxed::Box<[u8]>,
    ) -> Thread {
        if kernel_stack.len() >= 4 {
            kernel_stack[0..4].copy_from_slice(&THREAD_MAGIC.to_ne_bytes());
        }
        Thread {
            tid,
            name,
            status: ThreadState::Ready,
            base_priority: priority,
            effective_priority: priority,
            wake_tick: 0,
            waiting_lock: None,
            donors: Vec::new(),
            init_priority: priority,
            nice: 0,
            recent_cpu: 0,
            ticks_this_slice: 0,
            context,
            kernel_stack,
            magic: THREAD_MAGIC,
            locks_held: Vec::new(),
            parent: None,
            children: Vec::new(),
            exit_status: 0,
            pml4: None,
            spt: SupplementalPageTable::new(),
            user_stack_pointer: 0,
            user_regs: None,
            fd_table: crate::process::default_fd_table(),
            exec_file: None,
            sema_load: Arc::new(crate::sync::Semaphore::new(0)),
            sema_wait: Arc::new(crate::sync::Semaphore::new(0)),
            sema_exit: Arc::new(crate::sync::Semaphore::new(0)),
            load_failed: false,
            reaped: false,
        }
    }

    /// Checks the stack-overflow sentinel; panics (kernel assertion) if it has
    /// been clobbered, the same contract the reference kernel's
    /// `thread_current()` assertion provides.
    pub fn check_stack_overflow(&self) {
        if self.kernel_stack.len() >= 4 {
            let stamped = u32::from_ne_bytes(self.kernel_stack[0..4].try_into().unwrap());
            assert_eq!(stamped, THREAD_MAGIC, "thread '{}': kernel stack overflow detected", self.name);
        }
    }
}
