//! Semaphores, ownership locks with priority donation, and condition
//! variables — layered entirely on the scheduler's block/unblock primitives,
//! the same split the reference kernel keeps between `threads/synch.c` and
//! `threads/thread.c`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::scheduler::{self, ThreadId};

/// Stable identifier for a lock, used so a blocked thread can record *which*
/// lock it is waiting on without holding a raw pointer to it (locks are
/// frequently embedded in kernel objects whose address we don't want threads
/// to depend on across a context switch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u64);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

impl LockId {
    fn alloc() -> LockId {
        LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct SemaphoreInner {
    count: i64,
    waiters: Vec<ThreadId>,
}

/// A counting semaphore: `down` blocks while the count is zero, `up`
/// increments it and wakes the highest-priority waiter.
pub struct Semaphore {
    inner: Mutex<SemaphoreInner>,
}

impl Semaphore {
    pub const fn new(value: i64) -> Semaphore {
        Semaphore { inner: Mutex::new(SemaphoreInner { count: value, waiters: Vec::new() }) }
    }

    /// Decrement the semaphore, blocking until it is positive.
    pub fn down(&self) {
        loop {
            let mut block = false;
            x86_64::instructions::interrupts::without_interrupts(|| {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    inner.count -= 1;
                } else {
                    let me = scheduler::current_tid();
                    if !inner.waiters.contains(&me) {
                        inner.waiters.push(me);
                    }
                    block = true;
                }
            });
            if !block {
                return;
            }
            scheduler::block_current();
        }
    }

    /// Non-blocking attempt; returns true if the count was decremented.
    pub fn try_down(&self) -> bool {
        let mut acquired = false;
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.count > 0 {
                inner.count -= 1;
                acquired = true;
            }
        });
        acquired
    }

    /// Increment the semaphore, waking the highest-priority waiter if any.
    /// Preempts the caller if the woken thread now outranks it.
    pub fn up(&self) {
        let mut woken = None;
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.waiters.is_empty() {
                inner.count += 1;
            } else {
                inner.waiters.sort_by_key(|&t| core::cmp::Reverse(scheduler::effective_priority_of(t)));
                woken = Some(inner.waiters.remove(0));
            }
        });
        if let Some(t) = woken {
            scheduler::unblock(t);
            if scheduler::effective_priority_of(t) > scheduler::effective_priority_of(scheduler::current_tid()) {
                scheduler::yield_now();
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.inner.lock().count
    }
}

/// A binary semaphore with an owner and donation bookkeeping. Only the
/// owner may release; recursive acquire is a programming error (asserted).
pub struct Lock {
    id: LockId,
    sema: Semaphore,
    owner: Mutex<Option<ThreadId>>,
}

impl Lock {
    pub fn new() -> Lock {
        Lock { id: LockId::alloc(), sema: Semaphore::new(1), owner: Mutex::new(None) }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn is_held_by_current(&self) -> bool {
        *self.owner.lock() == Some(scheduler::current_tid())
    }

    /// Acquire the lock, donating priority up the chain of lock holders if it
    /// is currently held by someone else.
    pub fn acquire(&self) {
        let me = scheduler::current_tid();
        assert!(!self.is_held_by_current(), "lock: recursive acquire by '{:?}'", me);

        x86_64::instructions::interrupts::without_interrupts(|| {
            if let Some(owner) = *self.owner.lock() {
                scheduler::begin_donation(me, self.id, owner);
            }
        });

        self.sema.down();

        x86_64::instructions::interrupts::without_interrupts(|| {
            *self.owner.lock() = Some(me);
            scheduler::end_donation_wait(me);
            scheduler::note_lock_held(me, self.id);
        });
    }

    /// Release the lock. Only the owner may call this (asserted).
    pub fn release(&self) {
        let me = scheduler::current_tid();
        assert_eq!(*self.owner.lock(), Some(me), "lock: release by non-owner");

        x86_64::instructions::interrupts::without_interrupts(|| {
            *self.owner.lock() = None;
            scheduler::revoke_donations_for_lock(me, self.id);
            scheduler::forget_lock_held(me, self.id);
        });

        self.sema.up();
    }
}

/// A condition variable, implemented (as in the reference kernel) as a list
/// of per-waiter one-shot semaphores rather than a single shared semaphore,
/// so `signal` can target exactly the highest-priority waiter.
pub struct CondVar {
    waiters: Mutex<Vec<(ThreadId, alloc::sync::Arc<Semaphore>)>>,
}

impl CondVar {
    pub fn new() -> CondVar {
        CondVar { waiters: Mutex::new(Vec::new()) }
    }

    /// Atomically release `lock`, block until signaled, then reacquire it.
    pub fn wait(&self, lock: &Lock) {
        let me = scheduler::current_tid();
        let my_sema = alloc::sync::Arc::new(Semaphore::new(0));
        self.waiters.lock().push((me, my_sema.clone()));

        lock.release();
        my_sema.down();
        lock.acquire();
    }

    /// Wake the highest-priority waiter, if any.
    pub fn signal(&self) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        waiters.sort_by_key(|(t, _)| core::cmp::Reverse(scheduler::effective_priority_of(*t)));
        let (_, sema) = waiters.remove(0);
        drop(waiters);
        sema.up();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        while !self.waiters.lock().is_empty() {
            self.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_basic_down_up() {
        let s = Semaphore::new(1);
        assert!(s.try_down());
        assert!(!s.try_down());
        s.up();
        assert!(s.try_down());
    }
}
