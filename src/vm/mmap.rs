//! `mmap`/`munmap`: the reference kernel's `do_mmap`/`do_munmap` (`vm/file.c`),
//! carried into this repo even though the distilled syscall table drops
//! them, because the FILE page type has no other way to become reachable
//! from user space.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;
use lazy_static::lazy_static;

use crate::fs::file::FileHandle;
use crate::memory::paging::{self, PAGE_SIZE};
use crate::scheduler::{self, ThreadId};

use super::page::AfterInit;

lazy_static! {
    /// mapping start address -> page count, per thread. Consulted by
    /// `munmap` to know how far a mapping extends.
    static ref MAPPINGS: Mutex<BTreeMap<(ThreadId, u64), usize>> = Mutex::new(BTreeMap::new());
}

/// Map `length` bytes of `file` starting at `offset` into `tid`'s address
/// space at `addr`. Returns the mapped address on success.
pub fn do_mmap(tid: ThreadId, addr: u64, length: usize, writable: bool, file: Arc<Mutex<FileHandle>>, offset: usize) -> Option<u64> {
    if length == 0 || addr == 0 || addr != paging::page_floor(addr) || !paging::is_user_addr(addr) {
        return None;
    }

    let npages = (length + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

    // Reject overlap with anything already mapped in this address space.
    for i in 0..npages {
        let va = addr + (i as u64) * PAGE_SIZE;
        if !paging::is_user_addr(va) {
            return None;
        }
        if scheduler::with_thread(tid, |t| t.spt.contains(va)).unwrap_or(true) {
            return None;
        }
    }

    // An independent position from whatever fd the caller used to open it,
    // matching the reference kernel's `file_reopen` inside `do_mmap`.
    let backing = Arc::new(Mutex::new(file.lock().reopen()));

    for i in 0..npages {
        let va = addr + (i as u64) * PAGE_SIZE;
        let page_offset = offset + i * PAGE_SIZE as usize;
        let remaining = length - i * PAGE_SIZE as usize;
        let read_bytes = core::cmp::min(PAGE_SIZE as usize, remaining);
        let zero_bytes = PAGE_SIZE as usize - read_bytes;

        let after_init = AfterInit::File { file: backing.clone(), offset: page_offset, read_bytes, zero_bytes };
        let ok = scheduler::with_thread(tid, |t| t.spt.alloc_uninit(va, writable, after_init)).unwrap_or(false);
        if !ok {
            unmap_range(tid, addr, i);
            return None;
        }
    }

    MAPPINGS.lock().insert((tid, addr), npages);
    Some(addr)
}

/// Drop every mapping this thread owns without writing anything back — used
/// during process teardown, after the SPT itself has already been told to
/// flush dirty FILE pages page-by-page.
pub fn clear_thread(tid: ThreadId) {
    MAPPINGS.lock().retain(|&(owner, _), _| owner != tid);
}

pub fn do_munmap(tid: ThreadId, addr: u64) {
    let npages = match MAPPINGS.lock().remove(&(tid, addr)) {
        Some(n) => n,
        None => return,
    };
    unmap_range(tid, addr, npages);
}

fn unmap_range(tid: ThreadId, addr: u64, npages: usize) {
    for i in 0..npages {
        let va = addr + (i as u64) * PAGE_SIZE;

        let dirty = scheduler::with_thread(tid, |t| {
            t.pml4.as_ref().map(|p| paging::pml4_is_dirty(p, va)).unwrap_or(false)
        }).unwrap_or(false);

        scheduler::with_thread(tid, |t| {
            if let Some(p) = &t.pml4 {
                paging::pml4_clear_page(p, va);
            }
            if let Some(page) = t.spt.get_mut(va) {
                if page.is_resident() {
                    let _ = page.swap_out(dirty);
                }
            }
            t.spt.remove(va);
        });

        super::frame::free_user_frame(tid, va);
    }
}
