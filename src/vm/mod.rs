//! Demand-paged virtual memory: supplemental page table, frame table with
//! clock eviction, anonymous swap, file-backed write-back, and the mmap
//! pair built on top of the same FILE page type.

pub mod disk;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod spt;

pub use fault::FaultOutcome;
pub use page::FaultError;

use crate::memory::paging;
use crate::scheduler::{self, ThreadId};
use spt::SupplementalPageTable;

/// Tear down `tid`'s entire address space: write back every dirty
/// FILE-backed page, free every resident frame, drop the supplemental page
/// table and any mmap bookkeeping, then destroy the page-table scaffolding
/// itself. Called from `process::exit` and from `process::exec` replacing a
/// previous image, mirroring the reference kernel's `process_cleanup` +
/// `supplemental_page_table_kill`.
pub fn teardown_address_space(tid: ThreadId) {
    let resident = scheduler::with_thread(tid, |t| t.spt.resident_addrs()).unwrap_or_default();

    for va in resident {
        let dirty = scheduler::with_thread(tid, |t| {
            t.pml4.as_ref().map(|p| paging::pml4_is_dirty(p, va)).unwrap_or(false)
        }).unwrap_or(false);

        scheduler::with_thread(tid, |t| {
            if let Some(p) = &t.pml4 {
                paging::pml4_clear_page(p, va);
            }
            if let Some(page) = t.spt.get_mut(va) {
                let _ = page.teardown(dirty);
            }
        });
    }

    frame::free_all_for(tid);
    mmap::clear_thread(tid);
    scheduler::with_thread(tid, |t| t.spt = SupplementalPageTable::new());

    let pml4 = scheduler::with_thread(tid, |t| t.pml4.take()).flatten();
    if let Some(pml4) = pml4 {
        // `tid` is always the thread currently executing this teardown (its
        // own exit, or an exec replacing its own image), so its pml4 is
        // always the active one and must be switched away from first.
        paging::pml4_activate(None);
        paging::pml4_destroy(pml4);
    }
}
