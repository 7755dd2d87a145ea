//! Frame table and clock eviction. One entry per physical frame handed out
//! to user space; frames backing the kernel heap or page-table scaffolding
//! never appear here.
//!
//! Eviction needs to read the hardware accessed bit through the *owning*
//! process's page table and to reach into that process's supplemental page
//! table to run `swap_out` — exactly the cross-thread lookup the central
//! `BTreeMap<ThreadId, Box<Thread>>` thread table (see `scheduler`) exists
//! to make possible without raw pointers into another thread's state.

use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::FrameAllocator;
use x86_64::PhysAddr;

use crate::memory::paging;
use crate::scheduler::{self, ThreadId};

use super::page::FaultError;

struct FrameEntry {
    kva: u64,
    owner: ThreadId,
    va: u64,
}

struct FrameTable {
    frames: Vec<FrameEntry>,
    clock_hand: usize,
}

static FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable { frames: Vec::new(), clock_hand: 0 });

/// Allocate a physical frame for `owner`'s page at `va`, evicting via the
/// clock algorithm if none are free. Returns the frame's kernel virtual
/// address (identical to its physical address under this repo's
/// identity-mapping assumption).
pub fn alloc_user_frame(owner: ThreadId, va: u64) -> Result<u64, FaultError> {
    let kva = match raw_alloc_frame() {
        Some(kva) => kva,
        None => {
            evict_one()?;
            raw_alloc_frame().ok_or(FaultError::IoFailure)?
        }
    };

    let mut table = FRAME_TABLE.lock();
    table.frames.push(FrameEntry { kva, owner, va });
    Ok(kva)
}

fn raw_alloc_frame() -> Option<u64> {
    let mut allocator = crate::memory::FRAME_ALLOCATOR.lock();
    let frame = allocator.allocate_frame()?;
    Some(frame.start_address().as_u64())
}

fn raw_dealloc_frame(kva: u64) {
    use x86_64::structures::paging::{PhysFrame, Size4KiB};
    let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(kva));
    crate::memory::FRAME_ALLOCATOR.lock().dealloc(frame);
}

/// Release the frame backing `owner`'s page at `va` (already evicted or
/// being torn down along with the whole address space).
pub fn free_user_frame(owner: ThreadId, va: u64) {
    let mut table = FRAME_TABLE.lock();
    if let Some(idx) = table.frames.iter().position(|f| f.owner == owner && f.va == va) {
        let entry = table.frames.swap_remove(idx);
        drop(table);
        raw_dealloc_frame(entry.kva);
    }
}

/// Release every frame owned by `owner` — called from process teardown
/// after the owner's SPT entries have already been told to drop their
/// resident state (this only reclaims the physical pages).
pub fn free_all_for(owner: ThreadId) {
    let mut table = FRAME_TABLE.lock();
    let mut kept = Vec::with_capacity(table.frames.len());
    let mut freed = Vec::new();
    for entry in table.frames.drain(..) {
        if entry.owner == owner {
            freed.push(entry.kva);
        } else {
            kept.push(entry);
        }
    }
    table.frames = kept;
    drop(table);
    for kva in freed {
        raw_dealloc_frame(kva);
    }
}

/// Two-pass clock scan: a frame whose owning page table reports the
/// accessed bit set is given a second chance (bit cleared, skipped);
/// the first frame found with the bit already clear is evicted.
fn evict_one() -> Result<(), FaultError> {
    let victim_idx = {
        let mut table = FRAME_TABLE.lock();
        if table.frames.is_empty() {
            return Err(FaultError::IoFailure);
        }
        let len = table.frames.len();
        let mut idx = None;
        for _ in 0..(2 * len) {
            let i = table.clock_hand % len;
            table.clock_hand = (table.clock_hand + 1) % len;
            let (owner, va) = (table.frames[i].owner, table.frames[i].va);
            let accessed = scheduler::with_thread(owner, |t| {
                t.pml4.as_ref().map(|p| paging::pml4_is_accessed(p, va)).unwrap_or(false)
            }).unwrap_or(false);
            if accessed {
                scheduler::with_thread(owner, |t| {
                    if let Some(p) = &t.pml4 {
                        paging::pml4_set_accessed(p, va, false);
                    }
                });
                continue;
            }
            idx = Some(i);
            break;
        }
        match idx {
            Some(i) => i,
            None => 0, // every frame was recently accessed; evict the clock hand's frame anyway
        }
    };

    let (owner, va) = {
        let table = FRAME_TABLE.lock();
        (table.frames[victim_idx].owner, table.frames[victim_idx].va)
    };

    let dirty = scheduler::with_thread(owner, |t| {
        t.pml4.as_ref().map(|p| paging::pml4_is_dirty(p, va)).unwrap_or(false)
    }).unwrap_or(false);

    scheduler::with_thread(owner, |t| {
        if let Some(p) = &t.pml4 {
            paging::pml4_clear_page(p, va);
        }
        if let Some(page) = t.spt.get_mut(va) {
            page.swap_out(dirty)
        } else {
            Ok(())
        }
    }).unwrap_or(Ok(()))?;

    let mut table = FRAME_TABLE.lock();
    let entry = table.frames.swap_remove(victim_idx);
    drop(table);
    raw_dealloc_frame(entry.kva);
    Ok(())
}
