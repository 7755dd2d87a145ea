//! Page fault routing and syscall pointer validation — `vm/vm.c`'s
//! `vm_try_handle_fault` and the reference kernel's `is_user_vaddr`/buffer
//! validation helpers, folded together since both walk the same SPT.

use alloc::string::String;
use alloc::vec::Vec;

use crate::memory::paging::{self, PAGE_SIZE, USER_STACK_TOP};
use crate::scheduler::{self, ThreadId};

use super::frame;

/// Grow the stack for a fault up to this far below the current top —
/// beyond this, a fault below the stack is treated as a genuine bad access
/// rather than a growing stack.
const STACK_GROWTH_LIMIT: u64 = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    Terminate,
}

/// Handle a page fault taken while running `tid`. `user` is whether the
/// faulting access itself was a user-mode memory reference (not whether the
/// CPU was in user mode at the time — a syscall handler dereferencing a
/// user pointer still counts as `user = true` for the purposes of this
/// function, same as the reference kernel's `user` flag derived from the
/// faulting `rip`).
pub fn handle_page_fault(tid: ThreadId, addr: u64, user: bool, write: bool, not_present: bool) -> FaultOutcome {
    if addr == 0 || (!user && !paging::is_user_addr(addr)) {
        return FaultOutcome::Terminate;
    }
    if !not_present {
        // Present-page fault (permission violation, e.g. write to a
        // read-only page) is never recoverable here.
        return FaultOutcome::Terminate;
    }
    if !paging::is_user_addr(addr) {
        return FaultOutcome::Terminate;
    }

    let page_va = paging::page_floor(addr);

    let has_page = scheduler::with_thread(tid, |t| t.spt.contains(page_va)).unwrap_or(false);

    if !has_page {
        if is_stack_growth(tid, addr) {
            let ok = scheduler::with_thread(tid, |t| t.spt.alloc_anon(page_va, true)).unwrap_or(false);
            if !ok {
                return FaultOutcome::Terminate;
            }
        } else {
            return FaultOutcome::Terminate;
        }
    }

    let writable_ok = scheduler::with_thread(tid, |t| {
        t.spt.get(page_va).map(|p| p.writable).unwrap_or(false)
    }).unwrap_or(false);
    if write && !writable_ok {
        return FaultOutcome::Terminate;
    }

    let frame_kva = match frame::alloc_user_frame(tid, page_va) {
        Ok(kva) => kva,
        Err(_) => return FaultOutcome::Terminate,
    };

    let swap_result = scheduler::with_thread(tid, |t| {
        t.spt.get_mut(page_va).map(|p| p.swap_in(frame_kva))
    }).flatten();

    match swap_result {
        Some(Ok(())) => {}
        _ => {
            frame::free_user_frame(tid, page_va);
            return FaultOutcome::Terminate;
        }
    }

    let writable = scheduler::with_thread(tid, |t| t.spt.get(page_va).map(|p| p.writable)).flatten().unwrap_or(false);
    let installed = scheduler::with_thread(tid, |t| {
        t.pml4.as_ref().map(|p| paging::pml4_set_page(p, page_va, frame_kva, writable)).unwrap_or(false)
    }).unwrap_or(false);

    if !installed {
        frame::free_user_frame(tid, page_va);
        return FaultOutcome::Terminate;
    }

    FaultOutcome::Resolved
}

fn is_stack_growth(tid: ThreadId, addr: u64) -> bool {
    if addr >= USER_STACK_TOP {
        return false;
    }
    let rsp = scheduler::with_thread(tid, |t| t.user_stack_pointer).unwrap_or(0);
    // A `push`-family instruction faults up to 8 bytes below the current
    // stack pointer; anything further down only grows the stack if it's
    // still within the bounded growth window below the fixed stack top.
    (addr + 8 >= rsp || addr >= rsp) && addr + STACK_GROWTH_LIMIT >= USER_STACK_TOP
}

/// Install a freshly faulted-in mapping ahead of time (used by `mmap` setup
/// and argument-stack construction, which need the page resident
/// immediately rather than waiting for the first real fault).
pub fn prefault(tid: ThreadId, va: u64) -> bool {
    handle_page_fault(tid, va, true, true, true) == FaultOutcome::Resolved
}

/// Validate that `len` bytes starting at `addr` lie entirely in user space
/// and are (or can be made, via the normal fault path) resident and
/// accessible. Used by the syscall dispatcher before touching any user
/// buffer.
pub fn validate_user_buffer(tid: ThreadId, addr: u64, len: usize, write: bool) -> bool {
    if len == 0 {
        return paging::is_user_addr(addr) || addr == 0;
    }
    let end = match addr.checked_add(len as u64 - 1) {
        Some(e) => e,
        None => return false,
    };
    if !paging::is_user_addr(addr) || !paging::is_user_addr(end) {
        return false;
    }

    let mut page = paging::page_floor(addr);
    let last_page = paging::page_floor(end);
    loop {
        if !ensure_mapped(tid, page, write) {
            return false;
        }
        if page == last_page {
            break;
        }
        page += PAGE_SIZE;
    }
    true
}

/// Validate a NUL-terminated user string, returning its bytes (without the
/// NUL) if every page it spans is valid; `None` terminates the syscall.
pub fn validate_user_cstr(tid: ThreadId, addr: u64, max_len: usize) -> Option<String> {
    let mut bytes = Vec::new();
    let mut cur = addr;
    loop {
        if bytes.len() >= max_len {
            return None;
        }
        if !paging::is_user_addr(cur) {
            return None;
        }
        if !ensure_mapped(tid, paging::page_floor(cur), false) {
            return None;
        }
        let mapped_kva = scheduler::with_thread(tid, |t| {
            t.pml4.as_ref().and_then(|p| paging::pml4_get_page(p, paging::page_floor(cur)))
        }).flatten()?;
        let offset_in_page = cur - paging::page_floor(cur);
        let byte = unsafe { *((mapped_kva + offset_in_page) as *const u8) };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cur += 1;
    }
    String::from_utf8(bytes).ok()
}

fn ensure_mapped(tid: ThreadId, page_va: u64, write: bool) -> bool {
    let already_mapped = scheduler::with_thread(tid, |t| {
        t.pml4.as_ref().and_then(|p| paging::pml4_get_page(p, page_va)).is_some()
    }).unwrap_or(false);
    if already_mapped {
        return true;
    }
    handle_page_fault(tid, page_va, true, write, true) == FaultOutcome::Resolved
}
