//! Process lifecycle: `fork`/`exec`/`wait`/`exit`, layered on top of the
//! scheduler's thread table and the VM subsystem's address-space teardown.
//! Mirrors `userprog/process.c` in the reference kernel — `process_fork`/
//! `__do_fork`, `process_exec`, `process_wait`, `process_exit` — but expressed
//! against this crate's `Thread`/`SupplementalPageTable` types instead of a
//! `struct thread` with an embedded `uninit_page`/`anon_page`/`file_page`
//! union.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::file::{self, FileHandle};
use crate::interrupts::{gdt, usermode};
use crate::interrupts::usermode::TrapFrame;
use crate::loader::elf::{self, ExecError};
use crate::memory::paging::{self, PAGE_SIZE};
use crate::scheduler::task::{Thread, PRI_DEFAULT};
use crate::scheduler::{self, ThreadId};
use crate::vm;
use crate::vm::page::{AfterInit, PageKind};
use crate::{log_info, log_warn, println};

/// FDs 0 and 1 are reserved for stdin/stdout and never looked up through this
/// table (the syscall layer special-cases them); real files start at
/// [`crate::scheduler::task::FD_BASE`].
pub fn default_fd_table() -> Vec<Option<Arc<Mutex<FileHandle>>>> {
    alloc::vec![None, None]
}

/// Find the lowest free descriptor at or above `FD_BASE`, growing the table
/// if every existing slot beyond the reserved two is in use.
pub(crate) fn alloc_fd(t: &mut Thread) -> Option<usize> {
    for (fd, slot) in t.fd_table.iter().enumerate().skip(crate::scheduler::task::FD_BASE) {
        if slot.is_none() {
            return Some(fd);
        }
    }
    if t.fd_table.len() >= crate::scheduler::task::FD_LIMIT {
        return None;
    }
    t.fd_table.push(None);
    Some(t.fd_table.len() - 1)
}

/// Build and schedule a fresh kernel thread that will host a user process:
/// a stack of the standard size, a trampoline context, and an otherwise
/// empty `Thread` (no address space yet — `entry` is responsible for
/// building one, e.g. via [`exec`]).
fn spawn_user_thread(name: &str, priority: u8, entry: extern "C" fn(usize), arg: usize) -> ThreadId {
    let tid = scheduler::alloc_tid();
    let stack = scheduler::alloc_kernel_stack();
    let stack_top = (stack.as_ptr() as u64 + stack.len() as u64) & !0xF;
    let ctx = scheduler::make_kernel_context(entry, arg, stack_top);
    let thread = Box::new(Thread::new(tid, name.to_string(), priority, ctx, stack));
    scheduler::spawn_thread(thread)
}

// ---------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------

/// Bootstrap the very first user process from `_start`. Spawns a dedicated
/// kernel thread (mirroring the reference kernel's `initd`) that calls
/// [`exec`] on `program` joined with `args`; this function itself only
/// waits long enough to know whether that initial load succeeded.
pub fn exec_initial(program: &str, args: &[String]) -> Result<(), ExecError> {
    let mut cmdline = String::from(program);
    for a in args {
        cmdline.push(' ');
        cmdline.push_str(a);
    }
    let payload = Box::new(cmdline);
    let tid = spawn_user_thread(program, PRI_DEFAULT, initial_entry, Box::into_raw(payload) as usize);
    log_info!("process: spawned initial thread {:?} for '{}'", tid, program);
    Ok(())
}

extern "C" fn initial_entry(arg: usize) {
    let cmdline = unsafe { Box::from_raw(arg as *mut String) };
    let err = exec(&cmdline);
    log_warn!("process: initial program '{}' failed to load: {}", cmdline, err);
    exit(-1);
}

// ---------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------

/// Replace the calling thread's address space with the program named by the
/// first whitespace-separated token of `cmdline`; the rest become argv.
/// Never returns on success — the last thing it does is jump to Ring 3.
pub fn exec(cmdline: &str) -> ExecError {
    let mut parts = cmdline.split_whitespace();
    let program = match parts.next() {
        Some(p) => p,
        None => return ExecError::InvalidFormat,
    };
    let argv: Vec<String> = core::iter::once(program.to_string())
        .chain(parts.map(|s| s.to_string()))
        .collect();

    let tid = scheduler::current_tid();

    // Re-exec tears down whatever address space this thread already had.
    vm::teardown_address_space(tid);
    if let Some(old_exec) = scheduler::with_current(|t| t.exec_file.take()).flatten() {
        file::allow_write(&old_exec.lock());
    }

    let mut handle = match file::open(program) {
        Ok(h) => h,
        Err(_) => return ExecError::FileNotFound,
    };
    let len = handle.length().unwrap_or(0);
    let mut data = alloc::vec![0u8; len];
    if handle.read(&mut data).is_err() {
        return ExecError::ReadError;
    }

    let image = match elf::parse(&data) {
        Ok(i) => i,
        Err(e) => return e,
    };

    let pml4 = match paging::pml4_create() {
        Some(p) => p,
        None => return ExecError::MemoryError,
    };
    scheduler::with_current(|t| t.pml4 = Some(pml4));
    paging::pml4_activate(Some(&pml4));

    let exec_arc = Arc::new(Mutex::new(handle));
    file::deny_write(&exec_arc.lock());
    scheduler::with_current(|t| t.exec_file = Some(exec_arc.clone()));

    for seg in &image.segments {
        if register_segment(tid, seg, exec_arc.clone()).is_err() {
            return ExecError::MemoryError;
        }
    }

    let stack_page = paging::page_floor(paging::USER_STACK_TOP - 1);
    scheduler::with_current(|t| t.spt.alloc_anon(stack_page, true));
    if !vm::fault::prefault(tid, stack_page) {
        return ExecError::MemoryError;
    }

    let (rsp, argc, argv_base) = match setup_argv_stack(&argv) {
        Some(v) => v,
        None => return ExecError::MemoryError,
    };
    scheduler::with_current(|t| t.user_stack_pointer = rsp);

    let user_cs = gdt::user_code_selector().0;
    let user_ss = gdt::user_data_selector().0;
    log_info!("exec: '{}' entry={:#x} rsp={:#x} argc={}", program, image.entry, rsp, argc);
    usermode::jump_to_usermode(image.entry, rsp, user_cs, user_ss, argc, argv_base)
}

/// Register one `PT_LOAD` segment as a run of lazy UNINIT pages, splitting
/// it into page-sized file/zero-fill chunks the same way
/// `load_segment`/`lazy_load_segment` do in the reference kernel.
fn register_segment(tid: ThreadId, seg: &elf::Segment, file: Arc<Mutex<FileHandle>>) -> Result<(), ()> {
    let page_offset = (seg.vaddr % PAGE_SIZE) as usize;
    let upage_base = paging::page_floor(seg.vaddr);

    let read_bytes_total = page_offset + seg.file_size;
    let span = page_offset + seg.mem_size;
    let span_pages = (span + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize * PAGE_SIZE as usize;
    let zero_bytes_total = span_pages - read_bytes_total;

    let mut read_bytes = read_bytes_total;
    let mut zero_bytes = zero_bytes_total;
    let mut upage = upage_base;
    let mut ofs = seg.file_offset;

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = core::cmp::min(read_bytes, PAGE_SIZE as usize);
        let page_zero_bytes = PAGE_SIZE as usize - page_read_bytes;

        let after_init = AfterInit::File { file: file.clone(), offset: ofs, read_bytes: page_read_bytes, zero_bytes: page_zero_bytes };
        let ok = scheduler::with_thread(tid, |t| t.spt.alloc_uninit(upage, seg.writable, after_init)).unwrap_or(false);
        if !ok {
            return Err(());
        }

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_SIZE;
        ofs += page_read_bytes;
    }
    Ok(())
}

/// Construct the initial user stack image on the single eagerly-mapped page
/// at the top of the address space: argv strings, a 16-byte-aligned argv
/// pointer array with a NULL sentinel, and a fake return address — the same
/// layout `process_exec`'s argument-passing code builds, written directly
/// through the user virtual addresses since the new pml4 is already active.
fn setup_argv_stack(argv: &[String]) -> Option<(u64, u64, u64)> {
    setup_argv_stack_at(argv, paging::USER_STACK_TOP, paging::USER_VADDR_BASE)
}

/// Layout engine behind [`setup_argv_stack`], parameterized over the stack's
/// top and its low-water mark so the same code path can be driven against a
/// real host buffer in tests instead of the fixed kernel virtual addresses
/// (`stack_top` is only ever a real, already-mapped page in the kernel
/// itself).
fn setup_argv_stack_at(argv: &[String], stack_top: u64, low_water: u64) -> Option<(u64, u64, u64)> {
    let mut sp = stack_top;
    let mut argv_ptrs = Vec::with_capacity(argv.len());

    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= bytes.len() as u64 + 1;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), sp as *mut u8, bytes.len());
            *((sp + bytes.len() as u64) as *mut u8) = 0;
        }
        argv_ptrs.push(sp);
    }
    argv_ptrs.reverse();

    sp &= !0xF;

    sp -= 8 * (argv.len() as u64 + 1);
    let argv_base = sp;
    for (i, ptr) in argv_ptrs.iter().enumerate() {
        unsafe { *((argv_base + (i as u64) * 8) as *mut u64) = *ptr; }
    }
    unsafe { *((argv_base + argv.len() as u64 * 8) as *mut u64) = 0; }

    sp -= 8;
    unsafe { *(sp as *mut u64) = 0; }

    if sp < low_water {
        return None;
    }
    Some((sp, argv.len() as u64, argv_base))
}

// ---------------------------------------------------------------------
// fork
// ---------------------------------------------------------------------

struct ForkPayload {
    parent: ThreadId,
    frame: TrapFrame,
}

/// Duplicate the calling process into a new child thread and return the
/// child's tid to the parent (or -1 on failure). The heavy lifting —
/// address-space and fd-table duplication — runs on the child thread itself
/// once scheduled, exactly like `__do_fork` in the reference kernel; the
/// parent only waits on the child's `sema_load`.
pub fn fork(name: &str) -> i64 {
    let parent = scheduler::current_tid();
    let frame = match scheduler::with_current(|t| t.user_regs) {
        Some(f) => f,
        None => return -1,
    };
    let priority = scheduler::with_current(|t| t.base_priority);

    let payload = Box::new(ForkPayload { parent, frame });
    let child = spawn_user_thread(name, priority, fork_child_entry, Box::into_raw(payload) as usize);
    scheduler::with_thread(child, |t| t.parent = Some(parent));
    scheduler::with_current(|t| t.children.push(child));

    let sema_load = match scheduler::with_thread(child, |c| c.sema_load.clone()) {
        Some(s) => s,
        None => return -1,
    };
    sema_load.down();

    let failed = scheduler::with_thread(child, |c| c.load_failed).unwrap_or(true);
    if failed {
        return -1;
    }
    child.0 as i64
}

extern "C" fn fork_child_entry(arg: usize) {
    let payload = unsafe { Box::from_raw(arg as *mut ForkPayload) };
    let ForkPayload { parent, frame } = *payload;
    let child = scheduler::current_tid();

    let result = (|| -> Result<(), ()> {
        let pml4 = paging::pml4_create().ok_or(())?;
        scheduler::with_current(|t| t.pml4 = Some(pml4));
        paging::pml4_activate(Some(&pml4));
        copy_address_space(parent, child)?;
        duplicate_fd_table(parent, child)?;
        Ok(())
    })();

    let my_sema_load = scheduler::with_current(|t| t.sema_load.clone());

    match result {
        Ok(()) => {
            scheduler::with_current(|t| t.user_regs = Some(frame));
            my_sema_load.up();
            unsafe { usermode::resume_trap_frame_as_fork_child(&frame as *const TrapFrame) }
        }
        Err(()) => {
            scheduler::with_current(|t| t.load_failed = true);
            my_sema_load.up();
            exit(-1);
        }
    }
}

/// Duplicate every entry of the parent's supplemental page table into the
/// child's, per §4.3: ANON pages are duplicated by copying their frame
/// contents (forcing any currently-swapped page resident in the parent
/// first), UNINIT descriptors are re-installed verbatim against a
/// duplicated file handle, and FILE-backed ranges are re-opened as fresh
/// lazy UNINIT entries rather than copied.
fn copy_address_space(parent: ThreadId, child: ThreadId) -> Result<(), ()> {
    let swapped: Vec<u64> = scheduler::with_thread(parent, |t| {
        t.spt.iter().filter_map(|(&va, p)| match &p.kind {
            PageKind::Anon { swap_slot: Some(_) } => Some(va),
            _ => None,
        }).collect()
    }).unwrap_or_default();
    for va in swapped {
        if vm::fault::handle_page_fault(parent, va, true, false, true) != vm::FaultOutcome::Resolved {
            return Err(());
        }
    }

    enum Snap {
        UninitAnon { writable: bool },
        UninitFile { writable: bool, file: Arc<Mutex<FileHandle>>, offset: usize, read_bytes: usize, zero_bytes: usize },
        File { writable: bool, file: Arc<Mutex<FileHandle>>, offset: usize, read_bytes: usize, zero_bytes: usize },
        AnonFresh { writable: bool },
        AnonCopy { writable: bool, bytes: alloc::boxed::Box<[u8]> },
    }

    let snaps: Vec<(u64, Snap)> = scheduler::with_thread(parent, |t| {
        t.spt.iter().map(|(&va, p)| {
            let snap = match &p.kind {
                PageKind::Uninit(AfterInit::Anon) => Snap::UninitAnon { writable: p.writable },
                PageKind::Uninit(AfterInit::File { file, offset, read_bytes, zero_bytes }) => Snap::UninitFile {
                    writable: p.writable, file: file.clone(), offset: *offset, read_bytes: *read_bytes, zero_bytes: *zero_bytes,
                },
                PageKind::File { file, offset, read_bytes, zero_bytes } => Snap::File {
                    writable: p.writable, file: file.clone(), offset: *offset, read_bytes: *read_bytes, zero_bytes: *zero_bytes,
                },
                PageKind::Anon { .. } => match p.frame_kva {
                    Some(kva) => {
                        let bytes = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize) };
                        Snap::AnonCopy { writable: p.writable, bytes: bytes.to_vec().into_boxed_slice() }
                    }
                    None => Snap::AnonFresh { writable: p.writable },
                },
            };
            (va, snap)
        }).collect()
    }).unwrap_or_default();

    for (va, snap) in snaps {
        match snap {
            Snap::UninitAnon { writable } => {
                scheduler::with_thread(child, |t| t.spt.alloc_uninit(va, writable, AfterInit::Anon));
            }
            Snap::UninitFile { writable, file, offset, read_bytes, zero_bytes } => {
                let dup = Arc::new(Mutex::new(file.lock().duplicate()));
                scheduler::with_thread(child, |t| {
                    t.spt.alloc_uninit(va, writable, AfterInit::File { file: dup, offset, read_bytes, zero_bytes })
                });
            }
            Snap::File { writable, file, offset, read_bytes, zero_bytes } => {
                let dup = Arc::new(Mutex::new(file.lock().duplicate()));
                scheduler::with_thread(child, |t| {
                    t.spt.alloc_uninit(va, writable, AfterInit::File { file: dup, offset, read_bytes, zero_bytes })
                });
            }
            Snap::AnonFresh { writable } => {
                scheduler::with_thread(child, |t| t.spt.alloc_anon(va, writable));
            }
            Snap::AnonCopy { writable, bytes } => {
                scheduler::with_thread(child, |t| t.spt.alloc_anon(va, writable));
                let frame_kva = vm::frame::alloc_user_frame(child, va).map_err(|_| ())?;
                unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), frame_kva as *mut u8, PAGE_SIZE as usize) };
                scheduler::with_thread(child, |t| {
                    if let Some(p) = t.spt.get_mut(va) {
                        p.frame_kva = Some(frame_kva);
                    }
                });
                let installed = scheduler::with_thread(child, |t| {
                    t.pml4.as_ref().map(|pm| paging::pml4_set_page(pm, va, frame_kva, writable)).unwrap_or(false)
                }).unwrap_or(false);
                if !installed {
                    return Err(());
                }
            }
        }
    }
    Ok(())
}

/// Duplicate every open descriptor (and the exec-file grant) so the child's
/// copies have independent file positions, per the reference kernel's
/// `file_duplicate` loop in `__do_fork`.
fn duplicate_fd_table(parent: ThreadId, child: ThreadId) -> Result<(), ()> {
    let entries = scheduler::with_thread(parent, |t| t.fd_table.clone()).ok_or(())?;
    let mut dup_table = Vec::with_capacity(entries.len());
    for e in &entries {
        match e {
            Some(f) => dup_table.push(Some(Arc::new(Mutex::new(f.lock().duplicate())))),
            None => dup_table.push(None),
        }
    }
    let parent_exec = scheduler::with_thread(parent, |t| t.exec_file.clone()).flatten();
    let dup_exec = parent_exec.map(|f| Arc::new(Mutex::new(f.lock().duplicate())));

    scheduler::with_thread(child, |t| {
        t.fd_table = dup_table;
        t.exec_file = dup_exec;
    });
    Ok(())
}

// ---------------------------------------------------------------------
// wait
// ---------------------------------------------------------------------

/// Block until `child_pid` exits, returning its exit status, or `-1` if it
/// is not a direct, not-already-waited-on child of the caller. Exact-once:
/// the child is removed from the parent's `children` list before returning,
/// so a second `wait` on the same pid always fails.
pub fn wait(child_pid: u64) -> i64 {
    let target = ThreadId(child_pid);
    let is_child = scheduler::with_current(|t| t.children.contains(&target));
    if !is_child {
        return -1;
    }

    let sema_wait = match scheduler::with_thread(target, |c| c.sema_wait.clone()) {
        Some(s) => s,
        None => return -1,
    };
    sema_wait.down();

    let status = scheduler::with_thread(target, |c| c.exit_status).unwrap_or(-1);
    let sema_exit = scheduler::with_thread(target, |c| c.sema_exit.clone());

    scheduler::with_current(|t| t.children.retain(|&c| c != target));
    if let Some(s) = sema_exit {
        s.up();
    }
    status as i64
}

// ---------------------------------------------------------------------
// exit
// ---------------------------------------------------------------------

/// Terminate the calling process: announce the exit status, close every
/// open file (releasing the exec-file write-deny grant), detach and
/// release any still-living children, tear down the address space, hand the
/// exit status to a waiting parent, then block until that parent
/// acknowledges having read it. The very last step hands control to the
/// scheduler, which never returns here.
pub fn exit(status: i32) -> ! {
    let tid = scheduler::current_tid();
    let name = scheduler::with_current(|t| t.name.clone());
    println!("{}: exit({})", name, status);

    scheduler::with_current(|t| {
        t.exit_status = status;
        t.fd_table.clear();
    });

    if let Some(exec_handle) = scheduler::with_current(|t| t.exec_file.take()).flatten() {
        file::allow_write(&exec_handle.lock());
    }

    let children = scheduler::with_current(|t| core::mem::take(&mut t.children));
    for child in children {
        if let Some(sema_exit) = scheduler::with_thread(child, |c| {
            c.parent = None;
            c.sema_exit.clone()
        }) {
            sema_exit.up();
        }
    }

    vm::teardown_address_space(tid);

    let (sema_wait, sema_exit) = scheduler::with_current(|t| (t.sema_wait.clone(), t.sema_exit.clone()));
    sema_wait.up();
    sema_exit.down();

    scheduler::exit_current(status)
}

/// Used by fault paths (bad user pointer, unrecoverable page fault) that
/// need to kill the running process rather than return an error to it.
pub fn terminate_current(status: i32) -> ! {
    exit(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives [`setup_argv_stack_at`] against a real host-backed buffer so
    /// the raw pointer writes land on actually mapped memory instead of the
    /// kernel's fixed `USER_STACK_TOP`.
    fn stack_buf() -> (Vec<u8>, u64, u64) {
        let buf = alloc::vec![0u8; PAGE_SIZE as usize];
        let low = buf.as_ptr() as u64;
        let top = low + buf.len() as u64;
        (buf, low, top)
    }

    fn read_u64(addr: u64) -> u64 {
        unsafe { *(addr as *const u64) }
    }

    fn read_cstr(addr: u64) -> String {
        let mut bytes = Vec::new();
        let mut p = addr;
        loop {
            let b = unsafe { *(p as *const u8) };
            if b == 0 {
                break;
            }
            bytes.push(b);
            p += 1;
        }
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn argv_stack_layout_matches_argc_and_sentinels() {
        let (_buf, low, top) = stack_buf();
        let argv: Vec<String> = alloc::vec!["prog".to_string(), "hello".to_string(), "x".to_string()];

        let (rsp, argc, argv_base) = setup_argv_stack_at(&argv, top, low).expect("enough room on a full page");

        assert_eq!(argc, argv.len() as u64);

        // A fake return address sits directly below the argv pointer array.
        assert_eq!(rsp, argv_base - 8);
        assert_eq!(read_u64(rsp), 0);

        // argv.len() is odd here, so the 16-byte-aligned cut before the
        // pointer array lands the array itself on a 16-byte boundary too.
        assert_eq!(argv_base % 16, 0);

        // Pointer array is argv.len() entries followed by a NULL sentinel,
        // each entry pointing at the right NUL-terminated string.
        for (i, arg) in argv.iter().enumerate() {
            let ptr = read_u64(argv_base + (i as u64) * 8);
            assert_eq!(read_cstr(ptr), *arg);
        }
        assert_eq!(read_u64(argv_base + argv.len() as u64 * 8), 0);
    }

    #[test]
    fn argv_stack_fails_when_stack_space_is_exhausted() {
        let (_buf, _low, top) = stack_buf();
        let argv: Vec<String> = alloc::vec!["short".to_string()];
        // All writes still land inside the real buffer; only the low-water
        // mark is set artificially high, well above where the layout ends up.
        let low_water = top - 8;
        assert!(setup_argv_stack_at(&argv, top, low_water).is_none());
    }
}
