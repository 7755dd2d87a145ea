//! System call dispatch — the kernel side of the `int 0x80` gate.
//!
//! Argument marshalling follows the AMD64 `syscall` convention even though
//! entry is via a software interrupt: number in rax, arguments in rdi, rsi,
//! rdx, r10, r8, r9, return value in rax. Every user pointer or string is
//! validated through [`crate::vm::fault`] before it is touched; an invalid
//! pointer terminates the calling process exactly like the reference
//! kernel's `check_address`, while a syscall-domain error (bad fd, unknown
//! file) just returns `-1` to the caller.

use alloc::sync::Arc;
use spin::Mutex;

use crate::fs::file::FileHandle;
use crate::interrupts::usermode::TrapFrame;
use crate::scheduler::{self, ThreadId};
use crate::vm::fault;
use crate::{fs, process};

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_MMAP: u64 = 14;
pub const SYS_MUNMAP: u64 = 15;

/// A path or buffer longer than this is rejected outright rather than
/// walked page-by-page forever; generous enough for any legitimate command
/// line or filename this kernel can boot.
const MAX_STRING_LEN: usize = 4096;
const MAX_RW_LEN: usize = 64 * 1024 * 1024;

/// Nothing to set up beyond the `int 0x80` gate itself, which the IDT
/// installs at boot — kept as a named hook so `lib.rs`'s subsystem-init
/// sequence reads the same way for every module.
pub fn init() {
    crate::log_info!("syscalls: dispatcher ready");
}

/// Central syscall dispatcher, called from `syscall_handler_asm` with the
/// trap frame it just built still sitting at `rsp`. Snapshots the frame
/// into the current thread (`fork` needs a copy of the caller's full
/// register state) before decoding arguments out of it.
pub extern "C" fn dispatch(number: u64, frame: *mut TrapFrame) -> u64 {
    let regs = unsafe { *frame };
    scheduler::with_current(|t| t.user_regs = Some(regs));
    scheduler::with_current(|t| t.user_stack_pointer = regs.rsp);

    let tid = scheduler::current_tid();
    let a0 = regs.rdi;
    let a1 = regs.rsi;
    let a2 = regs.rdx;
    let a3 = regs.r10;
    let a4 = regs.r8;

    match number {
        SYS_HALT => sys_halt(),
        SYS_EXIT => sys_exit(a0 as i32),
        SYS_FORK => sys_fork(tid, a0),
        SYS_EXEC => sys_exec(tid, a0),
        SYS_WAIT => sys_wait(tid, a0),
        SYS_CREATE => sys_create(tid, a0, a1),
        SYS_REMOVE => sys_remove(tid, a0),
        SYS_OPEN => sys_open(tid, a0),
        SYS_FILESIZE => sys_filesize(tid, a0),
        SYS_READ => sys_read(tid, a0, a1, a2),
        SYS_WRITE => sys_write(tid, a0, a1, a2),
        SYS_SEEK => sys_seek(tid, a0, a1),
        SYS_TELL => sys_tell(tid, a0),
        SYS_CLOSE => sys_close(tid, a0),
        SYS_MMAP => sys_mmap(tid, a0, a1, a2, a3, a4),
        SYS_MUNMAP => sys_munmap(tid, a0),
        // Unknown syscall number: treated as a domain error rather than a
        // terminating fault.
        _ => u64::MAX,
    }
}

/// Terminate the calling process with `exit_status = -1` — the uniform
/// response to an invalid user pointer or string, matching §4.4's "Address
/// validation for syscalls".
fn terminate_bad_pointer() -> ! {
    process::exit(-1);
}

fn sys_halt() -> ! {
    crate::log_info!("syscalls: halt requested");
    loop {
        x86_64::instructions::hlt();
    }
}

fn sys_exit(status: i32) -> u64 {
    process::exit(status);
}

fn sys_fork(tid: ThreadId, name_ptr: u64) -> u64 {
    let _ = tid;
    let name = match fault::validate_user_cstr(tid, name_ptr, MAX_STRING_LEN) {
        Some(s) => s,
        None => terminate_bad_pointer(),
    };
    process::fork(&name) as u64
}

fn sys_exec(tid: ThreadId, cmdline_ptr: u64) -> u64 {
    let cmdline = match fault::validate_user_cstr(tid, cmdline_ptr, MAX_STRING_LEN) {
        Some(s) => s,
        None => terminate_bad_pointer(),
    };
    // `process::exec` only returns on failure (success jumps straight to
    // user mode); per §6 the caller is terminated on a failed exec.
    let err = process::exec(&cmdline);
    crate::log_warn!("syscalls: exec('{}') failed: {}", cmdline, err);
    process::exit(-1);
}

fn sys_wait(tid: ThreadId, child_pid: u64) -> u64 {
    let _ = tid;
    process::wait(child_pid) as u64
}

fn sys_create(tid: ThreadId, name_ptr: u64, initial_size: u64) -> u64 {
    let name = match fault::validate_user_cstr(tid, name_ptr, MAX_STRING_LEN) {
        Some(s) => s,
        None => terminate_bad_pointer(),
    };
    match fs::file::create(&name, initial_size as usize) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

fn sys_remove(tid: ThreadId, name_ptr: u64) -> u64 {
    let name = match fault::validate_user_cstr(tid, name_ptr, MAX_STRING_LEN) {
        Some(s) => s,
        None => terminate_bad_pointer(),
    };
    match fs::file::remove(&name) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

fn sys_open(tid: ThreadId, name_ptr: u64) -> u64 {
    let name = match fault::validate_user_cstr(tid, name_ptr, MAX_STRING_LEN) {
        Some(s) => s,
        None => terminate_bad_pointer(),
    };
    let handle = match fs::file::open(&name) {
        Ok(h) => h,
        Err(_) => return u64::MAX,
    };

    let fd = scheduler::with_current(|t| {
        let fd = process::alloc_fd(t)?;
        t.fd_table[fd] = Some(Arc::new(Mutex::new(handle)));
        Some(fd)
    }).flatten();

    match fd {
        Some(fd) => fd as u64,
        None => u64::MAX,
    }
}

fn sys_filesize(tid: ThreadId, fd: u64) -> u64 {
    let handle = match fd_handle(tid, fd as usize) {
        Some(h) => h,
        None => return u64::MAX,
    };
    match handle.lock().length() {
        Ok(len) => len as u64,
        Err(_) => u64::MAX,
    }
}

fn sys_read(tid: ThreadId, fd: u64, buf_ptr: u64, len: u64) -> u64 {
    let len = len as usize;
    if len > MAX_RW_LEN {
        return u64::MAX;
    }
    if !fault::validate_user_buffer(tid, buf_ptr, len, true) {
        terminate_bad_pointer();
    }

    // fd 0 is the keyboard; reading from fd 1 (stdout) makes no sense and
    // terminates the process, per §6.
    if fd == 0 {
        let slice = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, len) };
        return read_from_keyboard(slice) as u64;
    }
    if fd == 1 {
        terminate_bad_pointer();
    }

    let handle = match fd_handle(tid, fd as usize) {
        Some(h) => h,
        None => return u64::MAX,
    };
    let slice = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, len) };
    match handle.lock().read(slice) {
        Ok(n) => n as u64,
        Err(_) => u64::MAX,
    }
}

fn sys_write(tid: ThreadId, fd: u64, buf_ptr: u64, len: u64) -> u64 {
    let len = len as usize;
    if len > MAX_RW_LEN {
        return u64::MAX;
    }
    if !fault::validate_user_buffer(tid, buf_ptr, len, false) {
        terminate_bad_pointer();
    }

    // fd 1 is the console; writing to fd 0 (stdin) terminates the process.
    if fd == 1 {
        let slice = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
        let mut writer = crate::vga::WRITER.lock();
        for &b in slice {
            writer.write_byte(b);
        }
        return len as u64;
    }
    if fd == 0 {
        terminate_bad_pointer();
    }

    let handle = match fd_handle(tid, fd as usize) {
        Some(h) => h,
        None => return u64::MAX,
    };
    let slice = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
    match handle.lock().write(slice) {
        Ok(n) => n as u64,
        Err(_) => u64::MAX,
    }
}

fn sys_seek(tid: ThreadId, fd: u64, position: u64) -> u64 {
    if let Some(handle) = fd_handle(tid, fd as usize) {
        handle.lock().seek(position as usize);
    }
    0
}

fn sys_tell(tid: ThreadId, fd: u64) -> u64 {
    match fd_handle(tid, fd as usize) {
        Some(h) => h.lock().tell() as u64,
        None => u64::MAX,
    }
}

fn sys_close(tid: ThreadId, fd: u64) -> u64 {
    let fd = fd as usize;
    let closed = scheduler::with_current(|t| {
        if fd >= t.fd_table.len() || t.fd_table[fd].is_none() {
            return false;
        }
        t.fd_table[fd] = None;
        true
    }).unwrap_or(false);

    if !closed {
        // §6: close on an fd that isn't open terminates the caller.
        let _ = tid;
        terminate_bad_pointer();
    }
    0
}

/// `mmap(addr, length, writable, fd, offset)` — maps `length` bytes of the
/// file behind `fd` into the caller's address space at `addr`, per §4.4 and
/// §6. `addr` must be page-aligned and non-null (this kernel has no
/// "pick an address for me" mode); `fd` 0/1 have no backing file and are
/// rejected like any other domain error rather than terminating the caller.
fn sys_mmap(tid: ThreadId, addr: u64, length: u64, writable: u64, fd: u64, offset: u64) -> u64 {
    if fd == 0 || fd == 1 {
        return 0; // NULL
    }
    let handle = match fd_handle(tid, fd as usize) {
        Some(h) => h,
        None => return 0,
    };
    match crate::vm::mmap::do_mmap(tid, addr, length as usize, writable != 0, handle, offset as usize) {
        Some(mapped) => mapped,
        None => 0,
    }
}

/// `munmap(addr)` — unmaps the mapping previously returned by `mmap` at
/// `addr`; a no-op if there is none, per §4.4 (the reference kernel's
/// `do_munmap` is likewise silent on an unknown address).
fn sys_munmap(tid: ThreadId, addr: u64) -> u64 {
    crate::vm::mmap::do_munmap(tid, addr);
    0
}

fn fd_handle(tid: ThreadId, fd: usize) -> Option<Arc<Mutex<FileHandle>>> {
    let _ = tid;
    scheduler::with_current(|t| t.fd_table.get(fd).cloned().flatten()).flatten()
}

/// Line-buffered keyboard read backing fd 0: blocks on each key, echoes it
/// to the console the way a TTY in canonical mode would, and returns on
/// Enter or once `buf` is full. There is no raw/non-canonical mode here —
/// this kernel's userland has no termios-style switch to ask for one.
fn read_from_keyboard(buf: &mut [u8]) -> usize {
    use crate::drivers::keyboard::scancodes::KeyCode;

    let mut n = 0;
    while n < buf.len() {
        match crate::drivers::keyboard::read_char() {
            KeyCode::Char(c) => {
                let mut tmp = [0u8; 4];
                let s = c.encode_utf8(&mut tmp);
                let bytes = s.as_bytes();
                if n + bytes.len() > buf.len() {
                    break;
                }
                buf[n..n + bytes.len()].copy_from_slice(bytes);
                n += bytes.len();
                crate::print!("{}", c);
            }
            KeyCode::Enter => {
                crate::println!();
                break;
            }
            KeyCode::Backspace => {
                if n > 0 {
                    n -= 1;
                    crate::vga::WRITER.lock().backspace();
                }
            }
            KeyCode::Unknown => {}
        }
    }
    n
}
