//! Usermode support — the `int 0x80` syscall gate and the Ring 3 entry
//! trampoline.
//!
//! Convention: RAX = syscall number, arguments in RDI, RSI, RDX, R10, R8, R9
//! (the same register set the AMD64 `syscall` instruction uses, kept here
//! even though this kernel enters through a software interrupt rather than
//! `syscall`/`sysret`), return value in RAX.

use core::arch::naked_asm;

/// The exact register snapshot this handler pushes, in increasing-address
/// order (so it overlays directly onto the saved stack frame). `fork` copies
/// this verbatim into the child so it resumes at the same instruction with
/// rax overwritten to 0.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// The `int 0x80` handler, entered from Ring 3. Saves every general-purpose
/// register the syscall convention can carry an argument in, marshals them
/// into the Rust dispatcher's six-argument calling convention, and restores
/// them (except rax, which carries the result) before `iretq`.
#[unsafe(naked)]
pub extern "C" fn syscall_handler_asm() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",

        // dispatch(number, frame): rsp already points at the TrapFrame we
        // just built (its field order matches this push sequence exactly),
        // so hand the dispatcher a pointer instead of unpacking six
        // registers by hand. `push rax` is a pure 16-byte alignment pad for
        // the call, same role the old arg5 push served.
        "mov rsi, rsp",  // frame
        "mov rdi, rax",  // number
        "push rax",
        "call {dispatch}",
        "add rsp, 8",

        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",

        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}

/// Jump to Ring 3 and execute user code. Pushes the `iretq` frame: SS, RSP,
/// RFLAGS, CS, RIP, then loads `argc`/`argv` into rdi/rsi — the registers
/// `_start` in the user C runtime expects its two arguments in.
pub fn jump_to_usermode(entry: u64, user_stack_top: u64, user_cs: u16, user_ss: u16, argc: u64, argv: u64) -> ! {
    unsafe {
        core::arch::asm!(
            "cli",
            "push rax",      // SS
            "push rcx",      // RSP
            "pushfq",
            "pop r11",
            "or r11, 0x200", // ensure IF is set on return to user mode
            "push r11",      // RFLAGS
            "push rdx",      // CS
            "push rdi",      // RIP
            "mov rdi, r8",   // argc (rdi's prior value is already pushed above)
            "mov rsi, r9",   // argv
            "iretq",
            in("rdi") entry,
            in("rcx") user_stack_top,
            in("rdx") user_cs as u64,
            in("rax") user_ss as u64,
            in("r8") argc,
            in("r9") argv,
            options(noreturn),
        );
    }
}

/// Resume a thread straight into a previously saved [`TrapFrame`] (used by
/// `fork`'s child and by a thread returning from a blocking syscall). Copies
/// the frame onto `kernel_stack_top - size_of::<TrapFrame>()` and jumps to
/// the same restore path `syscall_handler_asm` uses on its way out.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_trap_frame(frame: *const TrapFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
    );
}

/// Like [`resume_trap_frame`], but zeroes rax first — `fork`'s child resumes
/// with the same saved registers as its parent except for the syscall
/// return value, which must read 0 in the child.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_trap_frame_as_fork_child(frame: *const TrapFrame) -> ! {
    naked_asm!(
        "xor eax, eax",
        "jmp {resume}",
        resume = sym resume_trap_frame,
    );
}
