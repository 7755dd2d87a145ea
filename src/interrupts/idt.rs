use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use lazy_static::lazy_static;
use crate::{println, log_error, log_info, log_warn};
use super::gdt;
use pic8259::ChainedPics;
use spin::Mutex;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault.set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt[InterruptIndex::Timer.as_usize()]
            .set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(keyboard_interrupt_handler);
        unsafe {
            idt[0x80]
                .set_handler_addr(x86_64::VirtAddr::new(
                    crate::interrupts::usermode::syscall_handler_asm as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(
    stack_frame: InterruptStackFrame)
{
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame, _error_code: u64) -> !
{
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame, error_code: PageFaultErrorCode)
{
    use x86_64::registers::control::Cr2;

    let addr = match Cr2::read() {
        Ok(a) => a.as_u64(),
        Err(_) => {
            panic!("EXCEPTION: PAGE FAULT with unreadable CR2\n{:#?}", stack_frame);
        }
    };
    let user = error_code.contains(PageFaultErrorCode::USER_MODE);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let not_present = !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);

    if !user {
        // Kernel code must validate user pointers before dereferencing them;
        // a fault taken while running kernel code is always an invariant
        // violation, never a recoverable demand-paging event.
        log_error!("EXCEPTION: PAGE FAULT in kernel mode at {:#x}", addr);
        panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
    }

    let tid = crate::scheduler::current_tid();
    match crate::vm::fault::handle_page_fault(tid, addr, user, write, not_present) {
        crate::vm::FaultOutcome::Resolved => {}
        crate::vm::FaultOutcome::Terminate => {
            log_warn!("page fault: terminating thread {:?} (bad access at {:#x})", tid, addr);
            crate::process::terminate_current(-1);
        }
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(
    _stack_frame: InterruptStackFrame)
{
    crate::scheduler::tick();
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(
    _stack_frame: InterruptStackFrame)
{
    use x86_64::instructions::port::Port;
    let mut port: Port<u8> = Port::new(0x60);
    // Lê o scancode da porta 0x60
    let scancode = unsafe { port.read() };

    // Envia o scancode para o driver de teclado processar
    crate::drivers::keyboard::push_scancode(scancode);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame, error_code: u64)
{
    panic!("EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}", stack_frame);
}
