#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod vga;
pub mod serial;
pub mod config;
pub mod allocator;
pub mod interrupts;
pub mod memory;
pub mod sync;
pub mod scheduler;
pub mod process;
pub mod vm;
pub mod loader;
pub mod syscalls;
pub mod fs;
pub mod drivers;

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    vga::init();
    serial::init();
    interrupts::init();
    log_info!("kernel boot: core subsystems starting");

    memory::init(multiboot_info_addr);
    log_info!("kernel boot: memory initialized");

    fs::init();
    scheduler::init();
    syscalls::init();
    drivers::init();
    println!("eduOS kernel is running.");

    x86_64::instructions::interrupts::enable();

    if let Some(program) = config::CONFIG.lock().init_program.clone() {
        let args = config::CONFIG.lock().init_args.clone();
        if let Err(e) = process::exec_initial(&program, &args) {
            log_error!("failed to start init program '{}': {:?}", program, e);
        }
    }

    loop {
        use crate::drivers::keyboard::scancodes::KeyCode;
        let key = crate::drivers::keyboard::read_char();

        match key {
            KeyCode::Char(c) => print!("{}", c),
            KeyCode::Enter => println!(),
            KeyCode::Backspace => crate::vga::WRITER.lock().backspace(),
            KeyCode::Unknown => {}
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
