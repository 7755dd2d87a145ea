pub mod paging;
pub mod frame_allocator;

use frame_allocator::BumpFrameAllocator;
use spin::Mutex;
use lazy_static::lazy_static;

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> = Mutex::new(BumpFrameAllocator::new());
}

/// Parse the Multiboot2 memory map, seed the physical frame allocator, record
/// the boot-time kernel page table, and bring up the kernel heap. Must run
/// once, before any user address space or process is created.
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info!")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    // The memory areas live behind `boot_info`, which Multiboot2 guarantees
    // stays resident for the life of the kernel, so re-borrowing them as
    // `'static` here is sound.
    let areas = memory_map_tag.memory_areas();
    let static_areas: &'static [multiboot2::MemoryArea] =
        unsafe { core::slice::from_raw_parts(areas.as_ptr(), areas.len()) };

    {
        let mut allocator = FRAME_ALLOCATOR.lock();
        unsafe { allocator.init_from_areas(static_areas) };
    }
    crate::log_info!("physical frame allocator initialized from Multiboot2 memory map");

    // boot.asm identity-maps the first 1 GiB of physical memory, so physical
    // address 0 doubles as virtual address 0 for everything the kernel
    // itself touches.
    paging::record_kernel_pml4();
    crate::log_info!("paging subsystem initialized (kernel PML4 recorded)");

    let mut mapper = unsafe { paging::kernel_mapper() };
    let mut allocator = FRAME_ALLOCATOR.lock();
    crate::allocator::init_heap(&mut mapper, &mut *allocator).expect("heap initialization failed");
    drop(allocator);
    crate::log_info!("kernel heap allocator initialized");

    if let Some(cmdline_tag) = boot_info.command_line_tag() {
        if let Ok(cmdline) = cmdline_tag.cmdline() {
            crate::config::init_from_cmdline(cmdline);
        }
    }
}
