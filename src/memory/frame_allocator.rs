use alloc::vec::Vec;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Physical frame allocator: a bump pointer over the Multiboot2 memory map
/// backed by a free list, so frames released by VM eviction/teardown (which
/// a bump-only scheme cannot express) are reused before the bump pointer
/// advances further.
pub struct BumpFrameAllocator {
    next_free_frame: PhysFrame,
    current_limit: PhysFrame,
    free_list: Vec<PhysFrame>,
}

impl BumpFrameAllocator {
    /// Create a new, empty allocator. Must be [`init`]ialized before use.
    pub fn new() -> Self {
        BumpFrameAllocator {
            next_free_frame: PhysFrame::containing_address(PhysAddr::new(0)),
            current_limit: PhysFrame::containing_address(PhysAddr::new(0)),
            free_list: Vec::new(),
        }
    }

    /// Initialize the allocator with a start and end physical address.
    pub unsafe fn init(&mut self, start: PhysAddr, end: PhysAddr) {
        self.next_free_frame = PhysFrame::containing_address(start);
        self.current_limit = PhysFrame::containing_address(end);
    }

    /// Initialize the allocator from the largest Multiboot2 usable memory area.
    pub unsafe fn init_from_areas(&mut self, areas: &'static [multiboot2::MemoryArea]) {
        let usable = areas
            .iter()
            .max_by_key(|area| area.end_address() - area.start_address())
            .expect("no usable memory areas reported by Multiboot2");

        // Leave the first 2 MiB alone: kernel image and low-memory boot structures.
        let start = core::cmp::max(usable.start_address(), 0x20_0000);
        self.init(PhysAddr::new(start), PhysAddr::new(usable.end_address() - 1));
    }

    /// Release a frame back to the allocator for reuse.
    pub fn dealloc(&mut self, frame: PhysFrame) {
        self.free_list.push(frame);
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(frame) = self.free_list.pop() {
            return Some(frame);
        }
        if self.next_free_frame <= self.current_limit {
            let frame = self.next_free_frame;
            self.next_free_frame += 1;
            Some(frame)
        } else {
            None
        }
    }
}

impl FrameDeallocator<Size4KiB> for BumpFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.dealloc(frame);
    }
}
