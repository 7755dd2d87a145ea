//! Page-map (`pml4_*`) primitives: the one piece of the spec's "external
//! collaborator" list (§6, "page-table manipulation primitives") this repo
//! still has to implement itself, since there is no separate hardware
//! abstraction layer underneath it. Built directly on the `x86_64` crate's
//! `PageTable`/`Cr3` types the way this repo's heap allocator already does.
//!
//! The boot loader identity-maps the first gigabyte of physical memory (see
//! `boot.asm`), so every physical address used below doubles as its own
//! kernel virtual address — there is no separate physical-memory offset to
//! thread through these functions.

use spin::{Mutex, Once};
use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        FrameAllocator, OffsetPageTable, PageTable, PageTableFlags, PhysFrame,
    },
    PhysAddr, VirtAddr,
};

pub const PAGE_SIZE: u64 = 4096;

/// Lowest virtual address of the kernel half of the address space. Anything
/// at or above this line is shared across every process's page map; anything
/// below is private per-process user space.
pub const KERNEL_VADDR_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Fixed top of the user stack, one page below the kernel/user split so a
/// stack-growth fault can never walk into kernel territory.
pub const USER_STACK_TOP: u64 = KERNEL_VADDR_BASE - PAGE_SIZE;

/// Page 0 is never mapped (the ELF loader and `mmap` both refuse to touch it)
/// so that a null-pointer dereference from user code reliably faults.
pub const USER_VADDR_BASE: u64 = PAGE_SIZE;

/// Opaque per-process address-space handle: the physical frame holding the
/// process's top-level (PML4) page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pml4(pub PhysFrame);

impl Pml4 {
    pub fn phys_addr(&self) -> u64 {
        self.0.start_address().as_u64()
    }
}

static KERNEL_PML4: Once<PhysFrame> = Once::new();

/// Record the boot-time (kernel-only) PML4 so `pml4_activate(None)` and new
/// address spaces have a kernel half to start from. Called once from
/// `memory::init`, before any user address space is created.
pub fn record_kernel_pml4() {
    let (frame, _) = Cr3::read();
    KERNEL_PML4.call_once(|| frame);
}

/// Build an `OffsetPageTable` over the *currently active* table, for use by
/// the heap allocator during early boot (before any process exists). Relies
/// on the same identity-mapping assumption as the rest of this module.
pub unsafe fn kernel_mapper() -> OffsetPageTable<'static> {
    let (frame, _) = Cr3::read();
    let table = table_at(frame);
    OffsetPageTable::new(table, VirtAddr::new(0))
}

fn table_at(frame: PhysFrame) -> &'static mut PageTable {
    let ptr = frame.start_address().as_u64() as *mut PageTable;
    unsafe { &mut *ptr }
}

fn is_active(pml4: &Pml4) -> bool {
    Cr3::read().0 == pml4.0
}

/// Allocate a zeroed frame to back a new page-table level.
fn alloc_table_frame() -> Option<PhysFrame> {
    let mut allocator = super::FRAME_ALLOCATOR.lock();
    let frame = allocator.allocate_frame()?;
    table_at(frame).zero();
    Some(frame)
}

/// Create a fresh address space: a new PML4 whose kernel half (indices
/// 256..512) is copied from the boot-time kernel table, and whose user half
/// starts out completely unmapped.
pub fn pml4_create() -> Option<Pml4> {
    let frame = alloc_table_frame()?;
    let new_table = table_at(frame);

    let kernel_frame = *KERNEL_PML4.get().expect("record_kernel_pml4 not called");
    let kernel_table = table_at(kernel_frame);
    for i in 256..512 {
        new_table[i] = kernel_table[i].clone();
    }

    Some(Pml4(frame))
}

/// Recursively free every page-table-level frame belonging to the user half
/// of this address space. Leaf data frames (the pages the SPT/frame table
/// track) must already have been freed by VM teardown before this is called
/// — this function only reclaims the PDPT/PD/PT scaffolding.
pub fn pml4_destroy(pml4: Pml4) {
    assert!(!is_active(&pml4), "pml4_destroy: destroying the active address space");

    let l4 = table_at(pml4.0);
    let mut allocator = super::FRAME_ALLOCATOR.lock();

    for i4 in 0..256 {
        if !l4[i4].flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let pdpt_frame = PhysFrame::containing_address(l4[i4].addr());
        let pdpt = table_at(pdpt_frame);
        for i3 in 0..512 {
            if !pdpt[i3].flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            let pd_frame = PhysFrame::containing_address(pdpt[i3].addr());
            let pd = table_at(pd_frame);
            for i2 in 0..512 {
                if !pd[i2].flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let pt_frame = PhysFrame::containing_address(pd[i2].addr());
                allocator.dealloc(pt_frame);
            }
            allocator.dealloc(pd_frame);
        }
        allocator.dealloc(pdpt_frame);
    }
    allocator.dealloc(pml4.0);
}

/// Switch the active address space. `None` restores the boot-time
/// kernel-only table — used transiently during process teardown, after the
/// SPT/frame table have released the outgoing space's user pages but before
/// its PML4 frame itself is freed.
pub fn pml4_activate(pml4: Option<&Pml4>) {
    let frame = match pml4 {
        Some(p) => p.0,
        None => *KERNEL_PML4.get().expect("record_kernel_pml4 not called"),
    };
    unsafe {
        Cr3::write(frame, Cr3::read().1);
    }
}

/// Split a page-aligned virtual address into its four page-table indices.
fn indices(va: u64) -> (usize, usize, usize, usize) {
    let v = VirtAddr::new(va);
    (
        u16::from(v.p4_index()) as usize,
        u16::from(v.p3_index()) as usize,
        u16::from(v.p2_index()) as usize,
        u16::from(v.p1_index()) as usize,
    )
}

/// Walk to the leaf PTE for `upage`, creating intermediate levels along the
/// way when `create` is set. Returns `None` if `create` is false and any
/// level is missing, or if a level needed creating but allocation failed.
fn walk<'a>(pml4: &Pml4, upage: u64, create: bool) -> Option<&'a mut x86_64::structures::paging::PageTableEntry> {
    let (i4, i3, i2, i1) = indices(upage);
    let l4 = table_at(pml4.0);

    let pdpt_frame = if l4[i4].flags().contains(PageTableFlags::PRESENT) {
        PhysFrame::containing_address(l4[i4].addr())
    } else if create {
        let f = alloc_table_frame()?;
        l4[i4].set_frame(f, PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE);
        f
    } else {
        return None;
    };
    let pdpt = table_at(pdpt_frame);

    let pd_frame = if pdpt[i3].flags().contains(PageTableFlags::PRESENT) {
        PhysFrame::containing_address(pdpt[i3].addr())
    } else if create {
        let f = alloc_table_frame()?;
        pdpt[i3].set_frame(f, PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE);
        f
    } else {
        return None;
    };
    let pd = table_at(pd_frame);

    let pt_frame = if pd[i2].flags().contains(PageTableFlags::PRESENT) {
        PhysFrame::containing_address(pd[i2].addr())
    } else if create {
        let f = alloc_table_frame()?;
        pd[i2].set_frame(f, PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE);
        f
    } else {
        return None;
    };
    let pt = table_at(pt_frame);

    if !create && !pt[i1].flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(&mut pt[i1])
}

/// Physical address currently backing `upage`, or `None` if unmapped.
pub fn pml4_get_page(pml4: &Pml4, upage: u64) -> Option<u64> {
    let entry = walk(pml4, upage, false)?;
    if entry.flags().contains(PageTableFlags::PRESENT) {
        Some(entry.addr().as_u64())
    } else {
        None
    }
}

/// Map `upage` to the physical frame `kpage`, creating intermediate page
/// tables as needed. Returns false on allocation failure.
pub fn pml4_set_page(pml4: &Pml4, upage: u64, kpage: u64, writable: bool) -> bool {
    let entry = match walk(pml4, upage, true) {
        Some(e) => e,
        None => return false,
    };
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    entry.set_addr(PhysAddr::new(kpage), flags);
    if is_active(pml4) {
        x86_64::instructions::tlb::flush(VirtAddr::new(upage));
    }
    true
}

/// Remove the mapping for `upage`, if any.
pub fn pml4_clear_page(pml4: &Pml4, upage: u64) {
    if let Some(entry) = walk(pml4, upage, false) {
        entry.set_unused();
        if is_active(pml4) {
            x86_64::instructions::tlb::flush(VirtAddr::new(upage));
        }
    }
}

pub fn pml4_is_accessed(pml4: &Pml4, upage: u64) -> bool {
    walk(pml4, upage, false).map_or(false, |e| e.flags().contains(PageTableFlags::ACCESSED))
}

pub fn pml4_set_accessed(pml4: &Pml4, upage: u64, accessed: bool) {
    if let Some(entry) = walk(pml4, upage, false) {
        let mut flags = entry.flags();
        flags.set(PageTableFlags::ACCESSED, accessed);
        let addr = entry.addr();
        entry.set_addr(addr, flags);
    }
}

pub fn pml4_is_dirty(pml4: &Pml4, upage: u64) -> bool {
    walk(pml4, upage, false).map_or(false, |e| e.flags().contains(PageTableFlags::DIRTY))
}

pub fn pml4_set_dirty(pml4: &Pml4, upage: u64, dirty: bool) {
    if let Some(entry) = walk(pml4, upage, false) {
        let mut flags = entry.flags();
        flags.set(PageTableFlags::DIRTY, dirty);
        let addr = entry.addr();
        entry.set_addr(addr, flags);
    }
}

/// Round `addr` down to its containing page boundary.
pub fn page_floor(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// True if `addr` falls in the private user half of the address space.
pub fn is_user_addr(addr: u64) -> bool {
    addr != 0 && addr < KERNEL_VADDR_BASE
}

static ACTIVATE_LOCK: Mutex<()> = Mutex::new(());

/// Serializes activation so two threads can never race a CR3 write against
/// each other during a context switch.
pub fn with_activation_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = ACTIVATE_LOCK.lock();
    f()
}
