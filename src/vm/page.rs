//! Supplemental page table entries: the tagged UNINIT/ANON/FILE variant and
//! its `swap_in`/`swap_out` dispatch, mirroring `vm/uninit.c`, `vm/anon.c`,
//! and `vm/file.c` in the reference kernel folded into one Rust enum instead
//! of three structs behind a vtable.

use alloc::sync::Arc;
use alloc::vec;
use spin::Mutex;

use crate::fs::file::FileHandle;
use crate::memory::paging::PAGE_SIZE;

use super::disk;
use super::swap;

#[derive(Debug)]
pub enum FaultError {
    /// The init function or swap-in/out could not complete (e.g. disk read
    /// past backing file, swap exhaustion).
    IoFailure,
}

/// What a UNINIT page becomes once its initializer has run.
pub enum AfterInit {
    Anon,
    File {
        file: Arc<Mutex<FileHandle>>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

pub enum PageKind {
    Uninit(AfterInit),
    Anon { swap_slot: Option<usize> },
    File {
        file: Arc<Mutex<FileHandle>>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

/// A single virtual page's bookkeeping entry. `frame_kva` is `Some` iff the
/// page is currently resident (and therefore also present in the page
/// table) — enforced by the frame table, which is the only code that sets
/// or clears it.
pub struct Page {
    pub va: u64,
    pub writable: bool,
    pub kind: PageKind,
    pub frame_kva: Option<u64>,
}

impl Page {
    pub fn new_uninit(va: u64, writable: bool, after_init: AfterInit) -> Page {
        Page { va, writable, kind: PageKind::Uninit(after_init), frame_kva: None }
    }

    pub fn new_anon(va: u64, writable: bool) -> Page {
        Page { va, writable, kind: PageKind::Anon { swap_slot: None }, frame_kva: None }
    }

    /// Populate `frame_kva` (a freshly allocated, zeroed frame) with this
    /// page's content, then update `kind`/`frame_kva` to reflect residency.
    /// Called exactly once per fault that brings the page in.
    pub fn swap_in(&mut self, frame_kva: u64) -> Result<(), FaultError> {
        let dst = unsafe { core::slice::from_raw_parts_mut(frame_kva as *mut u8, PAGE_SIZE as usize) };

        match core::mem::replace(&mut self.kind, PageKind::Anon { swap_slot: None }) {
            PageKind::Uninit(AfterInit::Anon) => {
                dst.fill(0);
                self.kind = PageKind::Anon { swap_slot: None };
            }
            PageKind::Uninit(AfterInit::File { file, offset, read_bytes, zero_bytes }) => {
                read_file_page(&file, offset, read_bytes, dst)?;
                self.kind = PageKind::File { file, offset, read_bytes, zero_bytes };
            }
            PageKind::Anon { swap_slot: Some(slot) } => {
                disk::swap_disk().read_page(slot, dst);
                swap::free_slot(slot);
                self.kind = PageKind::Anon { swap_slot: None };
            }
            PageKind::Anon { swap_slot: None } => {
                dst.fill(0);
                self.kind = PageKind::Anon { swap_slot: None };
            }
            PageKind::File { file, offset, read_bytes, zero_bytes } => {
                read_file_page(&file, offset, read_bytes, dst)?;
                self.kind = PageKind::File { file, offset, read_bytes, zero_bytes };
            }
        }
        self.frame_kva = Some(frame_kva);
        Ok(())
    }

    /// Evict this page's resident frame. `dirty` comes from the hardware
    /// dirty bit, read by the caller before the page table entry is cleared.
    pub fn swap_out(&mut self, dirty: bool) -> Result<(), FaultError> {
        let frame_kva = self.frame_kva.take().expect("swap_out on non-resident page");
        let src = unsafe { core::slice::from_raw_parts(frame_kva as *const u8, PAGE_SIZE as usize) };

        match &mut self.kind {
            PageKind::Anon { swap_slot } => {
                let slot = swap::alloc_slot().ok_or(FaultError::IoFailure)?;
                disk::swap_disk().write_page(slot, src);
                *swap_slot = Some(slot);
            }
            PageKind::File { file, offset, read_bytes, .. } => {
                if dirty {
                    let mut f = file.lock();
                    f.seek(*offset);
                    f.write(&src[..*read_bytes]).map_err(|_| FaultError::IoFailure)?;
                }
            }
            PageKind::Uninit(_) => unreachable!("swap_out on a page with no frame"),
        }
        Ok(())
    }

    pub fn is_resident(&self) -> bool {
        self.frame_kva.is_some()
    }

    /// Drop this page's resident frame as part of tearing down the whole
    /// address space (process exit or exec replacing it). Unlike
    /// [`Self::swap_out`], an ANON page is simply dropped rather than written
    /// to swap — there is no one left to swap it back in for — while a
    /// dirty FILE page is still written back, matching
    /// `supplemental_page_table_kill` in the reference kernel.
    pub fn teardown(&mut self, dirty: bool) -> Result<(), FaultError> {
        let frame_kva = match self.frame_kva.take() {
            Some(k) => k,
            None => return Ok(()),
        };
        if let PageKind::File { file, offset, read_bytes, .. } = &self.kind {
            if dirty {
                let src = unsafe { core::slice::from_raw_parts(frame_kva as *const u8, PAGE_SIZE as usize) };
                let mut f = file.lock();
                f.seek(*offset);
                f.write(&src[..*read_bytes]).map_err(|_| FaultError::IoFailure)?;
            }
        }
        Ok(())
    }
}

fn read_file_page(file: &Arc<Mutex<FileHandle>>, offset: usize, read_bytes: usize, dst: &mut [u8]) -> Result<(), FaultError> {
    let mut f = file.lock();
    f.seek(offset);
    let mut tmp = vec![0u8; read_bytes];
    let n = f.read(&mut tmp).map_err(|_| FaultError::IoFailure)?;
    dst[..n].copy_from_slice(&tmp[..n]);
    dst[n..].fill(0);
    Ok(())
}
