//! The file-object API the syscall layer and the ELF loader build on:
//! `open`/`close`/`read`/`write`/`seek`/`tell`/`length`/`create`/`remove`/
//! `reopen`/`duplicate`/`deny_write`/`allow_write`, backed by the VFS's
//! in-memory RamFs mount.
//!
//! Each open is a `FileHandle` carrying its own read/write position; two
//! handles opened on the same path never share a position, matching the
//! reference kernel's per-`struct file` offset.

use alloc::string::{String, ToString};

use super::error::{FsError, FsResult};
use super::VFS;

/// An open file: a path plus an independent byte offset.
#[derive(Debug, Clone)]
pub struct FileHandle {
    path: String,
    offset: usize,
}

impl FileHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = VFS.lock().read_file(&self.path, self.offset, buf)?;
        self.offset += n;
        Ok(n)
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        if is_write_denied(&self.path) {
            return Err(FsError::WriteDenied);
        }
        let n = write_at(&self.path, self.offset, data)?;
        self.offset += n;
        Ok(n)
    }

    pub fn seek(&mut self, position: usize) {
        self.offset = position;
    }

    pub fn tell(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> FsResult<usize> {
        VFS.lock().lookup(&self.path).map(|inode| inode.size)
    }

    /// Produce a second, independent handle on the same underlying file.
    /// The reference kernel's `file_reopen` and the `dup`-style syscall both
    /// reduce to this: a fresh position, same path, same deny-write state
    /// (deny-write is tracked per path, not per handle).
    pub fn reopen(&self) -> FileHandle {
        FileHandle { path: self.path.clone(), offset: 0 }
    }

    pub fn duplicate(&self) -> FileHandle {
        self.reopen()
    }
}

fn write_at(path: &str, offset: usize, data: &[u8]) -> FsResult<usize> {
    let mut vfs = VFS.lock();
    // `write_file` always writes at offset 0; reach past it is unnecessary
    // for the in-memory backend since `Vfs::write_file` is itself a thin
    // wrapper — write through the resolved filesystem directly instead.
    vfs.write_file_at(path, offset, data)
}

/// Open an existing file by path.
pub fn open(name: &str) -> FsResult<FileHandle> {
    let inode = VFS.lock().lookup(name)?;
    if inode.file_type == super::inode::FileType::Directory {
        return Err(FsError::IsADirectory);
    }
    Ok(FileHandle { path: name.to_string(), offset: 0 })
}

/// Create a new file of the given initial size (zero-filled).
pub fn create(name: &str, initial_size: usize) -> FsResult<()> {
    VFS.lock().create(name)?;
    if initial_size > 0 {
        let zeros = alloc::vec![0u8; initial_size];
        write_at(name, 0, &zeros)?;
    }
    Ok(())
}

/// Remove a file from the directory; open handles on it remain valid until
/// each is closed (Unix unlink semantics — there is no close-time reference
/// count on this in-memory backend beyond the deny-write table).
pub fn remove(name: &str) -> FsResult<()> {
    VFS.lock().unlink(name)
}

/// A handle is closed simply by dropping it; nothing further to release on
/// this in-memory backend beyond any outstanding deny-write grant, which the
/// caller (process exit / exec teardown) is responsible for undoing first.
pub fn close(_handle: FileHandle) {}

use alloc::collections::BTreeMap;
use alloc::string::String as AllocString;
use spin::Mutex;
use lazy_static::lazy_static;

lazy_static! {
    /// Per-path deny-write grant count. While nonzero, every `write` syscall
    /// against that path fails — used to protect a running program's own
    /// executable image while it is loaded, per the reference kernel's
    /// `file_deny_write`.
    static ref DENY_COUNTS: Mutex<BTreeMap<AllocString, usize>> = Mutex::new(BTreeMap::new());
}

pub fn deny_write(handle: &FileHandle) {
    let mut counts = DENY_COUNTS.lock();
    *counts.entry(handle.path.clone()).or_insert(0) += 1;
}

pub fn allow_write(handle: &FileHandle) {
    let mut counts = DENY_COUNTS.lock();
    if let Some(count) = counts.get_mut(&handle.path) {
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            counts.remove(&handle.path);
        }
    }
}

pub fn is_write_denied(path: &str) -> bool {
    DENY_COUNTS.lock().get(path).copied().unwrap_or(0) > 0
}
