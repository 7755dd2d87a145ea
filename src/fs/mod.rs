pub mod vfs;
pub mod inode;
pub mod file;
pub mod dentry;
pub mod mount;
pub mod error;
pub mod ramfs;

use spin::Mutex;
use lazy_static::lazy_static;
use vfs::Vfs;

lazy_static! {
    pub static ref VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
}

/// Mount the in-memory filesystem collaborator. There is no on-disk backend
/// in this repo — the block-device-backed file system is an external
/// collaborator this kernel core only calls through [`file`]'s API.
pub fn init() {
    let mut vfs = VFS.lock();

    let ramfs: &'static ramfs::RamFs = &ramfs::RAMFS_INSTANCE;
    vfs.mount("/", ramfs);

    let tmpfs: &'static ramfs::RamFs = &ramfs::TMPFS_INSTANCE;
    vfs.mount("/tmp", tmpfs);

    drop(vfs);
    crate::log_info!("in-memory file system mounted at / (tmpfs at /tmp)");
}
