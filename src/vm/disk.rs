//! In-memory stand-in for the block device backing swap. The real kernel's
//! `disk_read`/`disk_write`/`disk_size` API (§6) is implemented here over a
//! boxed byte array rather than an ATA/IDE driver, which is explicitly out
//! of scope for this repo.

use alloc::boxed::Box;
use alloc::vec;
use lazy_static::lazy_static;
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: usize = 8; // PGSIZE (4096) / SECTOR_SIZE
/// 16 MiB of swap — enough to back a few dozen evicted pages under test.
pub const SWAP_DISK_SECTORS: usize = (16 * 1024 * 1024) / SECTOR_SIZE;

pub struct SwapDisk {
    sectors: Mutex<Box<[u8]>>,
}

impl SwapDisk {
    fn new() -> SwapDisk {
        SwapDisk { sectors: Mutex::new(vec![0u8; SWAP_DISK_SECTORS * SECTOR_SIZE].into_boxed_slice()) }
    }

    pub fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        let disk = self.sectors.lock();
        let start = sector * SECTOR_SIZE;
        buf.copy_from_slice(&disk[start..start + SECTOR_SIZE]);
    }

    pub fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        let mut disk = self.sectors.lock();
        let start = sector * SECTOR_SIZE;
        disk[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }

    /// Read the full page backing swap `slot` into `dst` (must be PGSIZE).
    pub fn read_page(&self, slot: usize, dst: &mut [u8]) {
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            self.read_sector(slot * SECTORS_PER_PAGE + i, &mut sector);
            dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
    }

    /// Write a full page (PGSIZE bytes) to swap `slot`.
    pub fn write_page(&self, slot: usize, src: &[u8]) {
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&src[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.write_sector(slot * SECTORS_PER_PAGE + i, &sector);
        }
    }
}

lazy_static! {
    static ref SWAP_DISK: SwapDisk = SwapDisk::new();
}

pub fn swap_disk() -> &'static SwapDisk {
    &SWAP_DISK
}
