//! Swap slot bitmap. One global swap space shared by every process's ANON
//! pages, matching the reference kernel's single `swap_table` bitmap rather
//! than a per-process allocation.

use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use super::disk::SECTORS_PER_PAGE;

lazy_static! {
    static ref BITMAP: Mutex<Vec<bool>> = Mutex::new(vec![false; slot_count()]);
}

fn slot_count() -> usize {
    super::disk::SWAP_DISK_SECTORS / SECTORS_PER_PAGE
}

/// Find and claim a free slot. `None` means swap is exhausted, which the
/// caller treats as a panic-worthy condition per the spec's error design —
/// there is no graceful degradation path for swap exhaustion.
pub fn alloc_slot() -> Option<usize> {
    let mut bitmap = BITMAP.lock();
    let slot = bitmap.iter().position(|&used| !used)?;
    bitmap[slot] = true;
    Some(slot)
}

pub fn free_slot(slot: usize) {
    let mut bitmap = BITMAP.lock();
    assert!(bitmap[slot], "swap: double-free of slot {}", slot);
    bitmap[slot] = false;
}

/// Count of currently-occupied slots — used by the swap round-trip test and
/// the "bitmap stays consistent" invariant.
pub fn used_slots() -> usize {
    BITMAP.lock().iter().filter(|&&b| b).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trips() {
        let before = used_slots();
        let slot = alloc_slot().expect("swap space should have room");
        assert_eq!(used_slots(), before + 1);
        free_slot(slot);
        assert_eq!(used_slots(), before);
    }
}
