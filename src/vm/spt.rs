//! Supplemental page table: per-process map from page-aligned virtual
//! address to [`Page`](super::page::Page). Lookups always round down to the
//! page boundary, matching `vm/vm.c`'s `spt_find_page`.

use alloc::collections::BTreeMap;

use crate::memory::paging::page_floor;

use super::page::{AfterInit, Page};

pub struct SupplementalPageTable {
    pages: BTreeMap<u64, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        SupplementalPageTable { pages: BTreeMap::new() }
    }

    pub fn alloc_uninit(&mut self, va: u64, writable: bool, after_init: AfterInit) -> bool {
        let va = page_floor(va);
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, Page::new_uninit(va, writable, after_init));
        true
    }

    pub fn alloc_anon(&mut self, va: u64, writable: bool) -> bool {
        let va = page_floor(va);
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, Page::new_anon(va, writable));
        true
    }

    pub fn get(&self, va: u64) -> Option<&Page> {
        self.pages.get(&page_floor(va))
    }

    pub fn get_mut(&mut self, va: u64) -> Option<&mut Page> {
        self.pages.get_mut(&page_floor(va))
    }

    pub fn remove(&mut self, va: u64) -> Option<Page> {
        self.pages.remove(&page_floor(va))
    }

    pub fn contains(&self, va: u64) -> bool {
        self.pages.contains_key(&page_floor(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Page)> {
        self.pages.iter()
    }

    /// All resident pages' addresses, for teardown/eviction bookkeeping.
    pub fn resident_addrs(&self) -> alloc::vec::Vec<u64> {
        self.pages.iter().filter(|(_, p)| p.is_resident()).map(|(&va, _)| va).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_rounds_down_to_page_boundary() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.alloc_anon(0x1000, true));
        assert!(spt.get(0x1000).is_some());
        assert!(spt.get(0x1abc).is_some());
        assert!(spt.get(0x2000).is_none());
    }

    #[test]
    fn double_alloc_at_same_page_fails() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.alloc_anon(0x1000, true));
        assert!(!spt.alloc_anon(0x1000, false));
    }
}
