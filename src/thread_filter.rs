//! Concurrent set of small thread ids.
//!
//! A lazily allocated two-level bitmap: the recorder adds every tid it sees
//! an event for (from signal context, so only atomic bitmap stores), and the
//! constant-pool writer collects the set at chunk close. Pages install via
//! CAS and are never freed.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::context::DEFAULT_MAX_TID;

/// Bits per page; 8 KiB of tid space per 1 KiB page.
const PAGE_BITS: usize = 8192;
const WORDS_PER_PAGE: usize = PAGE_BITS / 64;

type Page = [AtomicU64; WORDS_PER_PAGE];

pub struct ThreadFilter {
    pages: Box<[AtomicPtr<Page>]>,
    max_tid: usize,
}

impl Default for ThreadFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TID)
    }
}

impl ThreadFilter {
    pub fn new(max_tid: usize) -> Self {
        let num_pages = max_tid.div_ceil(PAGE_BITS);
        let pages = (0..num_pages)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        ThreadFilter { pages, max_tid }
    }

    fn page(&self, page_index: usize, install: bool) -> Option<&Page> {
        let slot = &self.pages[page_index];
        let mut ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            if !install {
                return None;
            }
            let fresh: Box<Page> = Box::new(std::array::from_fn(|_| AtomicU64::new(0)));
            let fresh = Box::into_raw(fresh);
            match slot.compare_exchange(
                std::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => ptr = fresh,
                Err(winner) => {
                    // Lost the race; free our candidate.
                    drop(unsafe { Box::from_raw(fresh) });
                    ptr = winner;
                }
            }
        }
        Some(unsafe { &*ptr })
    }

    pub fn add(&self, tid: i32) {
        let tid = tid as usize;
        if tid >= self.max_tid {
            return;
        }
        let page = self.page(tid / PAGE_BITS, true).unwrap();
        let bit = tid % PAGE_BITS;
        page[bit / 64].fetch_or(1 << (bit % 64), Ordering::Relaxed);
    }

    pub fn accept(&self, tid: i32) -> bool {
        let tid = tid as usize;
        if tid >= self.max_tid {
            return false;
        }
        match self.page(tid / PAGE_BITS, false) {
            Some(page) => {
                let bit = tid % PAGE_BITS;
                page[bit / 64].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
            }
            None => false,
        }
    }

    pub fn collect(&self, out: &mut Vec<i32>) {
        for (page_index, slot) in self.pages.iter().enumerate() {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let page = unsafe { &*ptr };
            for (word_index, word) in page.iter().enumerate() {
                let mut bits = word.load(Ordering::Relaxed);
                while bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    out.push((page_index * PAGE_BITS + word_index * 64 + bit) as i32);
                    bits &= bits - 1;
                }
            }
        }
    }

    pub fn clear(&self) {
        for slot in self.pages.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                for word in unsafe { &*ptr }.iter() {
                    word.store(0, Ordering::Relaxed);
                }
            }
        }
    }
}

impl Drop for ThreadFilter {
    fn drop(&mut self) {
        for slot in self.pages.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accept_collect() {
        let filter = ThreadFilter::new(1 << 16);
        assert!(!filter.accept(42));
        filter.add(42);
        filter.add(9000);
        filter.add(42);
        assert!(filter.accept(42));
        assert!(filter.accept(9000));
        assert!(!filter.accept(43));

        let mut tids = Vec::new();
        filter.collect(&mut tids);
        assert_eq!(tids, vec![42, 9000]);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let filter = ThreadFilter::new(1024);
        filter.add(4096);
        assert!(!filter.accept(4096));
        let mut tids = Vec::new();
        filter.collect(&mut tids);
        assert!(tids.is_empty());
    }

    #[test]
    fn test_clear() {
        let filter = ThreadFilter::new(1 << 16);
        filter.add(7);
        filter.clear();
        assert!(!filter.accept(7));
    }
}
