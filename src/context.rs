//! Per-thread trace context, readable from signal handlers.
//!
//! A two-level table: an array of page pointers sized for the maximum
//! thread id, with zeroed pages installed by CAS on first write and never
//! freed or moved afterwards. The read path takes no locks and allocates
//! nothing; a torn 3-word write is detected by the checksum predicate
//! `span_id ^ root_span_id == checksum`, which guarantees consistency of a
//! snapshot, not freshness.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::event::ContextSnapshot;

/// Thread ids are small integers below this bound (kernel pid ceiling).
pub const DEFAULT_MAX_TID: usize = 1 << 22;

pub const PAGE_SHIFT: usize = 10;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
const PAGE_MASK: usize = PAGE_SIZE - 1;

#[derive(Default)]
pub struct Context {
    span_id: AtomicU64,
    root_span_id: AtomicU64,
    checksum: AtomicU64,
    parallelism: AtomicU32,
}

impl Context {
    /// Writers store the two payload words first and the checksum last; a
    /// reader that interleaves sees a failed checksum and the empty record.
    pub fn set(&self, span_id: u64, root_span_id: u64, parallelism: u32) {
        self.parallelism.store(parallelism, Ordering::Relaxed);
        self.span_id.store(span_id, Ordering::Relaxed);
        self.root_span_id.store(root_span_id, Ordering::Relaxed);
        self.checksum.store(span_id ^ root_span_id, Ordering::Release);
    }

    pub fn clear(&self) {
        self.set(0, 0, 0);
    }

    pub fn snapshot(&self) -> Option<ContextSnapshot> {
        let span_id = self.span_id.load(Ordering::Relaxed);
        let root_span_id = self.root_span_id.load(Ordering::Relaxed);
        let checksum = self.checksum.load(Ordering::Relaxed);
        if span_id ^ root_span_id == checksum {
            Some(ContextSnapshot {
                span_id,
                root_span_id,
                parallelism: self.parallelism.load(Ordering::Relaxed),
            })
        } else {
            None
        }
    }
}

type ContextPage = [Context; PAGE_SIZE];

pub struct Contexts {
    pages: Box<[AtomicPtr<ContextPage>]>,
    max_tid: usize,
    storage_bytes: AtomicUsize,
    storage_pages: AtomicUsize,
}

impl Default for Contexts {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TID)
    }
}

impl Contexts {
    pub fn new(max_tid: usize) -> Self {
        let max_pages = max_tid.div_ceil(PAGE_SIZE);
        let pages = (0..max_pages)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Contexts {
            pages,
            max_tid,
            storage_bytes: AtomicUsize::new(0),
            storage_pages: AtomicUsize::new(0),
        }
    }

    /// Signal-safe: no allocation, no locks. Unknown tids and torn writes
    /// read as the empty context.
    pub fn get(&self, tid: i32) -> ContextSnapshot {
        let tid = tid as usize;
        if tid >= self.max_tid {
            return ContextSnapshot::default();
        }
        let page = self.pages[tid >> PAGE_SHIFT].load(Ordering::Acquire);
        if page.is_null() {
            return ContextSnapshot::default();
        }
        let context = &unsafe { &*page }[tid & PAGE_MASK];
        context.snapshot().unwrap_or_default()
    }

    /// The non-signal write path: installs the page on first use.
    pub fn set(&self, tid: i32, span_id: u64, root_span_id: u64, parallelism: u32) {
        if let Some(context) = self.context_for(tid) {
            context.set(span_id, root_span_id, parallelism);
        }
    }

    pub fn clear(&self, tid: i32) {
        let tid = tid as usize;
        if tid >= self.max_tid {
            return;
        }
        let page = self.pages[tid >> PAGE_SHIFT].load(Ordering::Acquire);
        if !page.is_null() {
            (unsafe { &*page })[tid & PAGE_MASK].clear();
        }
    }

    /// The record backing a tid, installing its page if needed. Returns
    /// `None` only for out-of-range tids.
    pub fn context_for(&self, tid: i32) -> Option<&Context> {
        let tid = tid as usize;
        if tid >= self.max_tid {
            return None;
        }
        let page = self.initialize(tid >> PAGE_SHIFT);
        Some(&page[tid & PAGE_MASK])
    }

    fn initialize(&self, page_index: usize) -> &ContextPage {
        let slot = &self.pages[page_index];
        let mut ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            let fresh: Box<ContextPage> = Box::new(std::array::from_fn(|_| Context::default()));
            let fresh = Box::into_raw(fresh);
            match slot.compare_exchange(
                std::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.storage_bytes
                        .fetch_add(std::mem::size_of::<ContextPage>(), Ordering::Relaxed);
                    self.storage_pages.fetch_add(1, Ordering::Relaxed);
                    ptr = fresh;
                }
                Err(winner) => {
                    // Lost the install race; free the candidate page.
                    drop(unsafe { Box::from_raw(fresh) });
                    ptr = winner;
                }
            }
        }
        unsafe { &*ptr }
    }

    pub fn max_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn storage_bytes(&self) -> usize {
        self.storage_bytes.load(Ordering::Relaxed)
    }

    pub fn storage_pages(&self) -> usize {
        self.storage_pages.load(Ordering::Relaxed)
    }
}

impl Drop for Contexts {
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
    fn test_unset_tid_reads_empty() {
        let contexts = Contexts::new(1 << 16);
        assert_eq!(contexts.get(123), ContextSnapshot::default());
        assert_eq!(contexts.storage_pages(), 0);
    }

    #[test]
    fn test_set_then_get() {
        let contexts = Contexts::new(1 << 16);
        contexts.set(42, 0xAA, 0xBB, 3);
        let snapshot = contexts.get(42);
        assert_eq!(snapshot.span_id, 0xAA);
        assert_eq!(snapshot.root_span_id, 0xBB);
        assert_eq!(snapshot.parallelism, 3);
        assert_eq!(contexts.storage_pages(), 1);
        assert!(contexts.storage_bytes() > 0);
    }

    #[test]
    fn test_torn_write_reads_empty() {
        let contexts = Contexts::new(1 << 16);
        let context = contexts.context_for(7).unwrap();

        // Simulate a writer interrupted before the checksum store: payload
        // words updated, checksum stale.
        context.span_id.store(0xAA, Ordering::Relaxed);
        context.root_span_id.store(0xBB, Ordering::Relaxed);
        assert_eq!(contexts.get(7), ContextSnapshot::default());

        // Checksum lands; the record becomes visible.
        context.checksum.store(0xAA ^ 0xBB, Ordering::Release);
        let snapshot = contexts.get(7);
        assert_eq!((snapshot.span_id, snapshot.root_span_id), (0xAA, 0xBB));
    }

    #[test]
    fn test_clear_reverts_to_empty() {
        let contexts = Contexts::new(1 << 16);
        contexts.set(9, 1, 2, 0);
        contexts.clear(9);
        assert_eq!(contexts.get(9), ContextSnapshot::default());
    }

    #[test]
    fn test_pages_shared_within_range() {
        let contexts = Contexts::new(PAGE_SIZE * 2);
        contexts.set(0, 1, 1, 0);
        contexts.set(PAGE_SIZE as i32 - 1, 2, 2, 0);
        assert_eq!(contexts.storage_pages(), 1);
        contexts.set(PAGE_SIZE as i32, 3, 3, 0);
        assert_eq!(contexts.storage_pages(), 2);
    }

    #[test]
    fn test_out_of_range_tid() {
        let contexts = Contexts::new(1024);
        contexts.set(5000, 1, 2, 0);
        assert_eq!(contexts.get(5000), ContextSnapshot::default());
        assert!(contexts.context_for(5000).is_none());
    }

    #[test]
    fn test_max_pages_rounding() {
        assert_eq!(Contexts::new(1).max_pages(), 1);
        assert_eq!(Contexts::new(PAGE_SIZE).max_pages(), 1);
        assert_eq!(Contexts::new(PAGE_SIZE + 1).max_pages(), 2);
    }
}
