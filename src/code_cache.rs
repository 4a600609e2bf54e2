//! Per-library symbol tables and the process-wide library registry.
//!
//! A `CodeCache` owns the sorted `[start, end)` spans of one native
//! library and answers PC→name lookups from the sampling signal handler.
//! Mutation (add/sort) happens only while a library is being parsed, before
//! the cache is published; lookups afterwards touch nothing but immutable
//! blob storage, which is what makes them signal-safe.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

pub const INITIAL_CODE_CACHE_CAPACITY: usize = 1000;
pub const MAX_NATIVE_LIBS: usize = 2048;

pub const NO_MIN_ADDRESS: u64 = u64::MAX;
pub const NO_MAX_ADDRESS: u64 = 0;

/// Native frames travel through the event pipeline as packed handles
/// rather than name pointers: bit 63 tags the handle, bits 32..48 hold the
/// library index, bits 0..32 the blob index (or [`FALLBACK_BLOB`] when the
/// PC resolved only to the library itself).
pub const NATIVE_HANDLE_BIT: u64 = 1 << 63;
pub const FALLBACK_BLOB: u32 = u32::MAX;

pub fn pack_native_handle(lib_index: u16, blob_index: u32) -> u64 {
    NATIVE_HANDLE_BIT | (lib_index as u64) << 32 | blob_index as u64
}

pub fn is_native_handle(method_id: u64) -> bool {
    method_id & NATIVE_HANDLE_BIT != 0
}

pub fn unpack_native_handle(method_id: u64) -> (u16, u32) {
    ((method_id >> 32) as u16, method_id as u32)
}

/// Unwind info for one code location, addressed by offset from the
/// library's text base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    pub loc: u32,
    pub cfa: u32,
    pub fp_off: i32,
}

struct NativeFunc {
    name: Box<str>,
    mark: AtomicBool,
}

pub struct CodeBlob {
    pub start: u64,
    pub end: u64,
    func: NativeFunc,
}

impl CodeBlob {
    pub fn name(&self) -> &str {
        &self.func.name
    }
}

struct GotRange {
    start: usize,
    end: usize,
    patchable: AtomicBool,
}

pub struct CodeCache {
    name: String,
    lib_index: i16,
    min_address: u64,
    max_address: u64,
    text_base: u64,
    got: Option<GotRange>,
    dwarf_table: Vec<FrameDesc>,
    blobs: Vec<CodeBlob>,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if (c as u32) < 0x20 { '?' } else { c })
        .collect()
}

impl CodeCache {
    pub fn new(name: &str, lib_index: i16) -> Self {
        Self::with_bounds(name, lib_index, NO_MIN_ADDRESS, NO_MAX_ADDRESS)
    }

    pub fn with_bounds(name: &str, lib_index: i16, min_address: u64, max_address: u64) -> Self {
        CodeCache {
            name: sanitize(name),
            lib_index,
            min_address,
            max_address,
            text_base: 0,
            got: None,
            dwarf_table: Vec::new(),
            blobs: Vec::with_capacity(INITIAL_CODE_CACHE_CAPACITY),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lib_index(&self) -> i16 {
        self.lib_index
    }

    pub fn min_address(&self) -> u64 {
        self.min_address
    }

    pub fn max_address(&self) -> u64 {
        self.max_address
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.min_address && address < self.max_address
    }

    pub fn set_text_base(&mut self, text_base: u64) {
        self.text_base = text_base;
    }

    pub fn add(&mut self, start: u64, length: usize, name: &str, update_bounds: bool) {
        let end = start + length as u64;
        self.blobs.push(CodeBlob {
            start,
            end,
            func: NativeFunc {
                name: sanitize(name).into_boxed_str(),
                mark: AtomicBool::new(false),
            },
        });
        if update_bounds {
            self.update_bounds(start, end);
        }
    }

    pub fn update_bounds(&mut self, start: u64, end: u64) {
        if start < self.min_address {
            self.min_address = start;
        }
        if end > self.max_address {
            self.max_address = end;
        }
    }

    /// Order blobs by start ascending, longer extent first on ties, so a
    /// nested or zero-length entry resolves to its enclosing symbol.
    pub fn sort(&mut self) {
        if self.blobs.is_empty() {
            return;
        }

        self.blobs
            .sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        if self.min_address == NO_MIN_ADDRESS {
            self.min_address = self.blobs[0].start;
        }
        if self.max_address == NO_MAX_ADDRESS {
            self.max_address = self.blobs[self.blobs.len() - 1].end;
        }
    }

    pub fn mark(&self, predicate: impl Fn(&str) -> bool) {
        for blob in &self.blobs {
            if predicate(&blob.func.name) {
                blob.func.mark.store(true, Ordering::Relaxed);
            }
        }
    }

    pub fn is_marked(&self, blob_index: u32) -> bool {
        self.blobs
            .get(blob_index as usize)
            .map(|blob| blob.func.mark.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Resolve a PC to the index of the blob whose half-open range contains
    /// it. A miss still resolves to the preceding blob when that blob has
    /// zero size (assembly entry points, kernel code) or ends exactly at
    /// the address (return address beyond the function); otherwise the
    /// library itself is the answer.
    pub fn binary_search_index(&self, address: u64) -> u32 {
        let mut low: i64 = 0;
        let mut high: i64 = self.blobs.len() as i64 - 1;

        while low <= high {
            let mid = ((low + high) >> 1) as usize;
            if self.blobs[mid].end <= address {
                low = mid as i64 + 1;
            } else if self.blobs[mid].start > address {
                high = mid as i64 - 1;
            } else {
                return mid as u32;
            }
        }

        if low > 0 {
            let prev = &self.blobs[low as usize - 1];
            if prev.start == prev.end || prev.end == address {
                return low as u32 - 1;
            }
        }
        FALLBACK_BLOB
    }

    /// PC→name; never fails, the library name is the fallback.
    pub fn binary_search(&self, address: u64) -> &str {
        self.blob_name(self.binary_search_index(address))
    }

    pub fn blob_name(&self, blob_index: u32) -> &str {
        match self.blobs.get(blob_index as usize) {
            Some(blob) => &blob.func.name,
            None => &self.name,
        }
    }

    /// Linear scan; only used on the slow paths (symbol discovery).
    pub fn find(&self, address: u64) -> Option<&CodeBlob> {
        self.blobs
            .iter()
            .find(|blob| address >= blob.start && address < blob.end)
    }

    pub fn find_symbol(&self, name: &str) -> Option<u64> {
        self.blobs
            .iter()
            .find(|blob| &*blob.func.name == name)
            .map(|blob| blob.start)
    }

    pub fn find_symbol_by_prefix(&self, prefix: &str) -> Option<u64> {
        self.blobs
            .iter()
            .find(|blob| blob.func.name.starts_with(prefix))
            .map(|blob| blob.start)
    }

    pub fn set_global_offset_table(&mut self, start: usize, end: usize, patchable: bool) {
        self.got = Some(GotRange {
            start,
            end,
            patchable: AtomicBool::new(patchable),
        });
    }

    /// Scan the GOT for a slot currently pointing at `address`. The first
    /// hit makes the table's pages writable so the caller can patch the
    /// slot, and remembers that it did.
    pub fn find_global_offset_entry(&self, address: usize) -> Option<*mut usize> {
        let got = self.got.as_ref()?;
        let mut entry = got.start;
        while entry < got.end {
            // Safety: the GOT range was supplied by the library parser and
            // stays mapped for as long as the library is loaded.
            if unsafe { *(entry as *const usize) } == address {
                self.make_got_patchable(got);
                return Some(entry as *mut usize);
            }
            entry += std::mem::size_of::<usize>();
        }
        None
    }

    fn make_got_patchable(&self, got: &GotRange) {
        if !got.patchable.swap(true, Ordering::Relaxed) {
            let page_mask = crate::os::page_size() - 1;
            let start = got.start & !page_mask;
            let size = (got.end - start + page_mask) & !page_mask;
            unsafe {
                libc::mprotect(
                    start as *mut libc::c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                );
            }
        }
    }

    pub fn set_dwarf_table(&mut self, table: Vec<FrameDesc>) {
        self.dwarf_table = table;
    }

    /// Binary search the unwind table by offset from the text base; an
    /// inexact match returns the entry with the largest `loc` not above
    /// the target.
    pub fn find_frame_desc(&self, pc: u64) -> Option<&FrameDesc> {
        let target_loc = pc.wrapping_sub(self.text_base) as u32;
        let mut low: i64 = 0;
        let mut high: i64 = self.dwarf_table.len() as i64 - 1;

        while low <= high {
            let mid = ((low + high) >> 1) as usize;
            if self.dwarf_table[mid].loc < target_loc {
                low = mid as i64 + 1;
            } else if self.dwarf_table[mid].loc > target_loc {
                high = mid as i64 - 1;
            } else {
                return Some(&self.dwarf_table[mid]);
            }
        }

        if low > 0 {
            Some(&self.dwarf_table[low as usize - 1])
        } else {
            None
        }
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.blobs.capacity() * std::mem::size_of::<CodeBlob>()
            + self
                .blobs
                .iter()
                .map(|blob| blob.func.name.len())
                .sum::<usize>()
    }
}

// GOT addresses are plain numbers until dereferenced under the documented
// library-lifetime contract.
unsafe impl Send for CodeCache {}
unsafe impl Sync for CodeCache {}

/// Append-only registry of every loaded library. Writers are serialized by
/// the library parser; readers (including signal handlers) see an
/// acquire-loaded count that never exceeds the published entries.
pub struct CodeCacheArray {
    caches: Box<[AtomicPtr<CodeCache>]>,
    count: AtomicUsize,
}

impl Default for CodeCacheArray {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCacheArray {
    pub fn new() -> Self {
        let caches = (0..MAX_NATIVE_LIBS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        CodeCacheArray {
            caches,
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Publish a fully built cache; returns its library index.
    pub fn add(&self, cache: CodeCache) -> usize {
        let index = self.count.load(Ordering::Acquire);
        assert!(index < MAX_NATIVE_LIBS, "native library registry full");
        self.caches[index].store(Box::into_raw(Box::new(cache)), Ordering::Relaxed);
        self.count.store(index + 1, Ordering::Release);
        index
    }

    pub fn get(&self, index: usize) -> Option<&CodeCache> {
        if index >= self.count() {
            return None;
        }
        let ptr = self.caches[index].load(Ordering::Relaxed);
        // Safety: published entries are never removed or replaced.
        Some(unsafe { &*ptr })
    }

    /// Find the library whose published bounds contain the address.
    pub fn find_by_address(&self, address: u64) -> Option<&CodeCache> {
        (0..self.count())
            .filter_map(|i| self.get(i))
            .find(|cache| cache.contains(address))
    }

    pub fn memory_usage(&self) -> usize {
        (0..self.count())
            .filter_map(|i| self.get(i))
            .map(|cache| cache.memory_usage())
            .sum()
    }
}

impl Drop for CodeCacheArray {
    fn drop(&mut self) {
        for i in 0..self.count() {
            let ptr = self.caches[i].load(Ordering::Relaxed);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(blobs: &[(u64, u64, &str)]) -> CodeCache {
        let mut cache = CodeCache::new("libtest.so", 0);
        for (start, end, name) in blobs {
            cache.add(*start, (*end - *start) as usize, name, false);
        }
        cache.sort();
        cache
    }

    #[test]
    fn test_lookup_adjacent_blobs() {
        let cache = cache_with(&[(0x1000, 0x1100, "foo"), (0x1100, 0x1200, "bar")]);
        assert_eq!(cache.binary_search(0x10ff), "foo");
        assert_eq!(cache.binary_search(0x1100), "bar");
        // 0x1200 is bar's end: the return-address rule still names bar.
        // Callers gate on contains() first, which excludes max_address.
        assert_eq!(cache.binary_search(0x1200), "bar");
        assert!(!cache.contains(0x1200));
        assert_eq!(cache.binary_search(0x1201), "libtest.so");
        assert_eq!(cache.binary_search(0x0fff), "libtest.so");
    }

    #[test]
    fn test_zero_length_tie_break() {
        let cache = cache_with(&[(0x2000, 0x2000, "entry"), (0x2000, 0x2100, "enclosing")]);
        // Longer extent sorts first, so the enclosing symbol wins.
        assert_eq!(cache.binary_search(0x2000), "enclosing");
        assert_eq!(cache.binary_search(0x20ff), "enclosing");
    }

    #[test]
    fn test_zero_length_blob_is_valid_target() {
        let cache = cache_with(&[(0x3000, 0x3000, "asm_entry")]);
        assert_eq!(cache.binary_search(0x3000), "asm_entry");
        assert_eq!(cache.binary_search(0x3abc), "asm_entry");
    }

    #[test]
    fn test_return_address_beyond_function() {
        let cache = cache_with(&[(0x4000, 0x4080, "looping")]);
        assert_eq!(cache.binary_search(0x4080), "looping");
        assert_eq!(cache.binary_search(0x4081), "libtest.so");
    }

    #[test]
    fn test_empty_cache_falls_back_to_name() {
        let cache = cache_with(&[]);
        assert_eq!(cache.binary_search(0xdead), "libtest.so");
    }

    #[test]
    fn test_sort_sets_sentinel_bounds() {
        let cache = cache_with(&[(0x1000, 0x1100, "a"), (0x2000, 0x2200, "b")]);
        assert_eq!(cache.min_address(), 0x1000);
        assert_eq!(cache.max_address(), 0x2200);
        assert!(cache.contains(0x1500));
        assert!(!cache.contains(0x2200));
    }

    #[test]
    fn test_explicit_bounds_not_overridden() {
        let mut cache = CodeCache::with_bounds("lib", 0, 0x500, 0x5000);
        cache.add(0x1000, 0x100, "f", false);
        cache.sort();
        assert_eq!(cache.min_address(), 0x500);
        assert_eq!(cache.max_address(), 0x5000);
    }

    #[test]
    fn test_update_bounds_on_add() {
        let mut cache = cache_with(&[]);
        cache.add(0x9000, 0x100, "f", true);
        assert_eq!(cache.min_address(), 0x9000);
        assert_eq!(cache.max_address(), 0x9100);
    }

    #[test]
    fn test_name_sanitized() {
        let mut cache = CodeCache::new("lib", 0);
        cache.add(0x1000, 0x10, "bad\x01name\n", false);
        cache.sort();
        assert_eq!(cache.binary_search(0x1000), "bad?name?");
    }

    #[test]
    fn test_find_symbol_and_prefix() {
        let cache = cache_with(&[(0x1000, 0x1100, "read_bytes"), (0x1100, 0x1200, "write_bytes")]);
        assert_eq!(cache.find_symbol("write_bytes"), Some(0x1100));
        assert_eq!(cache.find_symbol("absent"), None);
        assert_eq!(cache.find_symbol_by_prefix("read_"), Some(0x1000));
    }

    #[test]
    fn test_mark_predicate() {
        let cache = cache_with(&[(0x1000, 0x1100, "std_alloc"), (0x1100, 0x1200, "user_fn")]);
        cache.mark(|name| name.starts_with("std_"));
        let std_idx = cache.binary_search_index(0x1000);
        let user_idx = cache.binary_search_index(0x1100);
        assert!(cache.is_marked(std_idx));
        assert!(!cache.is_marked(user_idx));
    }

    #[test]
    fn test_frame_desc_inexact_match() {
        let mut cache = CodeCache::new("lib", 0);
        cache.set_text_base(0x1000);
        cache.set_dwarf_table(vec![
            FrameDesc { loc: 0x10, cfa: 8, fp_off: -8 },
            FrameDesc { loc: 0x50, cfa: 16, fp_off: -16 },
            FrameDesc { loc: 0x90, cfa: 8, fp_off: -8 },
        ]);
        assert_eq!(cache.find_frame_desc(0x1050).unwrap().loc, 0x50);
        assert_eq!(cache.find_frame_desc(0x1060).unwrap().loc, 0x50);
        assert_eq!(cache.find_frame_desc(0x10ff).unwrap().loc, 0x90);
        assert!(cache.find_frame_desc(0x1000).is_none());
    }

    #[test]
    fn test_got_entry_scan() {
        let mut cache = CodeCache::new("lib", 0);
        let slots: Box<[usize]> = vec![0x11, 0x22, 0x33].into_boxed_slice();
        let start = slots.as_ptr() as usize;
        let end = start + slots.len() * std::mem::size_of::<usize>();
        cache.set_global_offset_table(start, end, true);

        let entry = cache.find_global_offset_entry(0x22).unwrap();
        assert_eq!(entry as usize, start + std::mem::size_of::<usize>());
        assert!(cache.find_global_offset_entry(0x44).is_none());
    }

    #[test]
    fn test_registry_is_append_only() {
        let array = CodeCacheArray::new();
        assert_eq!(array.count(), 0);
        let a = array.add(cache_with(&[(0x1000, 0x1100, "a")]));
        let b = array.add(cache_with(&[(0x2000, 0x2100, "b")]));
        assert_eq!((a, b), (0, 1));
        assert_eq!(array.count(), 2);
        assert_eq!(array.get(0).unwrap().binary_search(0x1000), "a");
        assert!(array.get(2).is_none());
        assert_eq!(array.find_by_address(0x2050).unwrap().name(), "libtest.so");
        assert!(array.memory_usage() > 0);
    }

    #[test]
    fn test_native_handle_packing() {
        let handle = pack_native_handle(7, 123);
        assert!(is_native_handle(handle));
        assert_eq!(unpack_native_handle(handle), (7, 123));
        assert!(!is_native_handle(0x7f00_0000));
    }
}
