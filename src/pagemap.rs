//! 3-level radix tree mapping page IDs to `Span` pointers.
//!
//! This backs `PageCache`'s `spanMap`: a base address always resolves to its
//! owning span in O(1), without a heap-allocating map (which would recurse
//! back into this crate if it were ever installed as the global allocator).
//!
//! For 48-bit virtual addresses with a 12-bit page shift, page IDs are 36
//! bits wide, split root/mid/leaf 12/12/12. The root is statically
//! allocated; mid and leaf nodes are lazily allocated from the OS. Reads
//! are lock-free (`AtomicPtr` with `Acquire`); writes must happen under the
//! page heap's lock.

use crate::config::PAGE_SIZE;
use crate::platform;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 12;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// Lock-free-read radix tree from page ID to the owning `Span`.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: a null AtomicPtr<T> has the same bit pattern as zeroed memory.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
        }
    }

    /// Look up the span owning `page_id`. Returns null if unregistered.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }
        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }
        unsafe { (*leaf).spans[leaf_idx].load(Ordering::Acquire) }
    }

    /// Set the span entry for `page_id`.
    ///
    /// # Safety
    /// Must be called under the page heap's lock.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        assert!(root_idx < ROOT_LEN, "page_id out of range for page map");

        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = unsafe { Self::alloc_mid_node() };
            assert!(!mid.is_null(), "failed to allocate page map mid node");
            self.root[root_idx].store(mid, Ordering::Release);
        }

        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            leaf = unsafe { Self::alloc_leaf_node() };
            assert!(!leaf.is_null(), "failed to allocate page map leaf node");
            unsafe { (*mid).children[mid_idx].store(leaf, Ordering::Release) };
        }

        unsafe { (*leaf).spans[leaf_idx].store(span, Ordering::Release) };
    }

    /// Register only the first and last page of `span`.
    ///
    /// Forward coalescing only ever probes the page right after a span's
    /// end, so free spans only need their endpoints registered — O(1)
    /// instead of O(numPages).
    ///
    /// # Safety
    /// Must be called under the page heap's lock.
    pub unsafe fn register_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).page_addr } >> crate::config::PAGE_SHIFT;
        let count = unsafe { (*span).num_pages };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    unsafe fn alloc_mid_node() -> *mut MidNode {
        let size = core::mem::size_of::<MidNode>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        unsafe { platform::page_alloc(alloc_size) }.cast::<MidNode>()
    }

    unsafe fn alloc_leaf_node() -> *mut LeafNode {
        let size = core::mem::size_of::<LeafNode>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        unsafe { platform::page_alloc(alloc_size) }.cast::<LeafNode>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span;

    #[test]
    fn get_on_empty_map_is_null() {
        let map = PageMap::new();
        assert!(map.get(0).is_null());
        assert!(map.get(123_456).is_null());
    }

    #[test]
    fn set_then_get_roundtrips() {
        let map = PageMap::new();
        let s = span::alloc_span();
        unsafe {
            (*s).page_addr = 42 * PAGE_SIZE;
            map.set(42, s);
            assert_eq!(map.get(42), s);
            assert!(map.get(41).is_null());
            map.set(42, ptr::null_mut());
            assert!(map.get(42).is_null());
            span::dealloc_span(s);
        }
    }

    #[test]
    fn endpoints_cover_first_and_last_page_only() {
        let map = PageMap::new();
        let s = span::alloc_span();
        unsafe {
            (*s).page_addr = 100 * PAGE_SIZE;
            (*s).num_pages = 5;
            map.register_endpoints(s);
            assert_eq!(map.get(100), s);
            assert_eq!(map.get(104), s);
            assert!(map.get(102).is_null());
            span::dealloc_span(s);
        }
    }

    #[test]
    fn high_page_id_exercises_all_levels() {
        let map = PageMap::new();
        let s = span::alloc_span();
        unsafe {
            let page_id = (1usize << 20) + (1 << 14) + 42;
            (*s).page_addr = page_id * PAGE_SIZE;
            map.set(page_id, s);
            assert_eq!(map.get(page_id), s);
            assert!(map.get(page_id - 1).is_null());
            span::dealloc_span(s);
        }
    }
}
