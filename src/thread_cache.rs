//! `ThreadCache`: the fast, lock-free top tier. Every OS thread gets its
//! own array of per-size-class free lists; allocation and deallocation
//! never touch a lock unless the local cache has to talk to the shared
//! `CentralCache`.
//!
//! The backing storage for a thread's cache is itself obtained straight
//! from the platform page allocator rather than through this crate's own
//! `allocate`, since this crate may be installed as the global allocator
//! and recursing back into it while setting up a thread's state would
//! deadlock or blow the stack.

use crate::central_free_list::CENTRAL_CACHE;
use crate::config::RETENTION_THRESHOLD;
use crate::intrusive::{block_next, chain_tail, set_block_next};
use crate::platform;
use crate::size_class::NUM_CLASSES;
use core::cmp;
use core::mem::size_of;
use core::ptr;

struct ThreadCacheInner {
    lists: [*mut u8; NUM_CLASSES],
    lens: [usize; NUM_CLASSES],
}

unsafe impl Send for ThreadCacheInner {}

impl ThreadCacheInner {
    fn drain_all(&mut self) {
        for class_idx in 0..NUM_CLASSES {
            if self.lens[class_idx] == 0 {
                continue;
            }
            let head = self.lists[class_idx];
            let (tail, count) = unsafe { chain_tail(head) };
            debug_assert_eq!(count, self.lens[class_idx]);
            unsafe { CENTRAL_CACHE.return_range(class_idx, head, tail, count) };
            self.lists[class_idx] = ptr::null_mut();
            self.lens[class_idx] = 0;
        }
    }
}

fn alloc_backing() -> *mut ThreadCacheInner {
    let bytes = size_of::<ThreadCacheInner>();
    let pages = (bytes + crate::config::PAGE_SIZE - 1) / crate::config::PAGE_SIZE;
    let raw = unsafe { platform::page_alloc(pages * crate::config::PAGE_SIZE) };
    // `page_alloc` zero-fills, which is exactly a valid ThreadCacheInner:
    // every list head null, every length zero.
    raw.cast::<ThreadCacheInner>()
}

fn dealloc_backing(ptr: *mut ThreadCacheInner) {
    let bytes = size_of::<ThreadCacheInner>();
    let pages = (bytes + crate::config::PAGE_SIZE - 1) / crate::config::PAGE_SIZE;
    unsafe { platform::page_dealloc(ptr.cast::<u8>(), pages * crate::config::PAGE_SIZE) };
}

#[cfg(feature = "std")]
mod tls {
    use super::*;
    use core::cell::Cell;

    struct ThreadCacheHandle(Cell<*mut ThreadCacheInner>);

    impl Drop for ThreadCacheHandle {
        fn drop(&mut self) {
            let ptr = self.0.get();
            if !ptr.is_null() {
                unsafe { (*ptr).drain_all() };
                dealloc_backing(ptr);
            }
        }
    }

    std::thread_local! {
        static TC: ThreadCacheHandle = ThreadCacheHandle(Cell::new(ptr::null_mut()));
    }

    pub fn with<R>(f: impl FnOnce(&mut ThreadCacheInner) -> R) -> R {
        TC.with(|handle| {
            let mut ptr = handle.0.get();
            if ptr.is_null() {
                ptr = alloc_backing();
                handle.0.set(ptr);
            }
            f(unsafe { &mut *ptr })
        })
    }
}

/// Without `std` there is no portable way to get per-thread storage short
/// of nightly `#[thread_local]` statics, which this crate doesn't rely on.
/// Allocation falls back to going straight to the central cache, trading
/// the thread-local fast path for correctness under plain `core`.
#[cfg(not(feature = "std"))]
mod tls {
    use super::*;
    use crate::sync::SpinMutex;

    // Stored as a `usize` rather than a raw pointer so `SpinMutex`'s blanket
    // `T: Send` bound is satisfied without an extra unsafe impl.
    static SHARED: SpinMutex<usize> = SpinMutex::new(0);

    pub fn with<R>(f: impl FnOnce(&mut ThreadCacheInner) -> R) -> R {
        let mut guard = SHARED.lock();
        if *guard == 0 {
            *guard = alloc_backing() as usize;
        }
        let ptr = *guard as *mut ThreadCacheInner;
        f(unsafe { &mut *ptr })
    }
}

/// Allocate one block of `class_idx`. Serves straight from the thread's
/// local list when it has one; otherwise fetches exactly one block from the
/// central cache and hands it back without ever touching the local list.
/// Null means OOM.
pub fn allocate(class_idx: usize) -> *mut u8 {
    tls::with(|tc| {
        if !tc.lists[class_idx].is_null() {
            crate::stat_inc!(thread_cache_hits);
            let block = tc.lists[class_idx];
            tc.lists[class_idx] = unsafe { block_next(block) };
            tc.lens[class_idx] -= 1;
            return block;
        }

        crate::stat_inc!(thread_cache_misses);
        CENTRAL_CACHE.fetch_range(class_idx)
    })
}

/// Return one block of `class_idx` to the thread's local list, draining a
/// quarter of it to the central cache once the list grows past
/// `RETENTION_THRESHOLD`.
pub fn deallocate(class_idx: usize, block: *mut u8) {
    tls::with(|tc| {
        unsafe { set_block_next(block, tc.lists[class_idx]) };
        tc.lists[class_idx] = block;
        tc.lens[class_idx] += 1;

        if tc.lens[class_idx] > RETENTION_THRESHOLD {
            let keep = cmp::max(tc.lens[class_idx] / 4, 1);
            let mut cur = tc.lists[class_idx];
            for _ in 1..keep {
                cur = unsafe { block_next(cur) };
            }
            let return_head = unsafe { block_next(cur) };
            unsafe { set_block_next(cur, ptr::null_mut()) };

            if !return_head.is_null() {
                let (return_tail, return_count) = unsafe { chain_tail(return_head) };
                unsafe {
                    CENTRAL_CACHE.return_range(class_idx, return_head, return_tail, return_count)
                };
            }
            tc.lens[class_idx] = keep;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_deallocate_reuses_the_block() {
        let a = allocate(5);
        assert!(!a.is_null());
        deallocate(5, a);
        let b = allocate(5);
        assert_eq!(a, b);
        deallocate(5, b);
    }

    #[test]
    fn classes_do_not_share_blocks() {
        let a = allocate(1);
        let b = allocate(2);
        assert_ne!(a, b);
        deallocate(1, a);
        deallocate(2, b);
    }

    #[test]
    fn draining_past_the_retention_threshold_keeps_allocation_working() {
        let class_idx = 3;
        let mut blocks = alloc::vec::Vec::new();
        for _ in 0..(RETENTION_THRESHOLD + 16) {
            blocks.push(allocate(class_idx));
        }
        for b in blocks.drain(..) {
            deallocate(class_idx, b);
        }
        // The drain above should have pushed a quarter of the list back to
        // the central cache; the thread cache must still serve allocations.
        let again = allocate(class_idx);
        assert!(!again.is_null());
        deallocate(class_idx, again);
    }
}
