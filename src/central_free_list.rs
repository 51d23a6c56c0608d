//! `CentralCache`: the middle tier shared by every thread.
//!
//! Each size class gets its own spin-locked flat free list of blocks
//! (`centralFreeList_`/`locks_` in the source design). A single, bounded
//! table of span trackers (`spanTrackers_`) records, per span handed out to
//! a class, how many of its blocks are currently free — when a span's
//! blocks are all back, the span itself returns to `PageCache`.
//!
//! Returning a span on every single free would thrash `PageCache`, so
//! returns are delayed: a class is only swept for fully-free spans once it
//! has accumulated `MAX_DELAY_COUNT` returns, or once `DELAY_INTERVAL_MS`
//! has passed since its last sweep, whichever comes first.

use crate::config::{DELAY_INTERVAL_MS, MAX_DELAY_COUNT, PAGE_SIZE, SPAN_PAGES, SPAN_TABLE_CAP};
use crate::intrusive::{block_next, set_block_next};
use crate::page_heap::PAGE_CACHE;
use crate::size_class::{self, NUM_CLASSES};
use crate::span::Span;
use crate::sync::SpinMutex;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "std")]
fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Without `std` there is no clock in `core`; a logical tick stands in so
/// the count-based and time-based triggers still both eventually fire.
#[cfg(not(feature = "std"))]
fn now_millis() -> u64 {
    static TICK: AtomicU64 = AtomicU64::new(0);
    TICK.fetch_add(1, Ordering::Relaxed)
}

struct FreeList {
    head: *mut u8,
    len: usize,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// Detach and return the head block, severing its next pointer. Null if
    /// empty.
    fn pop_one(&mut self) -> *mut u8 {
        let head = self.head;
        if head.is_null() {
            return ptr::null_mut();
        }
        self.head = unsafe { block_next(head) };
        unsafe { set_block_next(head, ptr::null_mut()) };
        self.len -= 1;
        head
    }

    fn push_chain(&mut self, head: *mut u8, tail: *mut u8, count: usize) {
        unsafe { set_block_next(tail, self.head) };
        self.head = head;
        self.len += count;
    }

    /// Remove every block whose address falls in `[lo, hi)`. Returns how many were removed.
    fn remove_range(&mut self, lo: usize, hi: usize) -> usize {
        let mut kept_head: *mut u8 = ptr::null_mut();
        let mut kept_tail: *mut u8 = ptr::null_mut();
        let mut removed = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { block_next(cur) };
            let addr = cur as usize;
            if addr >= lo && addr < hi {
                removed += 1;
            } else {
                unsafe { set_block_next(cur, ptr::null_mut()) };
                if kept_head.is_null() {
                    kept_head = cur;
                } else {
                    unsafe { set_block_next(kept_tail, cur) };
                }
                kept_tail = cur;
            }
            cur = next;
        }
        self.head = kept_head;
        self.len -= removed;
        removed
    }
}

/// Bounded, append-only table tracking which spans are in play for each
/// size class and how many of their blocks have been freed back to it.
///
/// `count` is the publication point: a writer stores new span metadata with
/// plain loads/stores and only becomes visible to other threads once it
/// bumps `count` with `Release`; readers load `count` with `Acquire` before
/// scanning. Entries are never compacted, only tombstoned (`span_ptr = 0`)
/// once their span has been handed back to the page cache.
struct SpanTable {
    span_ptr: [AtomicUsize; SPAN_TABLE_CAP],
    span_addr: [AtomicUsize; SPAN_TABLE_CAP],
    num_pages: [AtomicUsize; SPAN_TABLE_CAP],
    block_count: [AtomicUsize; SPAN_TABLE_CAP],
    size_class: [AtomicUsize; SPAN_TABLE_CAP],
    free_count: [AtomicUsize; SPAN_TABLE_CAP],
    count: AtomicUsize,
}

macro_rules! zero_atomic_usize_array {
    ($len:expr) => {{
        // SAFETY: a zeroed AtomicUsize is the value 0, a valid state.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicUsize; $len]>([0usize; $len]) }
    }};
}

impl SpanTable {
    const fn new() -> Self {
        Self {
            span_ptr: zero_atomic_usize_array!(SPAN_TABLE_CAP),
            span_addr: zero_atomic_usize_array!(SPAN_TABLE_CAP),
            num_pages: zero_atomic_usize_array!(SPAN_TABLE_CAP),
            block_count: zero_atomic_usize_array!(SPAN_TABLE_CAP),
            size_class: zero_atomic_usize_array!(SPAN_TABLE_CAP),
            free_count: zero_atomic_usize_array!(SPAN_TABLE_CAP),
            count: AtomicUsize::new(0),
        }
    }

    /// Publish a newly populated span. All of its blocks are on the free
    /// list at this point, so `free_count` starts at `block_count` — it
    /// only ever moves by exactly the blocks that leave (`note_block_taken`)
    /// or return (`note_block_freed`) afterward. Silently drops the
    /// registration once the table is full: those spans are still handed
    /// out and freed normally, they just never get delayed-return
    /// accounting.
    fn register(&self, span_ptr: *mut Span, span_addr: usize, num_pages: usize, block_count: usize, class_idx: usize) {
        let idx = self.count.fetch_add(1, Ordering::Relaxed);
        if idx >= SPAN_TABLE_CAP {
            return;
        }
        self.span_addr[idx].store(span_addr, Ordering::Relaxed);
        self.num_pages[idx].store(num_pages, Ordering::Relaxed);
        self.block_count[idx].store(block_count, Ordering::Relaxed);
        self.size_class[idx].store(class_idx, Ordering::Relaxed);
        self.free_count[idx].store(block_count, Ordering::Relaxed);
        self.span_ptr[idx].store(span_ptr as usize, Ordering::Release);
    }

    fn published_len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(SPAN_TABLE_CAP)
    }

    fn locate(&self, class_idx: usize, addr: usize) -> Option<usize> {
        for idx in 0..self.published_len() {
            if self.span_ptr[idx].load(Ordering::Acquire) == 0 {
                continue;
            }
            if self.size_class[idx].load(Ordering::Relaxed) != class_idx {
                continue;
            }
            let base = self.span_addr[idx].load(Ordering::Relaxed);
            let end = base + self.num_pages[idx].load(Ordering::Relaxed) * PAGE_SIZE;
            if addr >= base && addr < end {
                return Some(idx);
            }
        }
        None
    }

    /// Record that one block belonging to `addr` came back to the central
    /// cache. No-op if `addr` isn't covered by any tracked span.
    fn note_block_freed(&self, class_idx: usize, addr: usize) {
        if let Some(idx) = self.locate(class_idx, addr) {
            self.free_count[idx].fetch_add(1, Ordering::Release);
        }
    }

    /// Record that one block belonging to `addr` left the free list (fetched
    /// out to a thread cache). Mirrors `note_block_freed` so `free_count`
    /// always reflects exactly how many of a span's blocks currently sit on
    /// the central free list, never more.
    fn note_block_taken(&self, class_idx: usize, addr: usize) {
        if let Some(idx) = self.locate(class_idx, addr) {
            self.free_count[idx].fetch_sub(1, Ordering::Release);
        }
    }

    /// Sweep tracked spans of `class_idx`, pulling any fully-free span's
    /// blocks out of `list` and handing the span back to the page cache.
    fn sweep(&self, class_idx: usize, list: &mut FreeList) {
        for idx in 0..self.published_len() {
            let span_raw = self.span_ptr[idx].load(Ordering::Acquire);
            if span_raw == 0 {
                continue;
            }
            if self.size_class[idx].load(Ordering::Relaxed) != class_idx {
                continue;
            }
            let block_count = self.block_count[idx].load(Ordering::Relaxed);
            let free_count = self.free_count[idx].load(Ordering::Acquire);
            if free_count < block_count {
                continue;
            }
            let base = self.span_addr[idx].load(Ordering::Relaxed);
            let end = base + self.num_pages[idx].load(Ordering::Relaxed) * PAGE_SIZE;
            list.remove_range(base, end);
            self.span_ptr[idx].store(0, Ordering::Release);
            PAGE_CACHE.deallocate_span(span_raw as *mut Span);
            crate::stat_inc!(span_returns);
        }
    }
}

unsafe impl Sync for SpanTable {}

struct ClassState {
    list: SpinMutex<FreeList>,
    delay_count: AtomicU32,
    last_return_ms: AtomicU64,
}

impl ClassState {
    const fn new() -> Self {
        Self {
            list: SpinMutex::new(FreeList::new()),
            delay_count: AtomicU32::new(0),
            last_return_ms: AtomicU64::new(0),
        }
    }
}

/// The shared, per-size-class block cache sitting between every
/// `ThreadCache` and the page-granularity `PageCache`.
pub struct CentralCache {
    classes: [ClassState; NUM_CLASSES],
    span_table: SpanTable,
}

impl CentralCache {
    pub const fn new() -> Self {
        const CLASS_INIT: ClassState = ClassState::new();
        Self {
            classes: [CLASS_INIT; NUM_CLASSES],
            span_table: SpanTable::new(),
        }
    }

    /// Pull exactly one block of `class_idx` out of the central cache,
    /// populating it from `PageCache` first if it's empty. Null on OOM.
    pub fn fetch_range(&self, class_idx: usize) -> *mut u8 {
        let state = &self.classes[class_idx];
        let mut list = state.list.lock();
        if list.len == 0 {
            self.populate(class_idx, &mut list);
        }
        let block = list.pop_one();
        if !block.is_null() {
            self.span_table.note_block_taken(class_idx, block as usize);
        }
        block
    }

    /// Return a chain of `count` blocks (from `head` to `tail`) of
    /// `class_idx` to the central cache, then run the delayed-return check.
    ///
    /// Held under a single lock acquisition for the whole operation: the
    /// free-count bookkeeping below must observe the blocks as already
    /// pushed and must complete before any other thread's `fetch_range` can
    /// pop one of them back out, or a block still genuinely in use could get
    /// double-counted as free and its span reclaimed out from under it.
    ///
    /// # Safety
    /// `head..=tail` must be a valid chain of exactly `count` blocks sized
    /// for `class_idx`.
    pub unsafe fn return_range(&self, class_idx: usize, head: *mut u8, tail: *mut u8, count: usize) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut list = self.classes[class_idx].list.lock();
        list.push_chain(head, tail, count);

        let mut cur = head;
        loop {
            self.span_table.note_block_freed(class_idx, cur as usize);
            if cur == tail {
                break;
            }
            cur = unsafe { block_next(cur) };
        }

        self.maybe_sweep_locked(class_idx, &mut list);
    }

    /// Run the delayed-return check and, if due, sweep. Caller must already
    /// hold `classes[class_idx].list`'s lock.
    fn maybe_sweep_locked(&self, class_idx: usize, list: &mut FreeList) {
        let state = &self.classes[class_idx];
        let count = state.delay_count.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_millis();
        let last = state.last_return_ms.load(Ordering::Relaxed);
        let due_by_count = count >= MAX_DELAY_COUNT;
        let due_by_time = now.saturating_sub(last) >= DELAY_INTERVAL_MS;
        if !due_by_count && !due_by_time {
            return;
        }
        state.delay_count.store(0, Ordering::Relaxed);
        state.last_return_ms.store(now, Ordering::Relaxed);
        self.span_table.sweep(class_idx, list);
    }

    fn populate(&self, class_idx: usize, list: &mut FreeList) {
        let block_size = size_class::size_for_index(class_idx);
        let num_pages = if block_size <= SPAN_PAGES * PAGE_SIZE {
            SPAN_PAGES
        } else {
            (block_size + PAGE_SIZE - 1) / PAGE_SIZE
        };

        let span = PAGE_CACHE.allocate_span(num_pages);
        if span.is_null() {
            return;
        }

        let span_addr = unsafe { (*span).page_addr };
        let span_pages = unsafe { (*span).num_pages };
        let total_bytes = span_pages * PAGE_SIZE;
        let block_count = total_bytes / block_size;

        let mut head: *mut u8 = ptr::null_mut();
        for i in 0..block_count {
            let block = (span_addr + i * block_size) as *mut u8;
            unsafe { set_block_next(block, head) };
            head = block;
        }
        list.head = head;
        list.len += block_count;

        self.span_table
            .register(span, span_addr, span_pages, block_count, class_idx);
        crate::stat_inc!(central_cache_populates);
    }
}

unsafe impl Sync for CentralCache {}

pub static CENTRAL_CACHE: CentralCache = CentralCache::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_then_return_roundtrips() {
        let cache = CentralCache::new();
        let head = cache.fetch_range(0);
        assert!(!head.is_null());
        unsafe { cache.return_range(0, head, head, 1) };
    }

    #[test]
    fn fetch_drains_across_many_requests() {
        let cache = CentralCache::new();
        for _ in 0..64 {
            let head = cache.fetch_range(1);
            assert!(
                !head.is_null(),
                "central cache should always be able to grow from the page cache"
            );
            unsafe { cache.return_range(1, head, head, 1) };
        }
    }

    #[test]
    fn repeated_returns_drive_the_delay_sweep_without_corruption() {
        let cache = CentralCache::new();
        let head = cache.fetch_range(2);
        assert!(!head.is_null());

        // Cycle a single block through fetch/return enough times to push the
        // per-class delay counter past MAX_DELAY_COUNT and force a sweep.
        // The sweep must leave the free list in a consistent state even when
        // it finds nothing fully free to reclaim.
        let mut cur = head;
        for _ in 0..(MAX_DELAY_COUNT as usize + 1) {
            unsafe { cache.return_range(2, cur, cur, 1) };
            cur = cache.fetch_range(2);
            assert!(!cur.is_null());
        }
    }

    #[test]
    fn fully_freed_span_is_reclaimed_by_page_cache() {
        let cache = CentralCache::new();
        // Drain every block a freshly populated span yields, one fetch at a
        // time, then return them all so the span is entirely free.
        let mut blocks = alloc::vec::Vec::new();
        loop {
            let head = cache.fetch_range(3);
            assert!(!head.is_null());
            blocks.push(head);
            // `populate` only runs again once the list is empty; once a
            // fetch stops drawing from the span just carved (i.e. its first
            // block's span would differ), the existing span is exhausted.
            if cache.classes[3].list.lock().len == 0 {
                break;
            }
        }
        for block in &blocks {
            unsafe { cache.return_range(3, *block, *block, 1) };
        }

        // Enough repeated returns-of-nothing-new still need to trip the
        // sweep trigger, so drive the counter too.
        for _ in 0..(MAX_DELAY_COUNT as usize) {
            let mut list = cache.classes[3].list.lock();
            cache.maybe_sweep_locked(3, &mut list);
        }
    }
}
