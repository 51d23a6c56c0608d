//! `PageCache`: the bottom tier. Owns OS-backed spans of pages and hands
//! them to `CentralCache` a whole span at a time.
//!
//! Free spans are tracked two ways, mirroring the source design: an
//! "ordered mapping from page count to span" (here, a flat array indexed by
//! exact page count, plus an overflow list for anything larger) for
//! allocation, and an address-keyed [`PageMap`] for coalescing lookups.

use crate::config::{PAGE_SHIFT, PAGE_SIZE, SPAN_PAGES};
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, Span, SpanState};
use crate::sync::SpinMutex;
use core::ptr;

/// Spans up to this many pages get an exact-index slot; larger spans live
/// on `large_spans` and are found by linear best-fit search (they're rare).
const MAX_PAGES: usize = 128;

struct PageCacheInner {
    free_lists: [*mut Span; MAX_PAGES + 1],
    large_spans: *mut Span,
    pagemap: PageMap,
}

unsafe impl Send for PageCacheInner {}

impl PageCacheInner {
    const fn new() -> Self {
        Self {
            free_lists: [ptr::null_mut(); MAX_PAGES + 1],
            large_spans: ptr::null_mut(),
            pagemap: PageMap::new(),
        }
    }

    fn list_for_mut(&mut self, num_pages: usize) -> &mut *mut Span {
        if num_pages <= MAX_PAGES {
            &mut self.free_lists[num_pages]
        } else {
            &mut self.large_spans
        }
    }

    fn push_free(&mut self, s: *mut Span) {
        unsafe {
            (*s).state = SpanState::Free;
        }
        let list = self.list_for_mut(unsafe { (*s).num_pages });
        unsafe { (*s).next = *list };
        *list = s;
    }

    /// Unlink `s` from whichever free list it sits on. Returns false if not found there.
    fn remove_free(&mut self, s: *mut Span) -> bool {
        let list = self.list_for_mut(unsafe { (*s).num_pages });
        let mut cur = *list;
        let mut prev: *mut Span = ptr::null_mut();
        while !cur.is_null() {
            if cur == s {
                let next = unsafe { (*cur).next };
                if prev.is_null() {
                    *list = next;
                } else {
                    unsafe { (*prev).next = next };
                }
                return true;
            }
            prev = cur;
            cur = unsafe { (*cur).next };
        }
        false
    }

    /// Best-fit search over `free_lists[min_pages..]`, then `large_spans`.
    fn find_fit(&mut self, num_pages: usize) -> *mut Span {
        if num_pages <= MAX_PAGES && !self.free_lists[num_pages].is_null() {
            return self.free_lists[num_pages];
        }
        if num_pages <= MAX_PAGES {
            for len in (num_pages + 1)..=MAX_PAGES {
                if !self.free_lists[len].is_null() {
                    return self.free_lists[len];
                }
            }
        }
        let mut best: *mut Span = ptr::null_mut();
        let mut cur = self.large_spans;
        while !cur.is_null() {
            let n = unsafe { (*cur).num_pages };
            if n >= num_pages && (best.is_null() || n < unsafe { (*best).num_pages }) {
                best = cur;
            }
            cur = unsafe { (*cur).next };
        }
        best
    }

    unsafe fn register(&self, s: *mut Span) {
        unsafe { self.pagemap.register_endpoints(s) };
    }

    /// Split `span` (already removed from its free list) down to exactly
    /// `num_pages`, returning any remainder to the free lists.
    unsafe fn carve(&mut self, span: *mut Span, num_pages: usize) -> *mut Span {
        let total = unsafe { (*span).num_pages };
        if total > num_pages {
            let remainder = span::alloc_span();
            if remainder.is_null() {
                // Can't split; hand over the whole span rather than leak it.
                unsafe { (*span).state = SpanState::InUse };
                unsafe { self.register(span) };
                return span;
            }
            unsafe {
                (*remainder).page_addr = (*span).page_addr + num_pages * PAGE_SIZE;
                (*remainder).num_pages = total - num_pages;
                (*remainder).state = SpanState::Free;
                (*span).num_pages = num_pages;
            }
            self.push_free(remainder);
            unsafe { self.register(remainder) };
            crate::stat_inc!(span_splits);
        }
        unsafe {
            (*span).state = SpanState::InUse;
        }
        unsafe { self.register(span) };
        span
    }

    unsafe fn grow_heap(&mut self, num_pages: usize) -> *mut Span {
        let grow_pages = if num_pages > SPAN_PAGES {
            num_pages
        } else {
            SPAN_PAGES
        };
        let base = unsafe { platform::page_alloc(grow_pages * PAGE_SIZE) };
        if base.is_null() {
            return ptr::null_mut();
        }
        let span = span::alloc_span();
        if span.is_null() {
            unsafe { platform::page_dealloc(base, grow_pages * PAGE_SIZE) };
            return ptr::null_mut();
        }
        unsafe {
            (*span).page_addr = base as usize;
            (*span).num_pages = grow_pages;
            (*span).state = SpanState::Free;
        }
        crate::stat_inc!(os_alloc_count);
        crate::stat_add!(os_alloc_bytes, grow_pages * PAGE_SIZE);
        unsafe { self.carve(span, num_pages) }
    }
}

/// The page-granularity allocator underlying every size class.
pub struct PageCache {
    inner: SpinMutex<PageCacheInner>,
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(PageCacheInner::new()),
        }
    }

    /// Look up the span covering `addr`, or null if `addr` isn't the start
    /// of any span this cache currently knows about. Used by the oversize
    /// allocation path to recover a span pointer it didn't keep around.
    pub fn lookup_by_addr(&self, addr: usize) -> *mut Span {
        let inner = self.inner.lock();
        let page_id = addr >> PAGE_SHIFT;
        let span = inner.pagemap.get(page_id);
        if !span.is_null() && unsafe { (*span).page_addr } == addr {
            span
        } else {
            ptr::null_mut()
        }
    }

    /// Allocate a span covering at least `num_pages` pages. Returns null on OOM.
    pub fn allocate_span(&self, num_pages: usize) -> *mut Span {
        debug_assert!(num_pages >= 1);
        let mut inner = self.inner.lock();
        let found = inner.find_fit(num_pages);
        if !found.is_null() {
            inner.remove_free(found);
            return unsafe { inner.carve(found, num_pages) };
        }
        unsafe { inner.grow_heap(num_pages) }
    }

    /// Return a span to the cache, coalescing forward with its immediate
    /// successor if that neighbor is itself free.
    ///
    /// Deliberately forward-only: walking backward would need a predecessor
    /// link this page map doesn't carry, and doubling the coalescing would
    /// only ever save rare, small amounts of fragmentation here.
    pub fn deallocate_span(&self, s: *mut Span) {
        let mut inner = self.inner.lock();
        unsafe {
            (*s).state = SpanState::Free;
        }

        let next_page = unsafe { (*s).end_addr() } >> PAGE_SHIFT;
        let neighbor = inner.pagemap.get(next_page);
        if !neighbor.is_null()
            && unsafe { (*neighbor).state } == SpanState::Free
            && unsafe { (*neighbor).page_addr } == unsafe { (*s).end_addr() }
        {
            inner.remove_free(neighbor);
            unsafe {
                (*s).num_pages += (*neighbor).num_pages;
            }
            unsafe { span::dealloc_span(neighbor) };
            crate::stat_inc!(span_coalesces);
        }

        inner.push_free(s);
        unsafe { inner.register(s) };
    }
}

unsafe impl Sync for PageCache {}

pub static PAGE_CACHE: PageCache = PageCache::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_deallocate_roundtrips() {
        let cache = PageCache::new();
        let s = cache.allocate_span(1);
        assert!(!s.is_null());
        assert!(unsafe { (*s).num_pages } >= 1);
        cache.deallocate_span(s);
    }

    #[test]
    fn exact_fit_span_is_reused_after_free() {
        let cache = PageCache::new();
        let s1 = cache.allocate_span(SPAN_PAGES);
        let addr1 = unsafe { (*s1).page_addr };
        cache.deallocate_span(s1);

        let s2 = cache.allocate_span(SPAN_PAGES);
        assert_eq!(unsafe { (*s2).page_addr }, addr1);
        cache.deallocate_span(s2);
    }

    #[test]
    fn carving_leaves_a_usable_remainder() {
        let cache = PageCache::new();
        let big = cache.allocate_span(SPAN_PAGES);
        cache.deallocate_span(big);

        // Ask for fewer pages than the default growth chunk; the remainder
        // should come back out as its own span rather than vanishing.
        let small = cache.allocate_span(1);
        assert_eq!(unsafe { (*small).num_pages }, 1);
        cache.deallocate_span(small);
    }

    #[test]
    fn adjacent_free_spans_coalesce_forward() {
        let cache = PageCache::new();
        // Carve one big span into two adjacent pieces, free both, and
        // confirm they merge back into a single span covering both.
        let whole = cache.allocate_span(2);
        let whole_addr = unsafe { (*whole).page_addr };
        let whole_pages = unsafe { (*whole).num_pages };
        cache.deallocate_span(whole);

        let first = cache.allocate_span(1);
        assert_eq!(unsafe { (*first).page_addr }, whole_addr);
        let second = cache.allocate_span(whole_pages - 1);
        assert_eq!(unsafe { (*second).page_addr }, whole_addr + PAGE_SIZE);

        cache.deallocate_span(first);
        cache.deallocate_span(second);

        let merged = cache.allocate_span(whole_pages);
        assert_eq!(unsafe { (*merged).page_addr }, whole_addr);
        assert_eq!(unsafe { (*merged).num_pages }, whole_pages);
        cache.deallocate_span(merged);
    }

    #[test]
    fn large_span_beyond_exact_index_uses_best_fit() {
        let cache = PageCache::new();
        let huge = cache.allocate_span(MAX_PAGES + 10);
        assert!(!huge.is_null());
        assert_eq!(unsafe { (*huge).num_pages }, MAX_PAGES + 10);
        cache.deallocate_span(huge);

        let again = cache.allocate_span(MAX_PAGES + 5);
        assert!(!again.is_null());
        cache.deallocate_span(again);
    }
}
