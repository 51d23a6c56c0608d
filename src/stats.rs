//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The spinlocks elsewhere in the crate
//! already provide the ordering guarantees correctness depends on.
//!
//! Gated behind the `stats` feature: with it off, [`stat_inc!`]/[`stat_add!`]
//! compile to nothing and this module carries no runtime cost at all.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Total calls to `allocate` with a non-oversize request.
    pub alloc_count: AtomicU64,
    /// Total calls to `deallocate` with a non-oversize request.
    pub dealloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to `allocate`.
    pub alloc_bytes: AtomicU64,

    /// Allocations served straight from a thread's local cache.
    pub thread_cache_hits: AtomicU64,
    /// Allocations that missed the thread cache and hit the central cache.
    pub thread_cache_misses: AtomicU64,
    /// Times a size class's central free list had to pull a new span from
    /// the page cache.
    pub central_cache_populates: AtomicU64,
    /// Requests forwarded straight to the system allocator as oversize.
    pub oversize_allocs: AtomicU64,

    /// Calls to `platform::page_alloc`.
    pub os_alloc_count: AtomicU64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: AtomicU64,
    /// Times a page-cache span was split to satisfy a smaller request.
    pub span_splits: AtomicU64,
    /// Times two adjacent free spans were coalesced.
    pub span_coalesces: AtomicU64,
    /// Times a fully-freed span was returned from the central cache to the
    /// page cache.
    pub span_returns: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            thread_cache_hits: AtomicU64::new(0),
            thread_cache_misses: AtomicU64::new(0),
            central_cache_populates: AtomicU64::new(0),
            oversize_allocs: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
            span_splits: AtomicU64::new(0),
            span_coalesces: AtomicU64::new(0),
            span_returns: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Each field is read from its own atomic independently; the snapshot as a
/// whole is not a consistent point-in-time view under concurrent traffic,
/// which is fine for monitoring purposes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub alloc_bytes: u64,
    pub thread_cache_hits: u64,
    pub thread_cache_misses: u64,
    pub central_cache_populates: u64,
    pub oversize_allocs: u64,
    pub os_alloc_count: u64,
    pub os_alloc_bytes: u64,
    pub span_splits: u64,
    pub span_coalesces: u64,
    pub span_returns: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
///
/// Returns all zeroes when the `stats` feature is disabled, since the
/// counters are never incremented in that configuration.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        thread_cache_hits: s.thread_cache_hits.load(Ordering::Relaxed),
        thread_cache_misses: s.thread_cache_misses.load(Ordering::Relaxed),
        central_cache_populates: s.central_cache_populates.load(Ordering::Relaxed),
        oversize_allocs: s.oversize_allocs.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
        span_splits: s.span_splits.load(Ordering::Relaxed),
        span_coalesces: s.span_coalesces.load(Ordering::Relaxed),
        span_returns: s.span_returns.load(Ordering::Relaxed),
    }
}
