//! Compile-time tuning constants.
//!
//! Every knob the allocator needs is fixed at compile time. There is no
//! environment-variable or file-based configuration layer: the three tiers
//! are sized once, here, and recompiled if they ever need to change.

/// Byte alignment every allocation is rounded up to.
pub const ALIGN: usize = 8;

/// Largest request routed through the tiered size-class path. Anything
/// bigger is forwarded straight to the system allocator.
pub const MAX_BYTES: usize = 256 * 1024;

/// Native OS page size. `PageCache` only ever requests whole multiples of
/// this from the platform layer.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();

/// Default span length, in pages, carved for size classes small enough that
/// a single span still yields more than one block.
pub const SPAN_PAGES: usize = 8;

/// Number of central-cache returns after which a size class's free list is
/// swept for fully-free spans, even if `DELAY_INTERVAL` hasn't elapsed.
pub const MAX_DELAY_COUNT: u32 = 48;

/// Wall-clock interval, in milliseconds, after which a size class is swept
/// on its next return, even if `MAX_DELAY_COUNT` hasn't been reached. Under
/// `std` this is real wall-clock time; without it, a logical tick counter
/// stands in, since `core` has no clock of its own.
pub const DELAY_INTERVAL_MS: u64 = 1000;

/// Thread-cache free-list length that triggers a drain to the central cache.
pub const RETENTION_THRESHOLD: usize = 256;

/// Capacity of the central cache's flat span-tracker table. Spans published
/// beyond this bound are handed out but lose delayed-return accounting.
pub const SPAN_TABLE_CAP: usize = 1024;
