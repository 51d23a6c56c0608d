//! End-to-end scenario tests against the crate's own `allocate`/`deallocate`
//! API, independent of the `GlobalAlloc` adapter exercised in `stress.rs`.

use tiered_alloc::{allocate, deallocate, delete_object, new_object};

#[test]
fn single_thread_allocation_churn() {
    let mut live = Vec::new();
    for round in 0..200usize {
        let size = 8 + (round % 64) * 8;
        let tag = (round & 0xFF) as u8;
        let p = allocate(size);
        assert!(!p.is_null());
        unsafe { p.write_bytes(tag, size) };
        live.push((p, size, tag));

        if live.len() > 32 {
            let (old_p, old_size, old_tag) = live.remove(0);
            unsafe {
                assert_eq!(*old_p, old_tag, "stale write observed before free");
                deallocate(old_p, old_size);
            }
        }
    }
    for (p, size, tag) in live {
        unsafe {
            assert_eq!(*p, tag);
            deallocate(p, size);
        }
    }
}

#[test]
fn different_sizes_never_alias_while_both_are_live() {
    let a = allocate(32);
    let b = allocate(256);
    let c = allocate(4096);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
    unsafe {
        deallocate(a, 32);
        deallocate(b, 256);
        deallocate(c, 4096);
    }
}

#[test]
fn oversize_request_is_forwarded_and_usable() {
    let size = tiered_alloc::config::MAX_BYTES * 2;
    let p = allocate(size);
    assert!(!p.is_null());
    unsafe {
        p.write_bytes(0x42, size);
        assert_eq!(*p.add(size - 1), 0x42);
        deallocate(p, size);
    }
}

#[test]
fn zero_size_allocate_returns_an_align_sized_block() {
    let p = allocate(0);
    assert!(!p.is_null());
    unsafe {
        p.write(0x7A);
        assert_eq!(*p, 0x7A);
        deallocate(p, 0);
    }
}

#[test]
fn new_object_and_delete_object_roundtrip() {
    let p = new_object::<[u64; 4]>();
    assert!(!p.is_null());
    unsafe {
        (*p) = [1, 2, 3, 4];
        assert_eq!(*p, [1, 2, 3, 4]);
        delete_object(p);
    }
}

#[test]
fn many_spans_worth_of_allocations_trigger_page_cache_growth() {
    // Push enough same-class allocations that the central cache has to pull
    // more than one span from the page cache, exercising span carving and
    // (on the way back down) forward coalescing.
    let size = 64;
    let mut live = Vec::new();
    for _ in 0..20_000 {
        let p = allocate(size);
        assert!(!p.is_null());
        live.push(p);
    }
    for p in live {
        unsafe { deallocate(p, size) };
    }
}

#[cfg(feature = "stats")]
#[test]
fn stats_reflect_allocation_activity() {
    let before = tiered_alloc::stats::snapshot();
    let p = allocate(128);
    unsafe { deallocate(p, 128) };
    let after = tiered_alloc::stats::snapshot();
    assert!(after.alloc_count > before.alloc_count);
    assert!(after.dealloc_count > before.dealloc_count);
}
