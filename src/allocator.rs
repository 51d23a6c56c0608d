//! Top-level allocator surface tying the three tiers together.
//!
//! `allocate`/`deallocate` are the primary API: callers must pass the exact
//! size they allocated with back to `deallocate`, since nothing here keeps
//! per-pointer bookkeeping the way a `GlobalAlloc` implementation has to.
//! `Allocator` adapts that API to `GlobalAlloc` for programs that want to
//! install this crate as `#[global_allocator]`.
//!
//! Requests bigger than the largest size class are oversize: they skip all
//! three tiers and forward straight to the system allocator, the same way a
//! hosted allocator leans on `mmap` directly for huge requests.

use crate::config::ALIGN;
use crate::size_class;
use crate::thread_cache;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// Allocate `size` bytes. `size == 0` is treated as `size == ALIGN`. Returns
/// null only on failure.
pub fn allocate(size: usize) -> *mut u8 {
    let size = if size == 0 { ALIGN } else { size };

    crate::stat_inc!(alloc_count);
    crate::stat_add!(alloc_bytes, size);

    if !size_class::fits_size_classes(size) {
        crate::stat_inc!(oversize_allocs);
        return allocate_oversize(size);
    }

    thread_cache::allocate(size_class::index_for(size))
}

/// Free a block previously returned by [`allocate`]. `ptr == null` is a
/// no-op; otherwise `size` must be normalized the same way `allocate` would
/// (`size == 0` means `ALIGN`).
///
/// # Safety
/// `ptr` must be a live allocation from [`allocate`], and `size` must be
/// exactly the value that was passed to that call — this crate has no way
/// to recover it from `ptr` alone.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    let size = if size == 0 { ALIGN } else { size };

    crate::stat_inc!(dealloc_count);

    if !size_class::fits_size_classes(size) {
        unsafe { deallocate_oversize(ptr, size) };
        return;
    }

    thread_cache::deallocate(size_class::index_for(size), ptr);
}

/// Allocate space for a `T` and leave it uninitialized. Returns null on
/// failure. Pairs with [`delete_object`].
pub fn new_object<T>() -> *mut T {
    let size = core::mem::size_of::<T>().max(ALIGN);
    allocate(size).cast::<T>()
}

/// Drop and free a value obtained from [`new_object`].
///
/// # Safety
/// `ptr` must have come from `new_object::<T>()` and not already have been
/// passed to `delete_object`.
pub unsafe fn delete_object<T>(ptr: *mut T) {
    if ptr.is_null() {
        return;
    }
    unsafe { ptr::drop_in_place(ptr) };
    let size = core::mem::size_of::<T>().max(ALIGN);
    unsafe { deallocate(ptr.cast::<u8>(), size) };
}

#[cfg(feature = "std")]
fn allocate_oversize(size: usize) -> *mut u8 {
    match Layout::from_size_align(size, ALIGN) {
        Ok(layout) => unsafe { std::alloc::System.alloc(layout) },
        Err(_) => ptr::null_mut(),
    }
}

#[cfg(feature = "std")]
unsafe fn deallocate_oversize(ptr: *mut u8, size: usize) {
    if let Ok(layout) = Layout::from_size_align(size, ALIGN) {
        unsafe { std::alloc::System.dealloc(ptr, layout) };
    }
}

/// Without `std` there is no distinct "system allocator" to forward to, so
/// oversize requests fall back to pulling a span directly from the page
/// cache, the same way the tiered path ultimately gets its memory.
#[cfg(not(feature = "std"))]
fn allocate_oversize(size: usize) -> *mut u8 {
    let num_pages = size.div_ceil(crate::config::PAGE_SIZE).max(1);
    let span = crate::page_heap::PAGE_CACHE.allocate_span(num_pages);
    if span.is_null() {
        return ptr::null_mut();
    }
    unsafe { (*span).page_addr as *mut u8 }
}

#[cfg(not(feature = "std"))]
unsafe fn deallocate_oversize(ptr: *mut u8, _size: usize) {
    let span = crate::page_heap::PAGE_CACHE.lookup_by_addr(ptr as usize);
    if !span.is_null() {
        crate::page_heap::PAGE_CACHE.deallocate_span(span);
    }
}

/// Adapts [`allocate`]/[`deallocate`] to `GlobalAlloc` for use as
/// `#[global_allocator]`.
///
/// Requests aligned beyond [`ALIGN`] bytes are treated as oversize and
/// forwarded the same way regardless of their size, since nothing below
/// `MAX_BYTES` tracks per-block alignment beyond the default.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() <= ALIGN {
            allocate(size)
        } else {
            alloc_over_aligned(layout)
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = layout.size();
        if size == 0 {
            return;
        }
        if layout.align() <= ALIGN {
            unsafe { deallocate(ptr, size) };
        } else {
            unsafe { dealloc_over_aligned(ptr, layout) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            let copy_size = layout.size().min(new_size);
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, copy_size) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

#[cfg(feature = "std")]
fn alloc_over_aligned(layout: Layout) -> *mut u8 {
    unsafe { std::alloc::System.alloc(layout) }
}

#[cfg(feature = "std")]
unsafe fn dealloc_over_aligned(ptr: *mut u8, layout: Layout) {
    unsafe { std::alloc::System.dealloc(ptr, layout) };
}

/// Without `std`, over-aligned requests beyond a page are out of scope: the
/// page cache can only promise `PAGE_SIZE` alignment. Anything up to that
/// is already satisfied by the oversize span path.
#[cfg(not(feature = "std"))]
fn alloc_over_aligned(layout: Layout) -> *mut u8 {
    if layout.align() <= crate::config::PAGE_SIZE {
        allocate_oversize(layout.size().max(1))
    } else {
        ptr::null_mut()
    }
}

#[cfg(not(feature = "std"))]
unsafe fn dealloc_over_aligned(ptr: *mut u8, layout: Layout) {
    if layout.align() <= crate::config::PAGE_SIZE {
        unsafe { deallocate_oversize(ptr, layout.size().max(1)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_zero_returns_an_align_sized_block() {
        let p = allocate(0);
        assert!(!p.is_null());
        unsafe {
            ptr::write_bytes(p, 0xEF, ALIGN);
            assert_eq!(*p, 0xEF);
            deallocate(p, 0);
        }
    }

    #[test]
    fn small_allocation_roundtrips() {
        let p = allocate(64);
        assert!(!p.is_null());
        unsafe {
            ptr::write_bytes(p, 0xAB, 64);
            assert_eq!(*p, 0xAB);
            deallocate(p, 64);
        }
    }

    #[test]
    fn oversize_allocation_roundtrips() {
        let size = crate::config::MAX_BYTES + 1024;
        let p = allocate(size);
        assert!(!p.is_null());
        unsafe {
            ptr::write_bytes(p, 0xCD, size);
            assert_eq!(*p, 0xCD);
            deallocate(p, size);
        }
    }

    #[test]
    fn new_object_runs_drop_on_delete() {
        struct DropFlag<'a>(&'a core::cell::Cell<bool>);
        impl Drop for DropFlag<'_> {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let flag = core::cell::Cell::new(false);
        let p = new_object::<DropFlag>();
        assert!(!p.is_null());
        unsafe {
            p.write(DropFlag(&flag));
            delete_object(p);
        }
        assert!(flag.get());
    }

    #[test]
    fn global_alloc_adapter_roundtrips() {
        let alloc = Allocator;
        let layout = Layout::from_size_align(128, 8).unwrap();
        unsafe {
            let p = alloc.alloc(layout);
            assert!(!p.is_null());
            ptr::write_bytes(p, 0x11, 128);
            alloc.dealloc(p, layout);
        }
    }
}
