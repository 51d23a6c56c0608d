//! Intrusive free-list blocks: a free block's own first word holds the
//! pointer to the next free block. This is how `ThreadCache` and
//! `CentralCache` both thread their free lists through raw allocations
//! without any separate node storage.

use core::ptr;

/// Read the "next" pointer stashed in `block`'s first word.
///
/// # Safety
/// `block` must be a valid, writable allocation at least `size_of::<*mut u8>()` bytes.
#[inline]
pub unsafe fn block_next(block: *mut u8) -> *mut u8 {
    unsafe { *(block as *mut *mut u8) }
}

/// Stash `next` into `block`'s first word.
///
/// # Safety
/// `block` must be a valid, writable allocation at least `size_of::<*mut u8>()` bytes.
#[inline]
pub unsafe fn set_block_next(block: *mut u8, next: *mut u8) {
    unsafe { *(block as *mut *mut u8) = next };
}

/// Walk an intrusively-linked chain to find its tail and length.
///
/// # Safety
/// `head` must either be null or start a valid chain of blocks linked via
/// [`block_next`], terminating in a null pointer.
pub unsafe fn chain_tail(head: *mut u8) -> (*mut u8, usize) {
    if head.is_null() {
        return (ptr::null_mut(), 0);
    }
    let mut tail = head;
    let mut len = 1;
    loop {
        let next = unsafe { block_next(tail) };
        if next.is_null() {
            return (tail, len);
        }
        tail = next;
        len += 1;
    }
}
