#![no_std]

//! A thread-caching, tiered memory allocator.
//!
//! Three tiers, fastest to slowest:
//! - [`thread_cache`]: per-OS-thread free lists, no locking on the hot path
//! - [`central_free_list`]: per-size-class free lists shared across threads,
//!   spin-locked, with delayed return of fully-free spans
//! - [`page_heap`]: the page-granularity span allocator backing everything,
//!   talking directly to the OS through [`platform`]
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: tiered_alloc::Allocator = tiered_alloc::Allocator;
//! ```
//!
//! Or, without installing it as the global allocator, call [`allocate`] and
//! [`deallocate`] directly.

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod central_free_list;
pub mod config;
mod intrusive;
#[macro_use]
mod macros;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod sync;
pub mod thread_cache;

pub use allocator::{allocate, deallocate, delete_object, new_object, Allocator};
