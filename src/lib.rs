//! An order-based binary-buddy allocator.
//!
//! A [`Buddy`] manages a fixed, caller-provided region of memory by dividing
//! it into power-of-two-sized blocks. Callers request blocks by *order*: a
//! block of order `o` spans `2^o` minimum-size units. Allocation splits a
//! larger free block downward on demand; deallocation merges a freed block
//! with its buddy whenever both halves of a pair become free.
//!
//! The allocator stores no per-block headers. While a block is free, its own
//! first bytes hold the links of an intrusive free list; a single parity bit
//! per buddy pair replaces explicit free/busy state. Bookkeeping lives in a
//! separate metadata region so the managed region is handed out whole.
//!
//! The crate is `no_std`. Constructors that obtain metadata from the global
//! allocator are available behind the `alloc` feature; otherwise both regions
//! are supplied by the caller:
//!
//! ```
//! use ordalloc::{Buddy, Raw};
//!
//! // A region of 8 units of 64 bytes each, orders 0 through 3.
//! let region = Buddy::<Raw>::region_layout(8, 64).unwrap();
//! let metadata = Buddy::<Raw>::metadata_layout(8, 64).unwrap();
//!
//! assert_eq!(region.size(), 512);
//! assert_eq!(region.align(), 64);
//! assert!(metadata.size() > 0);
//! ```

#![doc(html_root_url = "https://docs.rs/ordalloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
// This is necessary to allow `sptr` to shadow methods provided by unstable
// or recently stabilized standard library features.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod list;
mod polyfill;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, ptr::NonNull};

pub use crate::buddy::{Buddy, FreeRanges};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// metadata region but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the unit size or unit count passed to a
    /// constructor cannot describe a valid allocator: either value is not a
    /// power of two, the unit count is zero, the unit size is too small to
    /// hold a free-list link, or the region size overflows `usize`.
    InvalidConfig,
}

/// Types which provide the memory backing an allocator's metadata.
///
/// This trait is implemented by the following types:
/// - The [`Raw`] marker type indicates that the metadata region was supplied
///   by the caller as a raw pointer. Nothing is freed on drop; the region can
///   be reclaimed with [`Buddy::into_raw_parts`].
/// - The [`Global`] marker type indicates that the metadata region was
///   obtained from the global allocator and is returned to it on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this
    ///   allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator's metadata is backed by raw
/// pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
