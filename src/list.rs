//! Intrusive lists of free blocks.

use core::{marker::PhantomData, mem, num::NonZeroUsize};

use crate::base::{BasePtr, BlockLink};

/// A list of free blocks, linked through the blocks' own storage.
///
/// Only the head address is stored; while a block sits on the list, its first
/// bytes hold a [`BlockLink`]. Insertion and removal are O(1) and never
/// allocate. The list imposes no ordering on its elements.
#[derive(Debug)]
pub struct FreeList {
    head: Option<NonZeroUsize>,
}

impl FreeList {
    /// Creates an empty list.
    pub const fn new() -> FreeList {
        FreeList { head: None }
    }

    /// Returns `true` if the list contains no blocks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes a block onto the head of the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The memory at `block` must be within the provenance of `base` and
    ///   valid for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - `block` must not be an element of any list.
    pub unsafe fn push(&mut self, base: BasePtr, block: NonZeroUsize) {
        assert_eq!(block.get() & (mem::align_of::<BlockLink>() - 1), 0);

        let new_head = block;

        if let Some(old_head) = self.head {
            let old_head_mut = unsafe { base.link_mut(old_head) };
            old_head_mut.prev = Some(new_head);
        }

        let old_head = self.head;

        // If `old_head` exists, it points back to `new_head`.

        unsafe {
            base.init_link_at(
                block,
                BlockLink {
                    prev: None,
                    next: old_head,
                },
            )
        };

        // `new_head` points forward to `old_head`.
        // `old_head` points back to `new_head`.
        self.head = Some(new_head);
    }

    /// Removes and returns the block at the head of the list.
    ///
    /// # Safety
    ///
    /// Every element of the list must be within the provenance of `base` and
    /// contain a properly initialized `BlockLink`.
    pub unsafe fn pop(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.head?;

        unsafe { self.remove(base, head) };

        Some(head)
    }

    /// Removes the specified block from the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The memory at `block` must be within the provenance of `base` and
    ///   valid for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - `block` must be the address of an element of this list.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        unsafe {
            let removed = base.link_mut(block);

            match removed.prev {
                // Link `prev` forward to `next`.
                Some(p) => base.link_mut(p).next = removed.next,

                // If there's no previous block, then `removed` is the head of
                // the list.
                None => self.head = removed.next,
            }

            if let Some(n) = removed.next {
                // Link `next` back to `prev`.
                base.link_mut(n).prev = removed.prev;
            }
        }
    }

    /// Returns an iterator over the addresses of the blocks in the list.
    ///
    /// # Safety
    ///
    /// Every element of the list must be within the provenance of `base` and
    /// contain a properly initialized `BlockLink`, and no link may be written
    /// while the iterator is live.
    pub unsafe fn iter(&self, base: BasePtr) -> Iter<'_> {
        Iter {
            base,
            cur: self.head,
            _list: PhantomData,
        }
    }
}

/// An iterator over the block addresses of a [`FreeList`].
#[derive(Debug)]
pub struct Iter<'a> {
    base: BasePtr,
    cur: Option<NonZeroUsize>,
    _list: PhantomData<&'a FreeList>,
}

impl Iterator for Iter<'_> {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let cur = self.cur?;

        // The list invariants are upheld by `FreeList::iter`'s contract.
        self.cur = unsafe { self.base.link(cur) }.next;

        Some(cur)
    }
}
