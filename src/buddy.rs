//! An order-based binary-buddy memory allocator.

use core::{
    alloc::Layout,
    fmt,
    mem::{self, ManuallyDrop},
    num::NonZeroUsize,
    ops::Range,
    ptr::NonNull,
};

use crate::{
    base::{BasePtr, BlockLink},
    bitmap::Bitmap,
    list::{self, FreeList},
    polyfill::NonNullStrict,
    AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Bookkeeping for a single order.
///
/// Each order owns the free list of blocks of its size and, below the top
/// order, one parity bit per buddy pair. The top order has no bitmap, as its
/// blocks have no buddy inside the region.
struct OrderLevel {
    /// Log2 of the block size at this order, i.e. `order_bit + order`.
    shift: u32,
    free: FreeList,
    pairs: Option<Bitmap>,
}

impl OrderLevel {
    #[inline]
    fn block_size(&self) -> usize {
        1 << self.shift
    }

    /// Retrieves the offset of the buddy of the block which starts `ofs`
    /// bytes from the base.
    ///
    /// Valid because every block's offset is a multiple of its own size, so
    /// flipping the block-size bit lands exactly on the sibling.
    #[inline]
    fn buddy_ofs(&self, ofs: usize) -> usize {
        debug_assert_eq!(ofs % self.block_size(), 0);

        ofs ^ self.block_size()
    }

    /// Retrieves the index of the pair bit for the block which starts `ofs`
    /// bytes from the base.
    ///
    /// Both siblings of a pair map to the same index; a pair spans two
    /// blocks, hence the extra shift.
    #[inline]
    fn pair_index(&self, ofs: usize) -> usize {
        ofs >> (self.shift + 1)
    }
}

/// A validated allocator configuration.
struct Config {
    order_bit: u32,
    order_max: u32,
}

/// Derives `order_bit` and `order_max`, rejecting configurations the
/// allocator cannot represent.
///
/// Unit counts that are not powers of two are rejected outright: the top
/// order's bitmap coverage is computed from `floor(log2(unit_count))`, and
/// silently truncating the trailing units would leave them tracked by no
/// bitmap at all.
fn config(unit_count: usize, unit_size: usize) -> Result<Config, AllocInitError> {
    if !unit_count.is_power_of_two() || !unit_size.is_power_of_two() {
        return Err(AllocInitError::InvalidConfig);
    }

    // A free block's storage doubles as its list link.
    if unit_size < mem::size_of::<BlockLink>() {
        return Err(AllocInitError::InvalidConfig);
    }

    if unit_count.checked_mul(unit_size).is_none() {
        return Err(AllocInitError::InvalidConfig);
    }

    Ok(Config {
        order_bit: unit_size.trailing_zeros(),
        order_max: unit_count.trailing_zeros(),
    })
}

/// An order-based binary-buddy allocator.
///
/// The allocator manages a caller-provided region of `unit_count` units of
/// `unit_size` bytes each; both values must be powers of two. A block of
/// order `o` spans `2 ^ o` units, so requests range from order 0 (one unit)
/// up to `order_max = log2(unit_count)` (the whole region).
///
/// Two invariants tie the structure together:
/// - a block's offset from the region base is always a multiple of its own
///   size, which makes the buddy address computable by flipping one bit;
/// - the pair bit shared by two siblings is toggled exactly once whenever
///   either sibling enters or leaves the free state at that order, so
///   bit = 1 reads as "exactly one sibling free" without any per-block
///   state.
///
/// The allocator owns its metadata region (the order table and the pair
/// bitmaps, carved out of a single allocation described by
/// [`metadata_layout`]) but never the managed region itself. Dropping the
/// allocator returns the metadata to its [`BackingAllocator`] and leaves the
/// managed region untouched.
///
/// All operations take `&mut self`; concurrent use requires external
/// synchronization.
///
/// [`metadata_layout`]: Buddy::metadata_layout
pub struct Buddy<A: BackingAllocator> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    /// Pointer to the region that backs the order table and bitmaps.
    metadata: NonNull<u8>,
    /// The order table, laid out at the start of `metadata`.
    levels: NonNull<OrderLevel>,
    metadata_layout: Layout,
    order_bit: u32,
    order_max: u32,
    backing: A,
}

impl Buddy<Raw> {
    /// Constructs a new `Buddy` from raw pointers.
    ///
    /// Every unit starts out free: the constructor seeds the free-list table
    /// by freeing each unit in address order, which coalesces them into a
    /// single block of order `order_max`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `unit_count` or
    /// `unit_size` is not a power of two, if `unit_count` is zero, if
    /// `unit_size` cannot hold a free-list link, or if the region size
    /// overflows `usize`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be a pointer to a region that satisfies the [`Layout`]
    ///   returned by [`Self::region_layout`], and it must be valid for reads
    ///   and writes for the entire size indicated by that `Layout`.
    /// - `metadata` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::metadata_layout`], and it must be
    ///   valid for reads and writes for the entire size indicated by that
    ///   `Layout`.
    /// - Neither region may be accessed except through the allocator while
    ///   the allocator exists.
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        unit_count: usize,
        unit_size: usize,
    ) -> Result<Buddy<Raw>, AllocInitError> {
        let cfg = config(unit_count, unit_size)?;
        let metadata_layout = Self::metadata_layout(unit_count, unit_size)?;

        unsafe {
            Ok(Buddy::build(
                metadata,
                region,
                unit_count,
                cfg,
                metadata_layout,
                Raw,
            ))
        }
    }
}

#[cfg(any(feature = "alloc", test))]
impl Buddy<Global> {
    /// Constructs a new `Buddy` with metadata backed by the global allocator.
    ///
    /// Every unit starts out free: the constructor seeds the free-list table
    /// by freeing each unit in address order, which coalesces them into a
    /// single block of order `order_max`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] as for [`Buddy::new_raw`],
    /// or [`AllocInitError::AllocFailed`] if the metadata allocation fails.
    /// On failure nothing is left allocated.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be a pointer to a region that satisfies the [`Layout`]
    ///   returned by [`Self::region_layout`], and it must be valid for reads
    ///   and writes for the entire size indicated by that `Layout`.
    /// - The region must not be accessed except through the allocator while
    ///   the allocator exists.
    pub unsafe fn try_new(
        region: NonNull<u8>,
        unit_count: usize,
        unit_size: usize,
    ) -> Result<Buddy<Global>, AllocInitError> {
        let cfg = config(unit_count, unit_size)?;
        let metadata_layout = Self::metadata_layout(unit_count, unit_size)?;

        let metadata = NonNull::new(unsafe { alloc::alloc::alloc(metadata_layout) })
            .ok_or(AllocInitError::AllocFailed(metadata_layout))?;

        unsafe {
            Ok(Buddy::build(
                metadata,
                region,
                unit_count,
                cfg,
                metadata_layout,
                Global,
            ))
        }
    }
}

impl<A: BackingAllocator> Buddy<A> {
    /// Returns the layout requirements of the region managed by an allocator
    /// of this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the configuration is
    /// rejected; see [`Buddy::new_raw`].
    pub fn region_layout(unit_count: usize, unit_size: usize) -> Result<Layout, AllocInitError> {
        config(unit_count, unit_size)?;

        // The multiplication was checked by `config`.
        Layout::from_size_align(unit_count * unit_size, unit_size)
            .map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the layout requirements of the metadata region for an
    /// allocator of this configuration.
    ///
    /// The metadata region holds one order record per order `0..=order_max`,
    /// followed by the pair bitmap words of every order below the top. An
    /// order `o < order_max` covers `unit_count >> (o + 1)` pairs; the top
    /// order has no bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the configuration is
    /// rejected; see [`Buddy::new_raw`].
    pub fn metadata_layout(unit_count: usize, unit_size: usize) -> Result<Layout, AllocInitError> {
        let cfg = config(unit_count, unit_size)?;

        let num_levels = cfg.order_max as usize + 1;
        let mut layout =
            Layout::array::<OrderLevel>(num_levels).map_err(|_| AllocInitError::InvalidConfig)?;

        for order in 0..cfg.order_max {
            let num_pairs = unit_count >> (order + 1);
            let (extended, _) = layout
                .extend(Bitmap::map_layout(num_pairs))
                .map_err(|_| AllocInitError::InvalidConfig)?;
            layout = extended;
        }

        Ok(layout.pad_to_align())
    }

    /// Assembles an allocator over `region` and seeds its free lists.
    ///
    /// # Safety
    ///
    /// As for [`Buddy::new_raw`]; `cfg` and `metadata_layout` must have been
    /// derived from `unit_count` and the unit size.
    unsafe fn build(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        unit_count: usize,
        cfg: Config,
        metadata_layout: Layout,
        backing: A,
    ) -> Buddy<A> {
        let Config {
            order_bit,
            order_max,
        } = cfg;

        let base = BasePtr::new(region, unit_count << order_bit);
        let levels = metadata.cast::<OrderLevel>();
        let num_levels = order_max as usize + 1;

        // The bitmap words follow the order table in the metadata region.
        let mut meta_curs =
            unsafe { metadata.as_ptr().add(num_levels * mem::size_of::<OrderLevel>()) };

        for order in 0..=order_max {
            let pairs = if order < order_max {
                let num_pairs = unit_count >> (order + 1);
                let bitmap_size = Bitmap::map_layout(num_pairs).size();
                let bitmap = unsafe { Bitmap::new(num_pairs, meta_curs.cast::<u64>()) };

                meta_curs = unsafe { meta_curs.add(bitmap_size) };

                Some(bitmap)
            } else {
                None
            };

            unsafe {
                levels.as_ptr().add(order as usize).write(OrderLevel {
                    shift: order_bit + order,
                    free: FreeList::new(),
                    pairs,
                });
            }
        }

        debug_assert!(
            unsafe { meta_curs.offset_from(metadata.as_ptr()) }
                <= metadata_layout.size().try_into().unwrap()
        );

        let mut buddy = Buddy {
            base,
            metadata,
            levels,
            metadata_layout,
            order_bit,
            order_max,
            backing,
        };

        // Seed the table by freeing every unit in address order; the free
        // path coalesces adjacent units upward as the pair bits allow,
        // leaving a single block of order `order_max`.
        for unit in 0..unit_count {
            unsafe { buddy.free_at(unit << order_bit, 0) };
        }

        buddy
    }

    #[inline]
    fn level(&self, order: u32) -> &OrderLevel {
        assert!(order <= self.order_max);

        unsafe { &*self.levels.as_ptr().add(order as usize) }
    }

    #[inline]
    fn level_mut(&mut self, order: u32) -> &mut OrderLevel {
        assert!(order <= self.order_max);

        unsafe { &mut *self.levels.as_ptr().add(order as usize) }
    }

    /// The highest order representable in the managed region.
    #[inline]
    pub fn order_max(&self) -> u32 {
        self.order_max
    }

    /// The size in bytes of a minimum-size (order 0) block.
    #[inline]
    pub fn unit_size(&self) -> usize {
        1 << self.order_bit
    }

    /// Attempts to allocate a block of the given order.
    ///
    /// On success, the returned pointer addresses `2 ^ order` units and is
    /// aligned to the block size. The contents of the block are
    /// uninitialized.
    ///
    /// Returns `None` if no free block of the requested order or above
    /// exists, or if `order` exceeds [`order_max`]. A failed allocation does
    /// not modify the allocator.
    ///
    /// [`order_max`]: Buddy::order_max
    pub fn allocate(&mut self, order: u32) -> Option<NonNull<u8>> {
        if order > self.order_max {
            return None;
        }

        let base = self.base;

        // Scan upward for the closest order with a free block.
        let source = (order..=self.order_max).find(|&o| !self.level(o).free.is_empty())?;

        let block = unsafe { self.level_mut(source).free.pop(base) }
            .expect("source free list is non-empty");
        let ofs = base.offset_to(block);

        // This half of its pair is no longer free. The top order has no
        // bitmap to update.
        if source != self.order_max {
            let level = self.level_mut(source);
            let bit = level.pair_index(ofs);
            level
                .pairs
                .as_mut()
                .expect("missing pair bitmap below top order")
                .toggle(bit);
        }

        // Split downward, retaining the lower half at each step. Each upper
        // half becomes the sole free sibling of a fresh pair, so its bit is
        // toggled on.
        let mut i = source;
        while i > order {
            i -= 1;

            let level = self.level_mut(i);
            let upper_ofs = ofs + level.block_size();
            let upper =
                NonZeroUsize::new(base.addr().get().checked_add(upper_ofs).unwrap()).unwrap();

            unsafe { level.free.push(base, upper) };

            let bit = level.pair_index(upper_ofs);
            level
                .pairs
                .as_mut()
                .expect("missing pair bitmap below top order")
                .toggle(bit);
        }

        Some(base.with_addr(block))
    }

    /// Deallocates the block of the given order at `ptr`.
    ///
    /// The block is merged with its buddy repeatedly, as far as the pair
    /// bits allow, before rejoining a free list.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of exactly `order` returned by a call to
    /// [`allocate`] on this allocator and not freed since. Passing any other
    /// address/order combination corrupts the free-space bookkeeping.
    ///
    /// [`allocate`]: Buddy::allocate
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, order: u32) {
        let addr = ptr.addr();

        debug_assert!(self.base.contains_addr(addr));
        debug_assert!(order <= self.order_max);

        let ofs = self.base.offset_to(addr);

        debug_assert_eq!(
            ofs % (1 << (self.order_bit + order)),
            0,
            "block offset not aligned to its order"
        );

        unsafe { self.free_at(ofs, order) };
    }

    /// Frees the block of the given order at offset `ofs`, coalescing upward.
    ///
    /// # Safety
    ///
    /// The addressed block must be unallocated and absent from every free
    /// list.
    unsafe fn free_at(&mut self, mut ofs: usize, mut order: u32) {
        let base = self.base;

        while order != self.order_max {
            let level = self.level_mut(order);
            let bit = level.pair_index(ofs);
            let pairs = level
                .pairs
                .as_mut()
                .expect("missing pair bitmap below top order");

            pairs.toggle(bit);
            if pairs.get(bit) {
                // The buddy is still allocated or subdivided; the block
                // cannot merge further.
                break;
            }

            // Both siblings are now free. Pull the buddy out of this order's
            // free list and continue one order up with the merged block,
            // which starts at the lower of the two offsets.
            let buddy_ofs = level.buddy_ofs(ofs);
            let buddy =
                NonZeroUsize::new(base.addr().get().checked_add(buddy_ofs).unwrap()).unwrap();

            unsafe { level.free.remove(base, buddy) };

            ofs &= !level.block_size();
            order += 1;
        }

        let block = NonZeroUsize::new(base.addr().get().checked_add(ofs).unwrap()).unwrap();

        unsafe { self.level_mut(order).free.push(base, block) };
    }

    /// Returns an iterator over the offset ranges of the free blocks of the
    /// given order.
    ///
    /// Ranges are relative to the region base and carry no ordering
    /// guarantee. This is a diagnostic aid; it makes no correctness
    /// promises beyond reflecting the free lists at the time of the call.
    ///
    /// # Panics
    ///
    /// Panics if `order` exceeds [`order_max`].
    ///
    /// [`order_max`]: Buddy::order_max
    pub fn free_ranges(&self, order: u32) -> FreeRanges<'_> {
        let level = self.level(order);

        FreeRanges {
            base: self.base,
            block_size: level.block_size(),
            // Free blocks stay within the region and hold initialized links,
            // and `&self` keeps the lists unmodified while the iterator
            // lives.
            inner: unsafe { level.free.iter(self.base) },
        }
    }

    /// Decomposes the allocator into its metadata pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called, and the free-list links written into the managed region are
    /// abandoned in place. The caller becomes responsible for the metadata
    /// region; the managed region is untouched, as always.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        let this = ManuallyDrop::new(self);

        this.metadata
    }

    #[cfg(test)]
    pub(crate) fn pair_bit(&self, order: u32, index: usize) -> bool {
        self.level(order)
            .pairs
            .as_ref()
            .expect("top order has no pair bitmap")
            .get(index)
    }
}

impl<A: BackingAllocator> Drop for Buddy<A> {
    fn drop(&mut self) {
        unsafe { self.backing.deallocate(self.metadata, self.metadata_layout) };
    }
}

impl<A: BackingAllocator> fmt::Debug for Buddy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Buddy {{")?;

        for order in 0..=self.order_max {
            let level = self.level(order);

            write!(f, "  order {order}:")?;

            if level.free.is_empty() {
                writeln!(f, " [ empty ]")?;
                continue;
            }

            writeln!(f)?;

            for range in self.free_ranges(order) {
                write!(f, "    free [{:#x}, {:#x})", range.start, range.end)?;

                if order < self.order_max {
                    let buddy_ofs = level.buddy_ofs(range.start);
                    writeln!(
                        f,
                        "  buddy [{:#x}, {:#x})",
                        buddy_ofs,
                        buddy_ofs + level.block_size()
                    )?;
                } else {
                    writeln!(f, "  no buddy")?;
                }
            }
        }

        write!(f, "}}")
    }
}

/// An iterator over the offset ranges of the free blocks of one order.
///
/// Returned by [`Buddy::free_ranges`].
#[derive(Debug)]
pub struct FreeRanges<'a> {
    base: BasePtr,
    block_size: usize,
    inner: list::Iter<'a>,
}

impl Iterator for FreeRanges<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        let addr = self.inner.next()?;
        let ofs = self.base.offset_to(addr);

        Some(ofs..ofs + self.block_size)
    }
}
