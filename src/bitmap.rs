//! Buddy-pair parity bitmaps.

use core::{alloc::Layout, mem};

/// A fixed-length bitmap backed by caller-provided `u64` words.
///
/// The buddy allocator keeps one bit per sibling pair at each order below the
/// top. A bit is toggled every time either sibling enters or leaves the free
/// state at that order, so bit = 1 means exactly one sibling is free and
/// bit = 0 means the pair is symmetric.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the layout of a region suitable to back a bitmap of `num_bits`
    /// bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u64>(Self::num_words(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits start cleared.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// [`Bitmap::map_layout`].
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Self::num_words(num_bits) * mem::size_of::<u64>()` bytes, and it
    ///   must be properly aligned.
    /// - The memory behind `map` must not be accessed except through the
    ///   returned bitmap for its lifetime.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        let num_words = Self::num_words(num_bits);

        for i in 0..(num_words as isize) {
            unsafe { map.offset(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    /// The number of `u64` words required to hold `num_bits` bits.
    #[inline]
    pub fn num_words(num_bits: usize) -> usize {
        (num_bits.checked_add(u64::BITS as usize - 1).unwrap())
            .checked_div(u64::BITS as usize)
            .unwrap()
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        let word_idx: isize = word_idx
            .try_into()
            .expect("get: index overflowed an isize");

        unsafe { self.map.offset(word_idx).read() & mask != 0 }
    }

    /// Toggles the value of the indexed bit.
    #[inline]
    pub fn toggle(&mut self, index: usize) {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        let word_idx: isize = word_idx
            .try_into()
            .expect("toggle: index overflowed an isize");

        unsafe {
            let word_ptr = self.map.offset(word_idx);
            let word = word_ptr.read();
            word_ptr.write(word ^ mask);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::mem::ManuallyDrop;
    use std::prelude::rust_2021::*;

    use super::*;

    struct VecBitmap {
        bitmap: ManuallyDrop<Bitmap>,
        len: usize,
        cap: usize,
    }

    impl VecBitmap {
        fn new(num_bits: usize) -> VecBitmap {
            let num_words = Bitmap::num_words(num_bits);

            let mut v = Vec::with_capacity(num_words);
            v.resize(num_words, 0);

            // TODO: use Vec::into_raw_parts when stable
            let mut v = ManuallyDrop::new(v);
            let map = v.as_mut_ptr();
            let len = v.len();
            let cap = v.capacity();

            VecBitmap {
                bitmap: ManuallyDrop::new(unsafe { Bitmap::new(num_bits, map) }),
                len,
                cap,
            }
        }
    }

    impl Drop for VecBitmap {
        fn drop(&mut self) {
            unsafe {
                let Bitmap { map, .. } = ManuallyDrop::take(&mut self.bitmap);

                // Reconstitute the original Vec.
                let v = Vec::from_raw_parts(map, self.len, self.cap);

                // Explicit for clarity.
                drop(v);
            }
        }
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let _ = VecBitmap::new(num_bits);
        }
    }

    #[test]
    fn toggle_flips_exactly_one_bit() {
        let mut vb = VecBitmap::new(130);

        assert!(!vb.bitmap.get(75));
        vb.bitmap.toggle(75);
        assert!(vb.bitmap.get(75));

        for bit in (0..130).filter(|&b| b != 75) {
            assert!(!vb.bitmap.get(bit));
        }

        vb.bitmap.toggle(75);
        assert!(!vb.bitmap.get(75));
    }
}
