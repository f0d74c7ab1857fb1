#![cfg(test)]
extern crate std;

use core::{
    alloc::Layout,
    mem::{self, ManuallyDrop},
    ops::Range,
    ptr::NonNull,
    slice,
};

use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{polyfill::NonNullStrict, Buddy, Global};

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

#[derive(Clone, Debug)]
struct BuddyParams {
    unit_count: usize,
    unit_size: usize,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        BuddyParams {
            // 1 to 32 units of 32, 64 or 128 bytes.
            unit_count: 1 << (usize::arbitrary(g) % 6),
            unit_size: 32 << (usize::arbitrary(g) % 3),
        }
    }
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of the given order.
    ///
    /// Orders past `order_max` are generated on purpose; they must fail
    /// without disturbing the allocator.
    Allocate { order: u32 },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            AllocatorOp::Allocate {
                order: u32::arbitrary(g) % 8,
            }
        } else {
            AllocatorOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

type OpId = u32;

struct Allocation {
    id: OpId,
    ptr: NonNull<u8>,
    order: u32,
}

/// Drives a `Buddy<Global>` over a random op sequence, checking invariants
/// after every step.
struct Checker {
    buddy: ManuallyDrop<Buddy<Global>>,
    region: NonNull<u8>,
    region_layout: Layout,
    unit_count: usize,
    allocations: Vec<Allocation>,
    num_ops: u32,
}

impl Checker {
    fn new(params: &BuddyParams) -> Checker {
        let region_layout =
            Buddy::<Global>::region_layout(params.unit_count, params.unit_size).unwrap();

        unsafe {
            let region = NonNull::new(std::alloc::alloc(region_layout)).unwrap();
            let buddy = Buddy::try_new(region, params.unit_count, params.unit_size).unwrap();

            Checker {
                buddy: ManuallyDrop::new(buddy),
                region,
                region_layout,
                unit_count: params.unit_count,
                allocations: Vec::new(),
                num_ops: 0,
            }
        }
    }

    fn block_size(&self, order: u32) -> usize {
        self.buddy.unit_size() << order
    }

    /// Stamps an allocated block with its op id.
    fn stamp(&self, a: &Allocation) {
        let words = self.block_size(a.order) / 4;
        let slice = unsafe { slice::from_raw_parts_mut(a.ptr.as_ptr().cast::<u32>(), words) };
        slice.fill(a.id);
    }

    /// Checks that a block still carries its own stamp, i.e. that no other
    /// allocation overlapped it.
    fn verify_stamp(&self, a: &Allocation) -> bool {
        let words = self.block_size(a.order) / 4;
        let slice = unsafe { slice::from_raw_parts(a.ptr.as_ptr().cast::<u32>(), words) };
        slice.iter().copied().all(|word| word == a.id)
    }

    /// Checks the pair bits against the free lists: below the top order, a
    /// bit must be set exactly when one sibling of its pair is free at that
    /// order.
    fn parity_holds(&self) -> bool {
        for order in 0..self.buddy.order_max() {
            let block_size = self.block_size(order);

            let free_offsets: Vec<usize> =
                self.buddy.free_ranges(order).map(|r| r.start).collect();

            let num_pairs = self.unit_count >> (order + 1);
            for pair in 0..num_pairs {
                let lower = 2 * pair * block_size;
                let upper = lower + block_size;

                let expected =
                    free_offsets.contains(&lower) ^ free_offsets.contains(&upper);

                if self.buddy.pair_bit(order, pair) != expected {
                    return false;
                }
            }
        }

        true
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { order } => {
                if let Some(ptr) = self.buddy.allocate(order) {
                    // Blocks are aligned to their own size within the region.
                    let ofs = ptr.addr().get() - self.region.addr().get();
                    if ofs % self.block_size(order) != 0 {
                        return false;
                    }

                    let a = Allocation { id, ptr, order };
                    self.stamp(&a);
                    self.allocations.push(a);
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !self.verify_stamp(&a) {
                    return false;
                }

                unsafe { self.buddy.deallocate(a.ptr, a.order) };
            }
        }

        self.parity_holds()
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free every outstanding allocation; the region must coalesce back
        // into a single top-order block. The allocations are taken out of
        // `self` first so that the stamp checks can borrow it.
        for a in mem::take(&mut self.allocations) {
            if !self.verify_stamp(&a) {
                return false;
            }

            unsafe { self.buddy.deallocate(a.ptr, a.order) };
        }

        let top: Vec<Range<usize>> = self.buddy.free_ranges(self.buddy.order_max()).collect();

        top == [0..self.region_layout.size()] && self.parity_holds()
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.buddy);
            std::alloc::dealloc(self.region.as_ptr(), self.region_layout);
        }
    }
}

fn check_ops(params: BuddyParams, ops: Vec<AllocatorOp>) -> bool {
    Checker::new(&params).run(ops)
}

#[test]
fn run_drains_outstanding_allocations() {
    let params = BuddyParams {
        unit_count: 8,
        unit_size: 32,
    };

    // Leaves several allocations outstanding, so `run` itself must free and
    // stamp-check them before the coalescing check.
    let ops = [
        AllocatorOp::Allocate { order: 0 },
        AllocatorOp::Allocate { order: 1 },
        AllocatorOp::Allocate { order: 0 },
        AllocatorOp::Free { index: 1 },
        AllocatorOp::Allocate { order: 2 },
    ]
    .to_vec();

    assert!(Checker::new(&params).run(ops));
}

#[test]
fn random_ops_preserve_exclusivity_and_parity() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check_ops as fn(_, _) -> bool);
}

/// Collects the free table as sorted offset ranges, order by order.
fn table(buddy: &Buddy<Global>) -> Vec<Vec<Range<usize>>> {
    (0..=buddy.order_max())
        .map(|o| {
            let mut ranges: Vec<_> = buddy.free_ranges(o).collect();
            ranges.sort_by_key(|r| r.start);
            ranges
        })
        .collect()
}

fn check_round_trip(params: BuddyParams, ops: Vec<AllocatorOp>, order: u32) -> bool {
    let mut checker = Checker::new(&params);

    // Scramble the free table first.
    for op in ops {
        // Parity violations are caught by `random_ops_preserve_exclusivity_
        // and_parity`; here only the snapshot comparison matters.
        let _ = checker.do_op(op);
    }

    let order = order % (checker.buddy.order_max() + 1);
    let before = table(&checker.buddy);

    match checker.buddy.allocate(order) {
        Some(ptr) => unsafe { checker.buddy.deallocate(ptr, order) },
        // Exhaustion must leave the table untouched too.
        None => {}
    }

    table(&checker.buddy) == before
}

#[test]
fn allocate_then_free_restores_the_free_table() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check_round_trip as fn(_, _, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
