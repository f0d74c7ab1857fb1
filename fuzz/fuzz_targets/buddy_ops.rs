#![no_main]

use std::ptr::NonNull;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ordalloc::{Buddy, Global};

const UNIT_SIZE: usize = 32;

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(u32),
    Deallocate(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    unit_count_log2: u8,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let unit_count = 1usize << (args.unit_count_log2 % 8);

    let region_layout = Buddy::<Global>::region_layout(unit_count, UNIT_SIZE)
        .expect("power-of-two configuration was rejected");

    let region = match NonNull::new(unsafe { std::alloc::alloc(region_layout) }) {
        Some(r) => r,
        None => return,
    };

    let mut alloc = match unsafe { Buddy::try_new(region, unit_count, UNIT_SIZE) } {
        Ok(a) => a,
        Err(_) => {
            unsafe { std::alloc::dealloc(region.as_ptr(), region_layout) };
            return;
        }
    };

    let mut outstanding: Vec<(NonNull<u8>, u32)> = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Allocate(order) => {
                // One past order_max, to exercise the exhaustion path.
                let order = order % (alloc.order_max() + 2);
                if let Some(block) = alloc.allocate(order) {
                    outstanding.push((block, order));
                }
            }

            BuddyOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let (block, order) = outstanding.swap_remove(idx);
                unsafe { alloc.deallocate(block, order) };
            }
        }
    }

    drop(alloc);
    unsafe { std::alloc::dealloc(region.as_ptr(), region_layout) };
});
