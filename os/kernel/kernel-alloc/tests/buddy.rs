use kernel_alloc::AllocError;
use kernel_alloc::buddy::{BuddyAllocator, FramePoolConfig};
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::FrameNumber;
use kernel_vmem::FrameAlloc;
use proptest::prelude::*;

fn f(n: u32) -> FrameNumber {
    FrameNumber::new(n)
}

fn pristine(total: usize) -> BuddyAllocator {
    BuddyAllocator::from_config(&FramePoolConfig::new(total))
}

fn snapshot(pool: &BuddyAllocator) -> Vec<Vec<FrameNumber>> {
    (0..=MAX_ORDER).map(|o| pool.free_blocks(o)).collect()
}

#[test]
fn single_frame_from_a_max_order_block() {
    let mut pool = pristine(2048);
    assert_eq!(pool.free_blocks(MAX_ORDER), [f(0)]);

    assert_eq!(pool.allocate(0), Ok(f(0)));

    assert_eq!(pool.free_block_count(MAX_ORDER), 0);
    for order in 1..MAX_ORDER {
        assert_eq!(pool.free_blocks(order), [f(1 << order)], "order {order}");
    }
    assert_eq!(pool.free_blocks(0), [f(1)]);
    assert_eq!(pool.free_frames(), 2047);
}

#[test]
fn exhaustion_reports_requested_order() {
    let mut pool = pristine(4);
    assert_eq!(pool.allocate(2), Ok(f(0)));
    assert_eq!(pool.allocate(0), Err(AllocError::OutOfMemory { order: 0 }));
    assert_eq!(pool.alloc_frame(), None);
    pool.free(f(0), 2);
    assert_eq!(pool.alloc_frame(), Some(f(0)));
}

#[test]
fn larger_orders_are_used_when_small_lists_are_empty() {
    let mut pool = pristine(16);
    let a = pool.allocate(3).unwrap();
    let b = pool.allocate(2).unwrap();
    let c = pool.allocate(2).unwrap();
    assert_eq!((a, b, c), (f(0), f(8), f(12)));
    assert_eq!(pool.free_frames(), 0);

    pool.free(b, 2);
    pool.free(a, 3);
    pool.free(c, 2);
    assert_eq!(pool.free_blocks(4), [f(0)]);
}

#[test]
fn reserved_ranges_split_the_pool() {
    let config = FramePoolConfig::new(32).reserve(0..1).reserve(8..16);
    let mut pool = BuddyAllocator::from_config(&config);
    assert_eq!(pool.free_frames(), 23);
    assert!(pool.is_allocated(f(0)));
    assert!((8..16).all(|i| pool.is_allocated(f(i))));
    assert_eq!(pool.free_blocks(4), [f(16)]);

    // Late release of a reserved range merges with its neighbours.
    pool.release_range(8..16);
    assert_eq!(pool.free_blocks(3), [f(8)]);
    assert_eq!(pool.free_frames(), 31);
    assert_eq!(pool.allocate(3), Ok(f(8)));
}

#[test]
fn arena_tail_without_a_buddy_stays_split() {
    let pool = pristine(6);
    assert_eq!(pool.free_blocks(2), [f(0)]);
    assert_eq!(pool.free_blocks(1), [f(4)]);
    assert_eq!(pool.free_frames(), 6);
}

proptest! {
    #[test]
    fn allocate_then_free_restores_free_lists(order in 0..=MAX_ORDER) {
        let mut pool = pristine(4096);
        let before = snapshot(&pool);
        let block = pool.allocate(order).unwrap();
        prop_assert!(block.is_aligned_to(order));
        pool.free(block, order);
        prop_assert_eq!(snapshot(&pool), before);
    }

    #[test]
    fn siblings_merge_in_either_order(order in 0..MAX_ORDER, low_first in any::<bool>()) {
        let mut pool = pristine(2 << order);
        let low = pool.allocate(order).unwrap();
        let high = pool.allocate(order).unwrap();
        prop_assert_eq!(high, low.buddy(order));

        let (first, second) = if low_first { (low, high) } else { (high, low) };
        pool.free(first, order);
        prop_assert_eq!(pool.free_blocks(order), vec![first]);
        pool.free(second, order);
        prop_assert_eq!(pool.free_block_count(order), 0);
        prop_assert_eq!(pool.free_blocks(order + 1), vec![f(0)]);
    }

    #[test]
    fn non_siblings_stay_apart(order in 0..MAX_ORDER) {
        let mut pool = BuddyAllocator::new(4 << order);
        let a = f(1 << order);
        let b = f(2 << order);
        pool.free(a, order);
        pool.free(b, order);
        prop_assert_eq!(pool.free_block_count(order), 2);
        prop_assert_eq!(pool.free_block_count(order + 1), 0);
    }

    #[test]
    fn random_traffic_conserves_frames(
        ops in prop::collection::vec((0usize..5, prop::option::of(any::<usize>())), 1..64)
    ) {
        const TOTAL: usize = 256;
        let mut pool = pristine(TOTAL);
        let initial = snapshot(&pool);
        let mut held: Vec<(FrameNumber, usize)> = Vec::new();

        for (order, pick) in ops {
            match pick {
                Some(i) if !held.is_empty() => {
                    let (block, order) = held.swap_remove(i % held.len());
                    pool.free(block, order);
                }
                _ => {
                    if let Ok(block) = pool.allocate(order) {
                        prop_assert!(block.is_aligned_to(order));
                        held.push((block, order));
                    }
                }
            }

            let in_use: usize = held.iter().map(|&(_, o)| 1usize << o).sum();
            prop_assert_eq!(pool.free_frames() + in_use, TOTAL);
            for (i, &(a, oa)) in held.iter().enumerate() {
                prop_assert!(pool.is_allocated(a));
                for &(b, ob) in &held[i + 1..] {
                    let a_end = a.index() + (1 << oa);
                    let b_end = b.index() + (1 << ob);
                    prop_assert!(a_end <= b.index() || b_end <= a.index(), "{a} overlaps {b}");
                }
            }
        }

        for (block, order) in held {
            pool.free(block, order);
        }
        prop_assert_eq!(snapshot(&pool), initial);
    }
}
