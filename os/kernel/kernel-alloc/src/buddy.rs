//! # Buddy Frame Allocator
//!
//! Physical memory is carved into power-of-two blocks of frames. A block of
//! order `o` spans `2^o` frames and starts at a frame number aligned to
//! `2^o`; its *buddy* is the block obtained by flipping bit `o` of the
//! start frame.
//!
//! ```text
//! order 2  [ 0 1 2 3 ][ 4 5 6 7 ]
//! order 1  [ 0 1 ][ 2 3 ]
//! order 0  [0][1]
//! ```
//!
//! - **Allocation** takes the first block of the requested order. When that
//!   list is empty a larger block is split repeatedly; each split keeps the
//!   lower half and pushes the upper half (the buddy) onto the list one
//!   order down.
//! - **Freeing** merges the block with its buddy for as long as the buddy is
//!   a whole free block of the same order, up to [`MAX_ORDER`].
//!
//! Every frame has a [`PageInfo`] descriptor in a flat arena; the free lists
//! are linked through frame numbers stored in that arena.

use crate::AllocError;
use crate::frame::{FrameState, PageInfo};
use crate::free_list::FreeList;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::memory::{MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::FrameNumber;
use kernel_vmem::FrameAlloc;
use log::{debug, info};

/// Boot-time description of the frame pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePoolConfig {
    /// Number of physical frames the arena describes.
    pub total_frames: usize,
    /// Frame ranges that never enter the pool.
    pub reserved: Vec<Range<usize>>,
}

impl FramePoolConfig {
    /// A pool of `total_frames` with nothing reserved.
    #[must_use]
    pub const fn new(total_frames: usize) -> Self {
        Self {
            total_frames,
            reserved: Vec::new(),
        }
    }

    /// Keep `range` out of the pool.
    #[must_use]
    pub fn reserve(mut self, range: Range<usize>) -> Self {
        self.reserved.push(range);
        self
    }

    fn is_reserved(&self, index: usize) -> bool {
        self.reserved.iter().any(|r| r.contains(&index))
    }
}

/// Binary buddy allocator over a frame descriptor arena.
///
/// Frames handed out have a reference count of zero. Reference counting is
/// layered on top through [`FrameAlloc`]; a frame returns to the pool only
/// when its last reference is dropped via [`FrameAlloc::decref`].
pub struct BuddyAllocator {
    frames: Vec<PageInfo>,
    free_lists: [FreeList; MAX_ORDER + 1],
}

impl BuddyAllocator {
    /// An arena of `total_frames` descriptors, every frame allocated.
    ///
    /// Nothing can be allocated until frames are handed over with
    /// [`release_range`](Self::release_range).
    #[must_use]
    pub fn new(total_frames: usize) -> Self {
        Self {
            frames: (0..total_frames).map(|_| PageInfo::allocated()).collect(),
            free_lists: core::array::from_fn(|_| FreeList::new()),
        }
    }

    /// Build the pool described by `config`, releasing every frame not
    /// listed as reserved.
    #[must_use]
    pub fn from_config(config: &FramePoolConfig) -> Self {
        let mut pool = Self::new(config.total_frames);
        for index in (0..config.total_frames).filter(|&i| !config.is_reserved(i)) {
            pool.free(FrameNumber::from_index(index), 0);
        }
        info!(
            "frame pool: {} of {} frames usable ({} KiB)",
            pool.free_frames(),
            config.total_frames,
            pool.free_frames() * PAGE_SIZE as usize / 1024
        );
        pool
    }

    /// Hand the frames in `range` to the pool one at a time, merging as it
    /// goes.
    ///
    /// # Panics
    /// - If any frame in `range` is already free or lies outside the arena.
    pub fn release_range(&mut self, range: Range<usize>) {
        for index in range {
            self.free(FrameNumber::from_index(index), 0);
        }
    }

    /// Allocate a block of `2^order` contiguous frames.
    ///
    /// # Errors
    /// - [`AllocError::OutOfMemory`] if no block of `order` or larger is free.
    ///
    /// # Panics
    /// - If `order > MAX_ORDER`.
    pub fn allocate(&mut self, order: usize) -> Result<FrameNumber, AllocError> {
        assert!(order <= MAX_ORDER, "order {order} exceeds MAX_ORDER");

        let mut found = None;
        for current in order..=MAX_ORDER {
            if let Some(head) = self.free_lists[current].pop_front(&mut self.frames) {
                found = Some((head, current));
                break;
            }
        }
        let Some((block, mut current)) = found else {
            debug!("buddy: no block of order {order} or above");
            return Err(AllocError::OutOfMemory { order });
        };
        self.frames[block.index()].head_order = None;

        while current > order {
            current -= 1;
            let buddy = block.buddy(current);
            debug!("buddy: split {block} at order {}, {buddy} stays free", current + 1);
            self.frames[buddy.index()].head_order = Some(order_tag(current));
            self.free_lists[current].push_front(&mut self.frames, buddy);
        }

        for info in &mut self.frames[block.index()..][..1 << order] {
            *info = PageInfo::allocated();
        }
        Ok(block)
    }

    /// Return a block of `2^order` frames starting at `block`.
    ///
    /// # Panics
    /// - If `block` is not aligned to `2^order`.
    /// - If any frame of the block is free or still referenced.
    pub fn free(&mut self, block: FrameNumber, order: usize) {
        assert!(order <= MAX_ORDER, "order {order} exceeds MAX_ORDER");
        assert!(
            block.is_aligned_to(order),
            "{block} is not aligned to order {order}"
        );
        assert!(
            block.index() + (1 << order) <= self.frames.len(),
            "{block} order {order} lies outside the frame arena"
        );
        let frames = (block.as_u32()..).map(FrameNumber::new);
        for (frame, info) in frames.zip(&mut self.frames[block.index()..][..1 << order]) {
            assert_eq!(info.state, FrameState::Allocated, "double free of {frame}");
            assert_eq!(info.refcount, 0, "freeing referenced frame {frame}");
            info.state = FrameState::Free;
        }

        let mut head = block;
        let mut current = order;
        while current < MAX_ORDER {
            let buddy = head.buddy(current);
            if !self.heads_free_block(buddy, current) {
                break;
            }
            debug!("buddy: merge {head} with {buddy} at order {current}");
            self.free_lists[current].remove(&mut self.frames, buddy);
            self.frames[buddy.index()].head_order = None;
            head = head.min(buddy);
            current += 1;
        }
        self.frames[head.index()].head_order = Some(order_tag(current));
        self.free_lists[current].push_front(&mut self.frames, head);
    }

    fn heads_free_block(&self, frame: FrameNumber, order: usize) -> bool {
        self.frames
            .get(frame.index())
            .is_some_and(|info| info.head_order == Some(order_tag(order)))
    }

    /// Smallest order whose block covers `bytes`, or `None` if even a
    /// [`MAX_ORDER`] block is too small.
    ///
    /// ```rust
    /// # use kernel_alloc::buddy::BuddyAllocator;
    /// assert_eq!(BuddyAllocator::order_for_size(1), Some(0));
    /// assert_eq!(BuddyAllocator::order_for_size(4096), Some(0));
    /// assert_eq!(BuddyAllocator::order_for_size(4097), Some(1));
    /// assert_eq!(BuddyAllocator::order_for_size(3 * 4096), Some(2));
    /// ```
    #[must_use]
    pub fn order_for_size(bytes: usize) -> Option<usize> {
        let pages = bytes.div_ceil(PAGE_SIZE as usize).max(1);
        let order = pages.next_power_of_two().trailing_zeros() as usize;
        (order <= MAX_ORDER).then_some(order)
    }

    /// Number of frames the arena describes.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Descriptor of `frame`.
    ///
    /// # Panics
    /// If `frame` lies outside the frame arena.
    #[must_use]
    pub fn info(&self, frame: FrameNumber) -> &PageInfo {
        &self.frames[frame.index()]
    }

    /// # Panics
    /// If `frame` lies outside the frame arena.
    #[must_use]
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.frames[frame.index()].state == FrameState::Allocated
    }

    /// Heads of the free blocks of `order`, in allocation order.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> Vec<FrameNumber> {
        self.free_lists[order].iter(&self.frames).collect()
    }

    #[must_use]
    pub fn free_block_count(&self, order: usize) -> usize {
        self.free_lists[order].len()
    }

    /// Total number of free frames across all orders.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }

    /// Report the number of free blocks per order.
    pub fn log_free_lists(&self) {
        for (order, list) in self.free_lists.iter().enumerate() {
            info!("free blocks of order {order:02}: {}", list.len());
        }
        info!(
            "available memory: {} KiB",
            self.free_frames() * PAGE_SIZE as usize / 1024
        );
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn order_tag(order: usize) -> u8 {
    order as u8
}

impl FrameAlloc for BuddyAllocator {
    fn alloc_frame(&mut self) -> Option<FrameNumber> {
        self.allocate(0).ok()
    }

    fn free_frame(&mut self, frame: FrameNumber) {
        self.free(frame, 0);
    }

    fn refcount(&self, frame: FrameNumber) -> u16 {
        self.frames[frame.index()].refcount
    }

    fn incref(&mut self, frame: FrameNumber) {
        let info = &mut self.frames[frame.index()];
        debug_assert_eq!(info.state, FrameState::Allocated, "incref on free {frame}");
        info.refcount += 1;
    }

    fn release(&mut self, frame: FrameNumber) {
        let info = &mut self.frames[frame.index()];
        assert!(info.refcount > 0, "reference count underflow on {frame}");
        info.refcount -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(n: u32) -> FrameNumber {
        FrameNumber::new(n)
    }

    #[test]
    fn empty_arena_cannot_allocate() {
        let mut pool = BuddyAllocator::new(16);
        assert_eq!(pool.allocate(0), Err(AllocError::OutOfMemory { order: 0 }));
        assert_eq!(pool.free_frames(), 0);
    }

    #[test]
    fn release_merges_into_largest_blocks() {
        let mut pool = BuddyAllocator::new(16);
        pool.release_range(0..16);
        assert_eq!(pool.free_blocks(4), [f(0)]);
        assert_eq!(pool.free_frames(), 16);
        for order in 0..4 {
            assert_eq!(pool.free_block_count(order), 0);
        }
    }

    #[test]
    fn reserved_frame_zero_stays_out() {
        let pool = BuddyAllocator::from_config(&FramePoolConfig::new(8).reserve(0..1));
        assert!(pool.is_allocated(f(0)));
        assert_eq!(pool.free_blocks(0), [f(1)]);
        assert_eq!(pool.free_blocks(1), [f(2)]);
        assert_eq!(pool.free_blocks(2), [f(4)]);
        assert_eq!(pool.free_frames(), 7);
    }

    #[test]
    fn allocation_splits_and_marks_frames() {
        let mut pool = BuddyAllocator::new(8);
        pool.release_range(0..8);
        let block = pool.allocate(1).unwrap();
        assert_eq!(block, f(0));
        assert!(pool.is_allocated(f(0)) && pool.is_allocated(f(1)));
        assert!(!pool.is_allocated(f(2)));
        assert_eq!(pool.free_blocks(1), [f(2)]);
        assert_eq!(pool.free_blocks(2), [f(4)]);
        assert_eq!(pool.info(f(1)).refcount(), 0);
    }

    #[test]
    fn order_for_size_rejects_oversized_requests() {
        assert_eq!(BuddyAllocator::order_for_size(0), Some(0));
        assert_eq!(BuddyAllocator::order_for_size(2048 * 4096), Some(11));
        assert_eq!(BuddyAllocator::order_for_size(2048 * 4096 + 1), None);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn misaligned_free_panics() {
        let mut pool = BuddyAllocator::new(8);
        pool.free(f(1), 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut pool = BuddyAllocator::new(8);
        pool.release_range(0..8);
        pool.free(f(3), 0);
    }

    #[test]
    #[should_panic(expected = "freeing referenced frame #2")]
    fn free_names_the_referenced_frame_inside_a_block() {
        let mut pool = BuddyAllocator::new(8);
        pool.release_range(0..8);
        let block = pool.allocate(2).unwrap();
        pool.incref(block + 2);
        pool.free(block, 2);
    }

    #[test]
    #[should_panic(expected = "exceeds MAX_ORDER")]
    fn order_beyond_max_panics() {
        let mut pool = BuddyAllocator::new(8);
        let _ = pool.allocate(MAX_ORDER + 1);
    }

    #[test]
    fn decref_returns_frame_to_pool() {
        let mut pool = BuddyAllocator::new(4);
        pool.release_range(0..4);
        let frame = pool.alloc_frame().unwrap();
        pool.incref(frame);
        pool.incref(frame);
        assert!(!pool.decref(frame));
        assert!(pool.is_allocated(frame));
        assert!(pool.decref(frame));
        assert_eq!(pool.free_blocks(2), [f(0)]);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn release_below_zero_panics() {
        let mut pool = BuddyAllocator::new(4);
        pool.release_range(0..4);
        let frame = pool.alloc_frame().unwrap();
        pool.release(frame);
    }
}
