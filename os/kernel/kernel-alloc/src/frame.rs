//! Per-frame bookkeeping.

use kernel_memory_addresses::FrameNumber;

/// Whether a frame currently belongs to the allocator or to someone else.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameState {
    /// Part of a block on one of the free lists.
    Free,
    /// Handed out; off every free list.
    Allocated,
}

/// Descriptor of one physical frame.
///
/// The `prev`/`next` links are only meaningful while the frame heads a free
/// block; they name neighbouring block heads on the same free list.
#[derive(Clone, Debug)]
pub struct PageInfo {
    pub(crate) refcount: u16,
    pub(crate) state: FrameState,
    /// Order of the free block this frame heads, if any.
    pub(crate) head_order: Option<u8>,
    pub(crate) prev: Option<FrameNumber>,
    pub(crate) next: Option<FrameNumber>,
}

impl PageInfo {
    pub(crate) const fn allocated() -> Self {
        Self {
            refcount: 0,
            state: FrameState::Allocated,
            head_order: None,
            prev: None,
            next: None,
        }
    }

    #[must_use]
    pub const fn refcount(&self) -> u16 {
        self.refcount
    }

    #[must_use]
    pub const fn state(&self) -> FrameState {
        self.state
    }

    /// Order of the free block starting at this frame.
    #[must_use]
    pub fn head_order(&self) -> Option<usize> {
        self.head_order.map(usize::from)
    }
}
