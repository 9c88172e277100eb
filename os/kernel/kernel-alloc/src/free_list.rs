use crate::frame::PageInfo;
use kernel_memory_addresses::FrameNumber;

/// Doubly linked list of free block heads, threaded through the frame
/// descriptor arena.
///
/// ```text
///  head ──► [#8] ◄──► [#12] ◄──► [#4] ──► None
/// ```
///
/// - Links are frame numbers, not pointers; the arena owns the nodes.
/// - Insertion and removal are O(1); removal works on any member, which
///   coalescing needs to unlink a buddy from the middle of a list.
///
/// # Invariants
/// - Every member heads a free block of this list's order.
/// - A frame is a member of at most one list.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<FrameNumber>,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Insert `frame` in front of the current head.
    pub(crate) fn push_front(&mut self, arena: &mut [PageInfo], frame: FrameNumber) {
        let old = self.head;
        {
            let node = &mut arena[frame.index()];
            node.prev = None;
            node.next = old;
        }
        if let Some(old) = old {
            arena[old.index()].prev = Some(frame);
        }
        self.head = Some(frame);
        self.len += 1;
    }

    /// Detach and return the head.
    pub(crate) fn pop_front(&mut self, arena: &mut [PageInfo]) -> Option<FrameNumber> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Unlink `frame`, which must be a member of this list.
    pub(crate) fn remove(&mut self, arena: &mut [PageInfo], frame: FrameNumber) {
        let (prev, next) = {
            let node = &mut arena[frame.index()];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => arena[prev.index()].next = next,
            None => {
                debug_assert_eq!(self.head, Some(frame), "{frame} is not on this list");
                self.head = next;
            }
        }
        if let Some(next) = next {
            arena[next.index()].prev = prev;
        }
        self.len -= 1;
    }

    /// Members from head to tail.
    pub(crate) fn iter<'a>(&self, arena: &'a [PageInfo]) -> impl Iterator<Item = FrameNumber> + 'a {
        core::iter::successors(self.head, move |f| arena[f.index()].next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn arena(n: usize) -> Vec<PageInfo> {
        (0..n).map(|_| PageInfo::allocated()).collect()
    }

    fn members(list: &FreeList, arena: &[PageInfo]) -> Vec<u32> {
        list.iter(arena).map(FrameNumber::as_u32).collect()
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut a = arena(8);
        let mut list = FreeList::new();
        list.push_front(&mut a, FrameNumber::new(4));
        list.push_front(&mut a, FrameNumber::new(2));
        assert_eq!(members(&list, &a), [2, 4]);
        assert_eq!(list.pop_front(&mut a), Some(FrameNumber::new(2)));
        assert_eq!(list.pop_front(&mut a), Some(FrameNumber::new(4)));
        assert_eq!(list.pop_front(&mut a), None);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn remove_from_middle_and_ends() {
        let mut a = arena(8);
        let mut list = FreeList::new();
        for f in [1, 3, 5, 7] {
            list.push_front(&mut a, FrameNumber::new(f));
        }
        list.remove(&mut a, FrameNumber::new(3));
        assert_eq!(members(&list, &a), [7, 5, 1]);
        list.remove(&mut a, FrameNumber::new(7));
        assert_eq!(members(&list, &a), [5, 1]);
        list.remove(&mut a, FrameNumber::new(1));
        assert_eq!(members(&list, &a), [5]);
        assert_eq!(list.len(), 1);
        assert!(a[1].prev.is_none() && a[1].next.is_none());
    }
}
