//! # Buddy frame allocator
//!
//! Physical frames are handed out in blocks of `2^order` frames,
//! `0 ≤ order ≤ MAX_ORDER`. A block of order `k` always starts at a frame
//! number divisible by `2^k`; its buddy is the block whose frame number
//! differs only in bit `k`.
//!
//! ```text
//!  order 2:  [ 0  1  2  3 ][ 4  5  6  7 ]    buddies: 0 ⇄ 4
//!  order 1:  [ 0  1 ][ 2  3 ]                buddies: 0 ⇄ 2, 4 ⇄ 6
//!  order 0:  [0][1]                          buddies: 0 ⇄ 1, 2 ⇄ 3
//! ```
//!
//! ## Allocation
//! Take the first block from the lowest non-empty list at or above the
//! requested order. While it is too large, split it and put the upper half
//! on the list one order down.
//!
//! ## Free
//! While the buddy is a free block of the same order, unlink it and merge.
//! The merged block goes to the head of its list, so the next allocation
//! of that order reuses it.
//!
//! ## Corruption
//! Every free is checked against the recorded state of the frame. A frame
//! that is already free, a stale order or a foreign frame means the lists
//! can no longer be trusted; the allocator hands the fault to its
//! [`Halt`] capability.
//!
//! ## Locking
//! One [`SpinLock`] guards all lists, taken with interrupts masked so the
//! allocator can be entered from interrupt handlers.

use crate::free_list::{FreeAreas, NodeState, NodeTag, Placement};
use crate::{Corruption, Halt, MemoryError};
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE};
use kernel_sync::{InterruptControl, SpinLock};
use log::{info, trace};

/// Frames in a block of `order`.
#[inline]
#[must_use]
pub const fn block_frames(order: usize) -> u64 {
    1 << order
}

/// [`block_frames`] as an arena index distance; `order ≤ MAX_ORDER`.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn span(order: usize) -> u32 {
    block_frames(order) as u32
}

struct BuddyState {
    areas: FreeAreas,
    free_frames: u64,
}

pub struct FrameAllocator<'c> {
    base: FrameNumber,
    count: u32,
    state: SpinLock<BuddyState>,
    irq: &'c dyn InterruptControl,
    halt: &'c dyn Halt,
}

impl<'c> FrameAllocator<'c> {
    /// Manage `count` frames starting at `base`, all of them free.
    ///
    /// # Errors
    /// See [`empty`](Self::empty).
    pub fn new(
        base: FrameNumber,
        count: u64,
        irq: &'c dyn InterruptControl,
        halt: &'c dyn Halt,
    ) -> Result<Self, MemoryError> {
        let alloc = Self::empty(base, count, irq, halt)?;
        alloc.add_free_range(base, base + count)?;
        Ok(alloc)
    }

    /// Manage `count` frames starting at `base`, all of them reserved until
    /// handed over with [`add_free_range`](Self::add_free_range).
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] if `count` is zero.
    /// - [`MemoryError::AddressOverflow`] if the range wraps or has more
    ///   frames than the node arena can index.
    pub fn empty(
        base: FrameNumber,
        count: u64,
        irq: &'c dyn InterruptControl,
        halt: &'c dyn Halt,
    ) -> Result<Self, MemoryError> {
        if count == 0 {
            return Err(MemoryError::EmptyRegion);
        }
        let overflow = MemoryError::AddressOverflow {
            base: base.base().as_u64(),
            size: count.saturating_mul(PAGE_SIZE),
        };
        let frames = u32::try_from(count)
            .ok()
            .filter(|&n| n < u32::MAX)
            .ok_or(overflow)?;
        base.as_u64()
            .checked_add(count)
            .filter(|end| end.checked_mul(PAGE_SIZE).is_some())
            .ok_or(overflow)?;

        Ok(Self {
            base,
            count: frames,
            state: SpinLock::new(BuddyState {
                areas: FreeAreas::new(frames),
                free_frames: 0,
            }),
            irq,
            halt,
        })
    }

    /// First managed frame.
    #[must_use]
    pub const fn base(&self) -> FrameNumber {
        self.base
    }

    /// Number of managed frames, free or not.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        u64::from(self.count)
    }

    /// Whether `frame` lies in the managed range.
    #[must_use]
    pub fn contains(&self, frame: FrameNumber) -> bool {
        self.index_of(frame).is_some()
    }

    /// Hand the reserved frames `[start, end)` to the allocator.
    ///
    /// The range is carved into the largest naturally aligned blocks that
    /// fit. Blocks are appended to their lists in ascending address order and
    /// merged with free neighbors handed over earlier.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] if the range is empty.
    /// - [`MemoryError::AddressOverflow`] if it leaves the managed range.
    /// - [`MemoryError::Overlap`] if any frame in it is not reserved.
    pub fn add_free_range(&self, start: FrameNumber, end: FrameNumber) -> Result<(), MemoryError> {
        let size = end.as_u64().saturating_sub(start.as_u64()).saturating_mul(PAGE_SIZE);
        if end <= start {
            return Err(MemoryError::EmptyRegion);
        }
        let (Some(first), true) = (self.index_of(start), end.as_u64() <= self.end()) else {
            return Err(MemoryError::AddressOverflow {
                base: start.base().as_u64(),
                size,
            });
        };
        let last = self.offset(end.as_u64());

        let mut guard = self.state.lock_irq(self.irq);
        let st = &mut *guard;
        if (first..last).any(|i| st.areas.tag(i).state() != NodeState::Reserved) {
            return Err(MemoryError::Overlap {
                base: start.base().as_u64(),
                size,
            });
        }
        for i in first..last {
            st.areas.set_tag(i, NodeTag::tail());
        }

        let mut frame = start.as_u64();
        let mut blocks = 0usize;
        while frame < end.as_u64() {
            let order = (0..=MAX_ORDER)
                .rev()
                .find(|&k| frame.is_multiple_of(block_frames(k)) && frame + block_frames(k) <= end.as_u64())
                .unwrap_or(0);
            self.release_block(st, FrameNumber::new(frame), order, Placement::Tail);
            frame += block_frames(order);
            blocks += 1;
        }
        drop(guard);

        info!(
            "frames: seeded {start}..{end} ({} frames, {blocks} blocks)",
            end.as_u64() - start.as_u64()
        );
        Ok(())
    }

    /// Allocate a block of `2^order` frames and return its first frame.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidOrder`] if `order > MAX_ORDER`.
    /// - [`MemoryError::OutOfMemory`] if no block of at least `order` is free.
    pub fn allocate(&self, order: usize) -> Result<FrameNumber, MemoryError> {
        if order > MAX_ORDER {
            return Err(MemoryError::InvalidOrder { order, max: MAX_ORDER });
        }

        let mut guard = self.state.lock_irq(self.irq);
        let st = &mut *guard;
        let Some(found) = (order..=MAX_ORDER).find(|&k| st.areas.len(k) > 0) else {
            trace!("frames: order {order} out of memory");
            return Err(MemoryError::OutOfMemory);
        };
        let Some(index) = st.areas.pop(found) else {
            return Err(MemoryError::OutOfMemory);
        };
        if !st.areas.tag(index).is(NodeState::Free, found) {
            drop(guard);
            self.halt.halt(
                Corruption::CorruptFreeList {
                    frame: self.frame_at(index),
                    order: found,
                    detail: "listed block is not a free head of this order",
                },
                "allocate",
            );
        }

        let mut level = found;
        while level > order {
            level -= 1;
            let upper = index + span(level);
            st.areas.insert(level, upper, Placement::Head);
        }
        st.areas.set_tag(index, NodeTag::head(NodeState::Allocated, order));
        st.free_frames -= block_frames(order);
        drop(guard);

        let frame = self.frame_at(index);
        trace!("frames: allocate order {order} -> {frame}");
        Ok(frame)
    }

    /// Return a block obtained from [`allocate`](Self::allocate) with the same `order`.
    ///
    /// Halts on a frame that is not the head of an allocated block of exactly
    /// `order`: double frees, stale orders and foreign frames are all fatal.
    pub fn free(&self, frame: FrameNumber, order: usize) {
        let Some(index) = self.index_of(frame) else {
            self.halt.halt(Corruption::UnknownFrame { frame }, "free");
        };

        let mut guard = self.state.lock_irq(self.irq);
        let st = &mut *guard;
        let tag = st.areas.tag(index);
        if !tag.is(NodeState::Allocated, order) {
            let fault = self.classify_bad_free(&st.areas, frame, order, tag);
            drop(guard);
            self.halt.halt(fault, "free");
        }

        self.release_block(st, frame, order, Placement::Head);
        drop(guard);
        trace!("frames: free order {order} <- {frame}");
    }

    /// Turn an allocated block into `2^order` individually freeable order-0 frames.
    ///
    /// Halts if `frame` is not the head of an allocated block of `order`.
    pub fn split_allocated(&self, frame: FrameNumber, order: usize) {
        let Some(index) = self.index_of(frame) else {
            self.halt.halt(Corruption::UnknownFrame { frame }, "split");
        };
        let mut guard = self.state.lock_irq(self.irq);
        let st = &mut *guard;
        let tag = st.areas.tag(index);
        if !tag.is(NodeState::Allocated, order) {
            let fault = self.classify_bad_free(&st.areas, frame, order, tag);
            drop(guard);
            self.halt.halt(fault, "split");
        }
        for i in index..index + span(order) {
            st.areas.set_tag(i, NodeTag::head(NodeState::Allocated, 0));
        }
    }

    /// Frames currently free, across all orders.
    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.state.lock_irq(self.irq).free_frames
    }

    /// Number of free blocks of exactly `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        if order > MAX_ORDER {
            return 0;
        }
        self.state.lock_irq(self.irq).areas.len(order)
    }

    /// Free blocks of `order`, in the order `allocate` would hand them out.
    #[must_use]
    pub fn free_list(&self, order: usize) -> Vec<FrameNumber> {
        if order > MAX_ORDER {
            return Vec::new();
        }
        let st = self.state.lock_irq(self.irq);
        st.areas.iter(order).map(|i| self.frame_at(i)).collect()
    }

    /// Whether `frame` is the head of an allocated block.
    #[must_use]
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.index_of(frame)
            .is_some_and(|i| self.state.lock_irq(self.irq).areas.tag(i).state() == NodeState::Allocated)
    }

    /// Free `frame` (order `order`) into the lists, merging with free buddies.
    fn release_block(&self, st: &mut BuddyState, frame: FrameNumber, order: usize, placement: Placement) {
        let mut head = frame.as_u64();
        let mut level = order;
        st.areas.set_tag(self.offset(head), NodeTag::tail());

        while level < MAX_ORDER {
            let buddy = head ^ block_frames(level);
            let Some(b) = self.index_of(FrameNumber::new(buddy)) else {
                break;
            };
            let tag = st.areas.tag(b);
            if tag.state() != NodeState::Free {
                break;
            }
            if tag.order_usize() > level {
                self.halt.halt(
                    Corruption::CorruptFreeList {
                        frame: FrameNumber::new(buddy),
                        order: tag.order_usize(),
                        detail: "free buddy overlaps the block being freed",
                    },
                    "free",
                );
            }
            if tag.order_usize() < level {
                break;
            }
            st.areas.remove(level, b);
            st.areas.set_tag(b, NodeTag::tail());
            head = head.min(buddy);
            level += 1;
        }

        st.areas.insert(level, self.offset(head), placement);
        st.free_frames += block_frames(order);
    }

    /// Explain why freeing `frame` at `order` is invalid.
    fn classify_bad_free(&self, areas: &FreeAreas, frame: FrameNumber, order: usize, tag: NodeTag) -> Corruption {
        let inside_free_block = (0..=MAX_ORDER).any(|k| {
            let head = frame.as_u64() & !(block_frames(k) - 1);
            self.index_of(FrameNumber::new(head)).is_some_and(|h| {
                let t = areas.tag(h);
                t.state() == NodeState::Free && t.order_usize() >= k
            })
        });
        if inside_free_block {
            return Corruption::DoubleFree { frame, order };
        }
        let detail = match tag.state() {
            NodeState::Allocated => "order does not match the allocation",
            NodeState::Reserved => "frame was never handed to the allocator",
            _ => "frame is not the head of an allocated block",
        };
        Corruption::CorruptFreeList { frame, order, detail }
    }

    fn end(&self) -> u64 {
        self.base.as_u64() + u64::from(self.count)
    }

    /// Arena index of frame number `f`; the caller has checked the range
    /// (`f == end()` is allowed as an exclusive bound).
    #[allow(clippy::cast_possible_truncation)]
    fn offset(&self, f: u64) -> u32 {
        debug_assert!(f >= self.base.as_u64() && f <= self.end());
        (f - self.base.as_u64()) as u32
    }

    fn index_of(&self, frame: FrameNumber) -> Option<u32> {
        let f = frame.as_u64();
        (f >= self.base.as_u64() && f < self.end()).then(|| self.offset(f))
    }

    fn frame_at(&self, index: u32) -> FrameNumber {
        self.base + u64::from(index)
    }
}

impl fmt::Debug for FrameAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("free_frames", &self.free_frames())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PanicHalt;
    use kernel_sync::NoInterrupts;

    fn small(base: u64, count: u64) -> FrameAllocator<'static> {
        FrameAllocator::new(FrameNumber::new(base), count, &NoInterrupts, &PanicHalt).unwrap()
    }

    fn f(n: u64) -> FrameNumber {
        FrameNumber::new(n)
    }

    #[test]
    fn seeding_carves_aligned_blocks() {
        // 3..21 = [3] [4..8) [8..16) [16..20) [20]
        let a = small(3, 18);
        assert_eq!(a.free_frames(), 18);
        assert_eq!(a.free_list(0), vec![f(3), f(20)]);
        assert_eq!(a.free_list(2), vec![f(4), f(16)]);
        assert_eq!(a.free_list(3), vec![f(8)]);
    }

    #[test]
    fn split_pushes_upper_halves() {
        let a = small(0, 16);
        assert_eq!(a.allocate(0), Ok(f(0)));
        assert_eq!(a.free_list(0), vec![f(1)]);
        assert_eq!(a.free_list(1), vec![f(2)]);
        assert_eq!(a.free_list(2), vec![f(4)]);
        assert_eq!(a.free_list(3), vec![f(8)]);
        assert_eq!(a.free_frames(), 15);
    }

    #[test]
    fn free_merges_back_to_one_block() {
        let a = small(0, 16);
        let x = a.allocate(0).unwrap();
        a.free(x, 0);
        assert_eq!(a.free_list(4), vec![f(0)]);
        assert_eq!((0..4).map(|k| a.free_blocks(k)).sum::<usize>(), 0);
    }

    #[test]
    fn merge_stops_at_range_edge() {
        // 8..12: buddy of 8 at order 2 is 12, outside the range
        let a = small(8, 4);
        let x = a.allocate(2).unwrap();
        a.free(x, 2);
        assert_eq!(a.free_list(2), vec![f(8)]);
        assert_eq!(a.free_blocks(3), 0);
    }

    #[test]
    fn invalid_order_and_exhaustion() {
        let a = small(0, 4);
        assert_eq!(
            a.allocate(MAX_ORDER + 1),
            Err(MemoryError::InvalidOrder {
                order: MAX_ORDER + 1,
                max: MAX_ORDER
            })
        );
        assert_eq!(a.allocate(3), Err(MemoryError::OutOfMemory));
        assert!(a.allocate(2).is_ok());
        assert_eq!(a.allocate(0), Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn empty_allocator_accepts_disjoint_ranges_only() {
        let a = FrameAllocator::empty(f(0), 64, &NoInterrupts, &PanicHalt).unwrap();
        assert_eq!(a.free_frames(), 0);
        assert_eq!(a.allocate(0), Err(MemoryError::OutOfMemory));

        a.add_free_range(f(0), f(8)).unwrap();
        a.add_free_range(f(8), f(16)).unwrap();
        // adjacent halves merge
        assert_eq!(a.free_list(4), vec![f(0)]);

        assert!(matches!(a.add_free_range(f(4), f(20)), Err(MemoryError::Overlap { .. })));
        assert!(matches!(a.add_free_range(f(60), f(70)), Err(MemoryError::AddressOverflow { .. })));
        assert_eq!(a.add_free_range(f(30), f(30)), Err(MemoryError::EmptyRegion));
        assert_eq!(a.free_frames(), 16);
    }

    #[test]
    fn construction_limits() {
        assert_eq!(
            FrameAllocator::empty(f(0), 0, &NoInterrupts, &PanicHalt).unwrap_err(),
            MemoryError::EmptyRegion
        );
        assert!(matches!(
            FrameAllocator::empty(f(u64::MAX - 2), 8, &NoInterrupts, &PanicHalt),
            Err(MemoryError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn split_allocated_frames_free_individually() {
        let a = small(0, 8);
        let head = a.allocate(2).unwrap();
        a.split_allocated(head, 2);
        for i in (0..4).rev() {
            assert!(a.is_allocated(head + i));
            a.free(head + i, 0);
        }
        assert_eq!(a.free_list(3), vec![f(0)]);
    }

    #[test]
    #[should_panic(expected = "double free of frame 0x1 at order 0")]
    fn double_free_halts() {
        let a = small(0, 4);
        let _x = a.allocate(0).unwrap();
        let y = a.allocate(0).unwrap();
        a.free(y, 0);
        a.free(y, 0);
    }

    #[test]
    #[should_panic(expected = "double free of frame 0x3")]
    fn free_of_frame_inside_merged_block_halts() {
        let a = small(0, 4);
        let x = a.allocate(2).unwrap();
        a.free(x, 2);
        a.free(f(3), 0);
    }

    #[test]
    #[should_panic(expected = "order does not match the allocation")]
    fn stale_order_halts() {
        let a = small(0, 8);
        let x = a.allocate(1).unwrap();
        a.free(x, 2);
    }

    #[test]
    #[should_panic(expected = "frame 0x40 is not managed here")]
    fn foreign_frame_halts() {
        let a = small(0, 8);
        a.free(f(0x40), 0);
    }

    #[test]
    #[should_panic(expected = "never handed to the allocator")]
    fn reserved_frame_halts() {
        let a = FrameAllocator::empty(f(0), 8, &NoInterrupts, &PanicHalt).unwrap();
        a.add_free_range(f(0), f(4)).unwrap();
        a.free(f(6), 0);
    }
}
