//! Frame allocation with reference counting.
//!
//! [`FramePool`] pairs the buddy [`FrameAllocator`] with the
//! [`PageRegistry`]: every frame it hands out starts with one reference
//! and a clean record, and a block only goes back to the buddy lists once
//! [`put_pages`](FramePool::put_pages) drops its last reference.

use crate::{FrameAllocator, Halt, MemoryError, PageRegistry, block_frames};
use core::fmt;
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};
use kernel_sync::InterruptControl;
use kernel_vmem::FrameAlloc;
use log::trace;

pub struct FramePool<'c> {
    frames: FrameAllocator<'c>,
    registry: PageRegistry<'c>,
}

impl<'c> FramePool<'c> {
    /// Pool over `count` frames from `base`, all of them free.
    ///
    /// # Errors
    /// See [`FrameAllocator::empty`].
    pub fn new(
        base: FrameNumber,
        count: u64,
        irq: &'c dyn InterruptControl,
        halt: &'c dyn Halt,
    ) -> Result<Self, MemoryError> {
        let pool = Self::empty(base, count, irq, halt)?;
        pool.add_free_range(base, base + count)?;
        Ok(pool)
    }

    /// Pool over `count` frames from `base`, all reserved.
    ///
    /// # Errors
    /// See [`FrameAllocator::empty`].
    pub fn empty(
        base: FrameNumber,
        count: u64,
        irq: &'c dyn InterruptControl,
        halt: &'c dyn Halt,
    ) -> Result<Self, MemoryError> {
        let frames = FrameAllocator::empty(base, count, irq, halt)?;
        #[allow(clippy::cast_possible_truncation)]
        let registry = PageRegistry::new(base, frames.frame_count() as u32, halt);
        for i in 0..frames.frame_count() {
            registry.mark_reserved(base + i);
        }
        Ok(Self { frames, registry })
    }

    /// Hand reserved frames `[start, end)` over to the allocator.
    ///
    /// # Errors
    /// See [`FrameAllocator::add_free_range`].
    pub fn add_free_range(&self, start: FrameNumber, end: FrameNumber) -> Result<(), MemoryError> {
        self.frames.add_free_range(start, end)?;
        for i in 0..end.as_u64() - start.as_u64() {
            self.registry.clear_reserved(start + i);
        }
        Ok(())
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator<'c> {
        &self.frames
    }

    #[must_use]
    pub const fn registry(&self) -> &PageRegistry<'c> {
        &self.registry
    }

    /// Allocate `2^order` frames, each with one reference and no flags.
    ///
    /// # Errors
    /// See [`FrameAllocator::allocate`].
    pub fn alloc_pages(&self, order: usize) -> Result<FrameNumber, MemoryError> {
        let head = self.frames.allocate(order)?;
        for i in 0..block_frames(order) {
            self.registry.prepare_allocated(head + i);
        }
        Ok(head)
    }

    /// Drop the owner's reference to the block at `head`. When it was the
    /// last one, the whole block goes back to the allocator and `true` is
    /// returned.
    #[must_use = "a `false` result means the block is still referenced elsewhere"]
    pub fn put_pages(&self, head: FrameNumber, order: usize) -> bool {
        if !self.registry.dec_ref(head) {
            return false;
        }
        for i in 1..block_frames(order) {
            self.registry.release_allocated(head + i);
        }
        self.frames.free(head, order);
        true
    }

    /// Allocate exactly `pages` physically contiguous frames.
    ///
    /// The block is taken at the next order up; the frames past `pages` are
    /// returned right away. Release with [`free_exact`](Self::free_exact).
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] for zero pages.
    /// - [`MemoryError::InvalidOrder`] if `pages` exceeds the largest block.
    /// - [`MemoryError::OutOfMemory`] if no such block is free.
    pub fn alloc_exact(&self, pages: u64) -> Result<FrameNumber, MemoryError> {
        if pages == 0 {
            return Err(MemoryError::EmptyRegion);
        }
        let order = (u64::BITS - (pages - 1).leading_zeros()) as usize;
        if order > MAX_ORDER {
            return Err(MemoryError::InvalidOrder { order, max: MAX_ORDER });
        }
        let head = self.alloc_pages(order)?;
        self.frames.split_allocated(head, order);
        let returned = (pages..block_frames(order))
            .filter(|&i| self.put_pages(head + i, 0))
            .count();
        debug_assert_eq!(returned as u64, block_frames(order) - pages);
        trace!("frames: exact {pages} pages at {head} (order {order})");
        Ok(head)
    }

    /// Drop one reference on each of the `pages` frames from `head`.
    /// Returns how many of them went back to the allocator.
    #[must_use = "frames still referenced elsewhere are not freed"]
    pub fn free_exact(&self, head: FrameNumber, pages: u64) -> usize {
        (0..pages).filter(|&i| self.put_pages(head + i, 0)).count()
    }
}

impl FrameAlloc for FramePool<'_> {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.alloc_pages(0).ok().map(FrameNumber::base)
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        let frame = FrameNumber::containing(pa);
        if !self.put_pages(frame, 0) {
            trace!("frames: table frame {frame} still referenced");
        }
    }
}

impl fmt::Debug for FramePool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("frames", &self.frames)
            .field("registry", &self.registry)
            .finish()
    }
}
