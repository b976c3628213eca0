//! # Per-frame metadata
//!
//! One [`PageMeta`] record per managed frame, alive from boot on whatever
//! the frame's allocation state. Everything is atomic so reclaim and
//! write-back code on any core can update it without a lock.
//!
//! Reaching a zero reference count does not free anything: the caller that
//! dropped the last reference returns the frame to the
//! [`FrameAllocator`](crate::FrameAllocator).

use crate::{Corruption, Halt};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use kernel_memory_addresses::FrameNumber;

bitflags! {
    /// State bits tracked for every frame.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct PageFlags: u8 {
        /// Contents differ from the backing store.
        const DIRTY = 1 << 0;
        /// Referenced since the last harvest (the "young" bit).
        const ACCESSED = 1 << 1;
        /// Never handed to the allocator.
        const RESERVED = 1 << 2;
    }
}

#[derive(Default)]
struct PageMeta {
    refcount: AtomicU32,
    flags: AtomicU8,
}

pub struct PageRegistry<'c> {
    base: FrameNumber,
    metas: Vec<PageMeta>,
    halt: &'c dyn Halt,
}

impl<'c> PageRegistry<'c> {
    /// Records for `count` frames from `base`, all unreferenced and clear.
    #[must_use]
    pub fn new(base: FrameNumber, count: u32, halt: &'c dyn Halt) -> Self {
        let mut metas = Vec::with_capacity(count as usize);
        metas.resize_with(count as usize, PageMeta::default);
        Self { base, metas, halt }
    }

    /// Number of frames with a record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Take an additional reference.
    ///
    /// Halts if the frame has no reference yet: it is free, and the allocator
    /// may hand it out again.
    pub fn inc_ref(&self, frame: FrameNumber) {
        let meta = self.meta(frame, "inc_ref");
        let fault = match meta.refcount.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            if c == 0 { None } else { c.checked_add(1) }
        }) {
            Ok(_) => return,
            Err(0) => Corruption::RefOnFreeFrame { frame },
            Err(_) => Corruption::RefcountOverflow { frame },
        };
        self.halt.halt(fault, "inc_ref");
    }

    /// Drop a reference. Returns `true` iff this was the last one.
    ///
    /// Halts if the count is already zero.
    #[must_use]
    pub fn dec_ref(&self, frame: FrameNumber) -> bool {
        let meta = self.meta(frame, "dec_ref");
        match meta
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => self.halt.halt(Corruption::RefcountUnderflow { frame }, "dec_ref"),
        }
    }

    #[must_use]
    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.meta(frame, "refcount").refcount.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, frame: FrameNumber) {
        self.set(frame, PageFlags::DIRTY, "set_dirty");
    }

    pub fn clear_dirty(&self, frame: FrameNumber) {
        self.clear(frame, PageFlags::DIRTY, "clear_dirty");
    }

    #[must_use]
    pub fn is_dirty(&self, frame: FrameNumber) -> bool {
        self.flags(frame).contains(PageFlags::DIRTY)
    }

    pub fn mark_accessed(&self, frame: FrameNumber) {
        self.set(frame, PageFlags::ACCESSED, "mark_accessed");
    }

    /// Clear the accessed bit and report whether it was set.
    #[must_use]
    pub fn test_and_clear_accessed(&self, frame: FrameNumber) -> bool {
        self.clear(frame, PageFlags::ACCESSED, "test_and_clear_accessed")
            .contains(PageFlags::ACCESSED)
    }

    #[must_use]
    pub fn is_accessed(&self, frame: FrameNumber) -> bool {
        self.flags(frame).contains(PageFlags::ACCESSED)
    }

    pub fn mark_reserved(&self, frame: FrameNumber) {
        self.set(frame, PageFlags::RESERVED, "mark_reserved");
    }

    pub fn clear_reserved(&self, frame: FrameNumber) {
        self.clear(frame, PageFlags::RESERVED, "clear_reserved");
    }

    #[must_use]
    pub fn is_reserved(&self, frame: FrameNumber) -> bool {
        self.flags(frame).contains(PageFlags::RESERVED)
    }

    #[must_use]
    pub fn flags(&self, frame: FrameNumber) -> PageFlags {
        PageFlags::from_bits_truncate(self.meta(frame, "flags").flags.load(Ordering::Acquire))
    }

    /// Reset a frame that just left the allocator: one reference, no flags.
    pub fn prepare_allocated(&self, frame: FrameNumber) {
        let meta = self.meta(frame, "prepare_allocated");
        meta.flags.store(0, Ordering::Relaxed);
        meta.refcount.store(1, Ordering::Release);
    }

    /// Drop the allocation reference of a frame that is about to go back to
    /// the allocator as part of a larger block.
    ///
    /// Halts unless that reference is the only one left.
    pub fn release_allocated(&self, frame: FrameNumber) {
        let meta = self.meta(frame, "release_allocated");
        if let Err(refcount) = meta
            .refcount
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            let fault = if refcount == 0 {
                Corruption::RefcountUnderflow { frame }
            } else {
                Corruption::StillReferenced { frame, refcount }
            };
            self.halt.halt(fault, "release_allocated");
        }
    }

    fn set(&self, frame: FrameNumber, bits: PageFlags, op: &'static str) -> PageFlags {
        PageFlags::from_bits_truncate(self.meta(frame, op).flags.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    fn clear(&self, frame: FrameNumber, bits: PageFlags, op: &'static str) -> PageFlags {
        PageFlags::from_bits_truncate(self.meta(frame, op).flags.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    fn meta(&self, frame: FrameNumber, op: &'static str) -> &PageMeta {
        let index = frame
            .as_u64()
            .checked_sub(self.base.as_u64())
            .and_then(|i| usize::try_from(i).ok());
        match index.and_then(|i| self.metas.get(i)) {
            Some(meta) => meta,
            None => self.halt.halt(Corruption::UnknownFrame { frame }, op),
        }
    }
}

impl fmt::Debug for PageRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRegistry")
            .field("base", &self.base)
            .field("frames", &self.metas.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PanicHalt;

    fn f(n: u64) -> FrameNumber {
        FrameNumber::new(n)
    }

    #[test]
    fn refcount_reaches_zero_once() {
        let reg = PageRegistry::new(f(100), 4, &PanicHalt);
        reg.prepare_allocated(f(101));
        reg.inc_ref(f(101));
        assert_eq!(reg.refcount(f(101)), 2);
        assert!(!reg.dec_ref(f(101)));
        assert!(reg.dec_ref(f(101)));
        assert_eq!(reg.refcount(f(101)), 0);
    }

    #[test]
    #[should_panic(expected = "reference count underflow on frame 0x64")]
    fn underflow_halts() {
        let reg = PageRegistry::new(f(100), 4, &PanicHalt);
        let _ = reg.dec_ref(f(100));
    }

    #[test]
    #[should_panic(expected = "in inc_ref: reference taken on free frame 0x65")]
    fn reference_on_free_frame_halts() {
        let reg = PageRegistry::new(f(100), 4, &PanicHalt);
        reg.prepare_allocated(f(101));
        assert!(reg.dec_ref(f(101)));
        reg.inc_ref(f(101));
    }

    #[test]
    #[should_panic(expected = "in inc_ref: frame 0x63 is not managed here")]
    fn foreign_frame_halts() {
        let reg = PageRegistry::new(f(100), 4, &PanicHalt);
        reg.inc_ref(f(99));
    }

    #[test]
    fn flags_are_independent() {
        let reg = PageRegistry::new(f(0), 2, &PanicHalt);
        reg.set_dirty(f(1));
        reg.mark_accessed(f(1));
        assert_eq!(reg.flags(f(1)), PageFlags::DIRTY | PageFlags::ACCESSED);

        assert!(reg.test_and_clear_accessed(f(1)));
        assert!(!reg.test_and_clear_accessed(f(1)));
        assert!(reg.is_dirty(f(1)));
        reg.clear_dirty(f(1));
        assert_eq!(reg.flags(f(1)), PageFlags::empty());
        assert_eq!(reg.flags(f(0)), PageFlags::empty());
    }

    #[test]
    fn prepare_resets_flags() {
        let reg = PageRegistry::new(f(0), 1, &PanicHalt);
        reg.set_dirty(f(0));
        reg.mark_reserved(f(0));
        reg.prepare_allocated(f(0));
        assert_eq!(reg.flags(f(0)), PageFlags::empty());
        assert_eq!(reg.refcount(f(0)), 1);
    }

    #[test]
    #[should_panic(expected = "frame 0x0 is released with 2 references left")]
    fn releasing_shared_tail_halts() {
        let reg = PageRegistry::new(f(0), 1, &PanicHalt);
        reg.prepare_allocated(f(0));
        reg.inc_ref(f(0));
        reg.release_allocated(f(0));
    }

    #[test]
    fn concurrent_references_balance() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let reg = Arc::new(PageRegistry::new(f(0), 1, &PanicHalt));
        reg.prepare_allocated(f(0));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10_000 {
                        reg.inc_ref(f(0));
                        reg.mark_accessed(f(0));
                        assert!(!reg.dec_ref(f(0)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.refcount(f(0)), 1);
        assert!(reg.dec_ref(f(0)));
    }
}
