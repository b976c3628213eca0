//! # Kernel virtual regions
//!
//! [`VirtualRegionAllocator`] hands out disjoint, page-aligned ranges of a
//! fixed window of kernel virtual address space and binds them either to
//! fresh frames from the [`FramePool`] (heap growth, buffers) or to a given
//! physical range (device registers).
//!
//! ```text
//!  window.start                                                 window.end
//!  │ [ region A ][ gap ][ region B ][ gap ...................... ] │
//!  └── first fit: the lowest gap that holds the (aligned) request ──┘
//! ```
//!
//! The window's PML4 slots are populated when the allocator is created, so
//! every user address space created afterwards shares the mappings.
//!
//! ## Order of operations
//! - Reserve: claim the interval, install the entries, flush the range.
//! - Release: clear the entries, flush the range, drop the frame references,
//!   then give the interval back. The range cannot be handed out again while
//!   a stale translation for it may exist.

use crate::{FramePool, MemoryError};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::{IOREMAP_MAX_ALIGN_SHIFT, KERNEL_HALF_START, VMALLOC_END, VMALLOC_START};
use kernel_memory_addresses::{FrameNumber, PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_sync::{InterruptControl, SpinLock};
use kernel_vmem::{AddressSpace, CoreId, MapError, PageProtection, PhysMapper, SpaceKind};
use log::{debug, info, trace, warn};

/// The range of kernel virtual addresses a region allocator hands out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionWindow {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl RegionWindow {
    /// The kernel's `vmalloc`-style window from the memory layout.
    pub const KERNEL: Self = Self {
        start: VirtualAddress::new(VMALLOC_START),
        end: VirtualAddress::new(VMALLOC_END),
    };

    /// A window `[start, end)` in the kernel half.
    ///
    /// # Errors
    /// - [`MemoryError::UnalignedRegion`] if either bound is not page-aligned.
    /// - [`MemoryError::EmptyRegion`] if `end <= start`.
    /// - [`MemoryError::AddressOverflow`] if the window leaves the kernel half.
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Result<Self, MemoryError> {
        let size = end.as_u64().saturating_sub(start.as_u64());
        if !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(MemoryError::UnalignedRegion {
                base: start.as_u64(),
                size,
            });
        }
        if end <= start {
            return Err(MemoryError::EmptyRegion);
        }
        if start.as_u64() < KERNEL_HALF_START {
            return Err(MemoryError::AddressOverflow {
                base: start.as_u64(),
                size,
            });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    fn holds(&self, base: u64, end: u64) -> bool {
        base >= self.start.as_u64() && end <= self.end.as_u64()
    }
}

#[derive(Debug)]
enum Backing {
    Frames(Vec<FrameNumber>),
    Device(PhysicalAddress),
}

/// A reserved and mapped range. Only the allocator that created it can
/// release it, so it is not `Clone`.
#[derive(Debug)]
pub struct VirtualRegion {
    base: VirtualAddress,
    size: u64,
    prot: PageProtection,
    backing: Backing,
}

impl VirtualRegion {
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Size in bytes, a multiple of the page size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.size / PAGE_SIZE
    }

    #[must_use]
    pub const fn protection(&self) -> PageProtection {
        self.prot
    }

    /// Backing frames in virtual order; empty for device regions.
    #[must_use]
    pub fn frames(&self) -> &[FrameNumber] {
        match &self.backing {
            Backing::Frames(frames) => frames,
            Backing::Device(_) => &[],
        }
    }

    /// Physical base of a device region.
    #[must_use]
    pub const fn device_base(&self) -> Option<PhysicalAddress> {
        match self.backing {
            Backing::Device(pa) => Some(pa),
            Backing::Frames(_) => None,
        }
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() - self.base.as_u64() < self.size
    }
}

pub struct VirtualRegionAllocator<'c, M: PhysMapper> {
    space: &'c AddressSpace<'c, M>,
    pool: &'c FramePool<'c>,
    window: RegionWindow,
    /// Reserved intervals, `base → size`.
    intervals: SpinLock<BTreeMap<u64, u64>>,
    irq: &'c dyn InterruptControl,
}

impl<'c, M: PhysMapper> VirtualRegionAllocator<'c, M> {
    /// Region allocator over `window` of the kernel address space `space`.
    ///
    /// Creates the top-level tables for the whole window up front.
    ///
    /// # Errors
    /// - [`MemoryError::Mapping`] if `space` is not the kernel space.
    /// - [`MemoryError::OutOfMemory`] if the tables cannot be allocated.
    pub fn new(
        space: &'c AddressSpace<'c, M>,
        pool: &'c FramePool<'c>,
        window: RegionWindow,
        irq: &'c dyn InterruptControl,
    ) -> Result<Self, MemoryError> {
        if space.kind() != SpaceKind::Kernel {
            return Err(MapError::WrongHalf(window.start).into());
        }
        space.preallocate_kernel_tables(pool, window.start, window.size())?;
        info!("regions: window {}..{}", window.start, window.end);
        Ok(Self {
            space,
            pool,
            window,
            intervals: SpinLock::new(BTreeMap::new()),
            irq,
        })
    }

    #[must_use]
    pub const fn window(&self) -> RegionWindow {
        self.window
    }

    #[must_use]
    pub const fn space(&self) -> &'c AddressSpace<'c, M> {
        self.space
    }

    /// Reserve `size` bytes anywhere in the window, backed by fresh frames.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] / [`MemoryError::UnalignedRegion`] for a bad size.
    /// - [`MemoryError::OutOfMemory`] if no gap is large enough or frames run out.
    pub fn reserve(&self, core: CoreId, size: u64, prot: PageProtection) -> Result<VirtualRegion, MemoryError> {
        check_size(0, size)?;
        let base = self.claim_any(size, PAGE_SIZE)?;
        self.populate(core, base, size, prot)
    }

    /// Reserve `[base, base + size)` exactly, backed by fresh frames.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] / [`MemoryError::UnalignedRegion`] for bad input.
    /// - [`MemoryError::AddressOverflow`] if the range leaves the window.
    /// - [`MemoryError::Overlap`] if any part of it is already reserved.
    /// - [`MemoryError::OutOfMemory`] if frames run out.
    pub fn reserve_fixed(
        &self,
        core: CoreId,
        base: VirtualAddress,
        size: u64,
        prot: PageProtection,
    ) -> Result<VirtualRegion, MemoryError> {
        self.claim_fixed(base, size)?;
        self.populate(core, base, size, prot)
    }

    /// Map the device registers `[phys, phys + size)` somewhere in the window.
    ///
    /// The virtual base is aligned to the size rounded up to a power of two,
    /// between one page and `1 << IOREMAP_MAX_ALIGN_SHIFT`. The mapping is
    /// always uncached.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] / [`MemoryError::UnalignedRegion`] for bad input.
    /// - [`MemoryError::AddressOverflow`] if the physical range wraps.
    /// - [`MemoryError::OutOfMemory`] if no gap is large enough.
    /// - [`MemoryError::Mapping`] if an entry in the chosen range is already present.
    pub fn map_device(
        &self,
        core: CoreId,
        phys: PhysicalAddress,
        size: u64,
        prot: PageProtection,
    ) -> Result<VirtualRegion, MemoryError> {
        check_device(phys, size)?;
        let base = self.claim_any(size, device_alignment(size))?;
        self.bind_device(core, base, phys, size, prot)
    }

    /// Map the device registers `[phys, phys + size)` at exactly `base`.
    ///
    /// # Errors
    /// As [`map_device`](Self::map_device), plus [`MemoryError::Overlap`] if
    /// the virtual range is already reserved.
    pub fn map_device_fixed(
        &self,
        core: CoreId,
        base: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
        prot: PageProtection,
    ) -> Result<VirtualRegion, MemoryError> {
        check_device(phys, size)?;
        self.claim_fixed(base, size)?;
        self.bind_device(core, base, phys, size, prot)
    }

    /// Unmap `region`, flush it, drop the references to its frames and
    /// return its interval.
    ///
    /// # Errors
    /// [`MemoryError::UnknownRegion`] if `region` was not reserved here.
    pub fn release(&self, core: CoreId, region: VirtualRegion) -> Result<(), MemoryError> {
        let VirtualRegion {
            base, size, backing, ..
        } = region;
        let key = base.as_u64();
        if self.intervals.lock_irq(self.irq).get(&key) != Some(&size) {
            warn!("regions: release of unknown region at {base}");
            return Err(MemoryError::UnknownRegion(base));
        }

        let frames = match backing {
            Backing::Frames(frames) => frames,
            Backing::Device(_) => Vec::new(),
        };
        for (i, va) in base.pages(size / PAGE_SIZE).enumerate() {
            match self.space.unmap_4k(va) {
                Ok(old) if old.dirty() => {
                    if let Some(&frame) = frames.get(i) {
                        self.pool.registry().set_dirty(frame);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("regions: release {va}: {e}"),
            }
        }
        self.space.flush_range(core, base, size);

        for &frame in &frames {
            self.put(frame);
        }
        self.intervals.lock_irq(self.irq).remove(&key);
        debug!("regions: released {base}+{size:#x} ({} frames)", frames.len());
        Ok(())
    }

    /// Fold the hardware accessed/dirty bits of `region`'s entries into the
    /// page registry and clear them.
    ///
    /// # Errors
    /// [`MemoryError::Mapping`] if an entry of the region is missing.
    pub fn sync_page_flags(&self, core: CoreId, region: &VirtualRegion) -> Result<(), MemoryError> {
        let registry = self.pool.registry();
        for (va, &frame) in region.base.pages(region.pages()).zip(region.frames()) {
            if self.space.test_and_clear_accessed(core, va)? {
                registry.mark_accessed(frame);
            }
            if self.space.take_dirty(core, va)? {
                registry.set_dirty(frame);
            }
        }
        Ok(())
    }

    /// The reserved interval containing `va`, as `(base, size)`.
    #[must_use]
    pub fn region_at(&self, va: VirtualAddress) -> Option<(VirtualAddress, u64)> {
        let v = va.as_u64();
        let intervals = self.intervals.lock_irq(self.irq);
        let (&base, &size) = intervals.range(..=v).next_back()?;
        (v - base < size).then_some((VirtualAddress::new(base), size))
    }

    /// Number of reserved regions.
    #[must_use]
    pub fn regions(&self) -> usize {
        self.intervals.lock_irq(self.irq).len()
    }

    /// Bytes reserved across all regions.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.intervals.lock_irq(self.irq).values().sum()
    }

    /// Claim the lowest `align`-aligned gap of `size` bytes.
    fn claim_any(&self, size: u64, align: u64) -> Result<VirtualAddress, MemoryError> {
        let mut intervals = self.intervals.lock_irq(self.irq);
        let Some(base) = find_gap(&intervals, self.window, size, align) else {
            trace!("regions: no gap of {size:#x} bytes (align {align:#x})");
            return Err(MemoryError::OutOfMemory);
        };
        intervals.insert(base, size);
        Ok(VirtualAddress::new(base))
    }

    fn claim_fixed(&self, base: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        check_size(base.as_u64(), size)?;
        let overflow = MemoryError::AddressOverflow {
            base: base.as_u64(),
            size,
        };
        let end = base.as_u64().checked_add(size).ok_or(overflow)?;
        if !self.window.holds(base.as_u64(), end) {
            return Err(overflow);
        }

        let mut intervals = self.intervals.lock_irq(self.irq);
        if let Some((&b, &s)) = intervals.range(..end).next_back()
            && b + s > base.as_u64()
        {
            warn!("regions: {base}+{size:#x} overlaps {}+{s:#x}", VirtualAddress::new(b));
            return Err(MemoryError::Overlap {
                base: base.as_u64(),
                size,
            });
        }
        intervals.insert(base.as_u64(), size);
        Ok(())
    }

    fn unclaim(&self, base: VirtualAddress) {
        self.intervals.lock_irq(self.irq).remove(&base.as_u64());
    }

    fn populate(
        &self,
        core: CoreId,
        base: VirtualAddress,
        size: u64,
        prot: PageProtection,
    ) -> Result<VirtualRegion, MemoryError> {
        let mut frames = Vec::new();
        let mut mapped = 0;
        let mut failure = None;
        for va in base.pages(size / PAGE_SIZE) {
            let frame = match self.pool.alloc_pages(0) {
                Ok(frame) => frame,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            frames.push(frame);
            if let Err(e) = self.space.map_4k(self.pool, va, frame.base(), prot) {
                failure = Some(e.into());
                break;
            }
            mapped += 1;
        }

        if let Some(e) = failure {
            self.unwind(core, base, mapped);
            for &frame in &frames {
                self.put(frame);
            }
            self.unclaim(base);
            debug!("regions: reserve {base}+{size:#x} failed: {e}");
            return Err(e);
        }

        self.space.flush_range(core, base, size);
        debug!("regions: reserved {base}+{size:#x} ({} frames)", frames.len());
        Ok(VirtualRegion {
            base,
            size,
            prot,
            backing: Backing::Frames(frames),
        })
    }

    fn bind_device(
        &self,
        core: CoreId,
        base: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
        prot: PageProtection,
    ) -> Result<VirtualRegion, MemoryError> {
        let prot = prot | PageProtection::NO_CACHE;
        let mut mapped = 0;
        for (i, va) in base.pages(size / PAGE_SIZE).enumerate() {
            let pa = phys + (i as u64) * PAGE_SIZE;
            if let Err(e) = self.space.map_4k(self.pool, va, pa, prot) {
                self.unwind(core, base, mapped);
                self.unclaim(base);
                warn!("regions: device map {base} -> {phys} failed: {e}");
                return Err(e.into());
            }
            mapped += 1;
        }

        self.space.flush_range(core, base, size);
        debug!("regions: device {phys}+{size:#x} at {base}");
        Ok(VirtualRegion {
            base,
            size,
            prot,
            backing: Backing::Device(phys),
        })
    }

    /// Remove the first `mapped` entries of a half-built region.
    fn unwind(&self, core: CoreId, base: VirtualAddress, mapped: u64) {
        if mapped == 0 {
            return;
        }
        for va in base.pages(mapped) {
            if let Err(e) = self.space.unmap_4k(va) {
                warn!("regions: unwind {va}: {e}");
            }
        }
        self.space.flush_range(core, base, mapped * PAGE_SIZE);
    }

    fn put(&self, frame: FrameNumber) {
        if !self.pool.put_pages(frame, 0) {
            trace!("regions: frame {frame} still referenced");
        }
    }
}

impl<M: PhysMapper> fmt::Debug for VirtualRegionAllocator<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRegionAllocator")
            .field("window", &self.window)
            .field("regions", &self.regions())
            .finish_non_exhaustive()
    }
}

fn check_size(base: u64, size: u64) -> Result<(), MemoryError> {
    if size == 0 {
        return Err(MemoryError::EmptyRegion);
    }
    if !base.is_multiple_of(PAGE_SIZE) || !size.is_multiple_of(PAGE_SIZE) {
        return Err(MemoryError::UnalignedRegion { base, size });
    }
    Ok(())
}

fn check_device(phys: PhysicalAddress, size: u64) -> Result<(), MemoryError> {
    check_size(phys.as_u64(), size)?;
    if phys.checked_add(size).is_none() {
        return Err(MemoryError::AddressOverflow {
            base: phys.as_u64(),
            size,
        });
    }
    Ok(())
}

/// Virtual alignment of a device mapping of `size` bytes (`size > 0`).
fn device_alignment(size: u64) -> u64 {
    let shift = u64::BITS - (size - 1).leading_zeros();
    1 << shift.clamp(PAGE_SHIFT, IOREMAP_MAX_ALIGN_SHIFT)
}

/// Lowest `align`-aligned base in `window` with `size` free bytes.
fn find_gap(intervals: &BTreeMap<u64, u64>, window: RegionWindow, size: u64, align: u64) -> Option<u64> {
    let mut cursor = align_up(window.start.as_u64(), align)?;
    for (&base, &len) in intervals {
        if cursor.checked_add(size)? <= base {
            return Some(cursor);
        }
        cursor = cursor.max(align_up(base + len, align)?);
    }
    (cursor.checked_add(size)? <= window.end.as_u64()).then_some(cursor)
}
