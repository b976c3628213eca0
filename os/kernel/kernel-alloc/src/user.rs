//! Reference-counted user mappings.
//!
//! [`UserMemory`] owns one user [`AddressSpace`] and keeps the page
//! registry in step with it: every installed leaf holds one reference on
//! its frame, and removing the leaf (by [`unmap`](UserMemory::unmap) or by
//! [`destroy`](UserMemory::destroy)) drops that reference after the range
//! has been flushed.

use crate::{FramePool, MemoryError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, VirtualAddress};
use kernel_vmem::{AddressSpace, AsidAllocator, CoreId, MapError, PageEntryBits, PageProtection, PhysMapper, SpaceError};
use log::{debug, trace, warn};

pub struct UserMemory<'c, M: PhysMapper> {
    space: Arc<AddressSpace<'c, M>>,
    pool: &'c FramePool<'c>,
}

impl<'c, M: PhysMapper> UserMemory<'c, M> {
    /// A fresh user space that shares `kernel`'s upper half.
    ///
    /// # Errors
    /// [`MemoryError::Space`] if no PCID or root frame is available.
    pub fn new(
        kernel: &AddressSpace<'c, M>,
        asids: &'c AsidAllocator,
        pool: &'c FramePool<'c>,
    ) -> Result<Self, MemoryError> {
        let space = AddressSpace::new_user(kernel, asids, pool)?;
        Ok(Self {
            space: Arc::new(space),
            pool,
        })
    }

    /// The address space, for handing to the task switcher.
    #[must_use]
    pub const fn space(&self) -> &Arc<AddressSpace<'c, M>> {
        &self.space
    }

    /// Back `pages` pages from `base` with fresh frames.
    ///
    /// On failure nothing stays mapped and every frame taken is returned.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] / [`MemoryError::UnalignedRegion`] /
    ///   [`MemoryError::AddressOverflow`] for a bad range.
    /// - [`MemoryError::OutOfMemory`] if frames or table frames run out.
    /// - [`MemoryError::Mapping`] if a page is already mapped or outside the user half.
    pub fn map_anonymous(
        &self,
        core: CoreId,
        base: VirtualAddress,
        pages: u64,
        prot: PageProtection,
    ) -> Result<(), MemoryError> {
        let size = check_range(base, pages)?;
        let prot = prot | PageProtection::USER;

        let mut taken = Vec::new();
        let mut failure = None;
        for va in base.pages(pages) {
            let frame = match self.pool.alloc_pages(0) {
                Ok(frame) => frame,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if let Err(e) = self.space.map_4k(self.pool, va, frame.base(), prot) {
                self.put(frame);
                failure = Some(e.into());
                break;
            }
            taken.push(frame);
        }

        if let Some(e) = failure {
            self.unmap_and_flush(core, base, taken.len() as u64);
            for frame in taken {
                self.put(frame);
            }
            return Err(e);
        }

        self.space.flush_range(core, base, size);
        trace!("user {}: {pages} anonymous pages at {base}", self.space.asid());
        Ok(())
    }

    /// Map an existing frame at `va`, taking an extra reference on it.
    ///
    /// The caller must hold a reference to `frame`; sharing a free frame halts.
    ///
    /// # Errors
    /// [`MemoryError::Mapping`] / [`MemoryError::OutOfMemory`] if the entry
    /// cannot be installed; the reference is dropped again.
    pub fn share(
        &self,
        core: CoreId,
        va: VirtualAddress,
        frame: FrameNumber,
        prot: PageProtection,
    ) -> Result<(), MemoryError> {
        self.pool.registry().inc_ref(frame);
        if let Err(e) = self.space.map_4k(self.pool, va, frame.base(), prot | PageProtection::USER) {
            self.put(frame);
            return Err(e.into());
        }
        self.space.flush_page(core, va);
        Ok(())
    }

    /// Remove every present leaf in `pages` pages from `base` and drop the
    /// frame references once the range is flushed. Holes are skipped.
    ///
    /// Returns the number of leaves removed.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRegion`] / [`MemoryError::UnalignedRegion`] /
    ///   [`MemoryError::AddressOverflow`] for a bad range.
    /// - [`MemoryError::Mapping`] if the range is outside the user half.
    pub fn unmap(&self, core: CoreId, base: VirtualAddress, pages: u64) -> Result<usize, MemoryError> {
        let size = check_range(base, pages)?;
        let mut removed = Vec::new();
        for va in base.pages(pages) {
            match self.space.unmap_4k(va) {
                Ok(old) => removed.push(old),
                Err(MapError::NotMapped(_) | MapError::HugePage(_)) => {}
                Err(e) => return Err(self.abort_unmap(core, base, size, removed, e)),
            }
        }
        self.space.flush_range(core, base, size);
        let count = removed.len();
        for entry in removed {
            self.drop_leaf(entry);
        }
        Ok(count)
    }

    /// Tear the space down and drop the references of every mapped frame.
    ///
    /// # Errors
    /// Hands `self` back with [`SpaceError::StillActive`] while a core runs
    /// the space, or [`SpaceError::StillShared`] while another handle exists.
    pub fn destroy(self, core: CoreId) -> Result<(), (Self, SpaceError)> {
        let Self { space, pool } = self;
        let asid = space.asid();
        let mut leaves = 0usize;
        AddressSpace::destroy(space, core, pool, |_, entry| {
            leaves += 1;
            drop_leaf(pool, entry);
        })
        .map_err(|(space, e)| {
            debug!("user {asid}: teardown refused: {e}");
            (Self { space, pool }, e)
        })?;
        debug!("user {asid}: destroyed, {leaves} leaves released");
        Ok(())
    }

    /// Clear the first `pages` leaves from `base`, then flush them.
    fn unmap_and_flush(&self, core: CoreId, base: VirtualAddress, pages: u64) {
        if pages == 0 {
            return;
        }
        for va in base.pages(pages) {
            if let Err(e) = self.space.unmap_4k(va) {
                warn!("user {}: unwind {va}: {e}", self.space.asid());
            }
        }
        self.space.flush_range(core, base, pages * PAGE_SIZE);
    }

    /// Finish a partial unmap before reporting `error`.
    fn abort_unmap(
        &self,
        core: CoreId,
        base: VirtualAddress,
        size: u64,
        removed: Vec<PageEntryBits>,
        error: MapError,
    ) -> MemoryError {
        if !removed.is_empty() {
            self.space.flush_range(core, base, size);
            for entry in removed {
                self.drop_leaf(entry);
            }
        }
        error.into()
    }

    fn drop_leaf(&self, entry: PageEntryBits) {
        drop_leaf(self.pool, entry);
    }

    fn put(&self, frame: FrameNumber) {
        if !self.pool.put_pages(frame, 0) {
            trace!("user {}: frame {frame} still referenced", self.space.asid());
        }
    }
}

impl<M: PhysMapper> fmt::Debug for UserMemory<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserMemory").field("space", &self.space).finish_non_exhaustive()
    }
}

/// Record the hardware dirty bit, then drop the leaf's frame reference.
fn drop_leaf(pool: &FramePool<'_>, entry: PageEntryBits) {
    let frame = FrameNumber::containing(entry.physical_address());
    if entry.dirty() {
        pool.registry().set_dirty(frame);
    }
    if !pool.put_pages(frame, 0) {
        trace!("user: frame {frame} still referenced");
    }
}

fn check_range(base: VirtualAddress, pages: u64) -> Result<u64, MemoryError> {
    if pages == 0 {
        return Err(MemoryError::EmptyRegion);
    }
    let overflow = MemoryError::AddressOverflow {
        base: base.as_u64(),
        size: pages.saturating_mul(PAGE_SIZE),
    };
    let size = pages.checked_mul(PAGE_SIZE).ok_or(overflow)?;
    if !base.is_page_aligned() {
        return Err(MemoryError::UnalignedRegion {
            base: base.as_u64(),
            size,
        });
    }
    base.checked_add(size).ok_or(overflow)?;
    Ok(size)
}
