//! # Address Space (x86-64, PML4-rooted)
//!
//! One translation tree plus the per-core bookkeeping needed to keep cached
//! translations of it coherent.
//!
//! ## Kinds
//!
//! - The **kernel** space owns the upper half (PML4 slots 256..512). Its
//!   entries may be cached by every online core, so its flushes go to all of
//!   them.
//! - A **user** space owns the lower half and starts with a copy of the
//!   kernel's upper-half PML4 entries. The kernel tables below those entries
//!   are shared, so kernel mappings added later show up everywhere as long as
//!   their PML4 slot existed when the user space was created; see
//!   [`AddressSpace::preallocate_kernel_tables`].
//!
//! ## Core tracking
//!
//! Each user space tracks three core sets:
//!
//! - `active`: the space is loaded in the core's root register right now.
//! - `ran_on`: the core has loaded it at some point, so PCID-tagged entries may linger.
//! - `stale`: the space was edited while the core had it loaded but inactive.
//!   The next switch to it on that core must not keep the tagged entries.
//!
//! ## Safety
//!
//! - The tables are only reachable through `PhysMapper`; every entry is an
//!   atomic word, so the lock-free [`query`](AddressSpace::query) may race with edits.
//! - Intermediate tables are never freed while the space lives; only
//!   [`destroy`](AddressSpace::destroy) releases them.

use crate::page_table::{ENTRIES, KERNEL_HALF_FIRST_SLOT, join_indices, split_indices};
use crate::{CoreId, CoreSet, FrameAlloc, PageEntryBits, PageProtection, PageTable, PhysMapper, TlbCoordinator};
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::{Cr3, Pcid};
use kernel_sync::{InterruptControl, SpinLock};
use log::{debug, trace};

/// Which half of the virtual address range a space owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpaceKind {
    Kernel,
    User,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory for page tables")]
    OutOfMemory,
    #[error("virtual address {0} is not page-aligned")]
    Unaligned(VirtualAddress),
    #[error("physical address {0} is not page-aligned")]
    UnalignedPhys(PhysicalAddress),
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is covered by a huge page")]
    HugePage(VirtualAddress),
    #[error("{0} is outside the half owned by this address space")]
    WrongHalf(VirtualAddress),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SpaceError {
    #[error("address space is still active on cores {0}")]
    StillActive(CoreSet),
    #[error("address space is still referenced elsewhere")]
    StillShared,
    #[error("the kernel address space cannot be destroyed")]
    KernelSpace,
    #[error("no free address-space identifier")]
    NoAsid,
    #[error("out of memory for the root table")]
    OutOfMemory,
    #[error("{0} is not a configured core")]
    UnknownCore(CoreId),
}

/// Pool of PCIDs for user spaces. PCID 0 belongs to the kernel space.
pub struct AsidAllocator {
    used: SpinLock<[u64; Self::WORDS]>,
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AsidAllocator {
    const WORDS: usize = (Pcid::MAX as usize + 1) / 64;

    #[must_use]
    pub const fn new() -> Self {
        let mut used = [0u64; Self::WORDS];
        used[0] = 1;
        Self {
            used: SpinLock::new(used),
        }
    }

    /// Lowest free PCID, or `None` when all 4095 are taken.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&self) -> Option<Pcid> {
        let mut used = self.used.lock();
        let (word, bits) = used.iter_mut().enumerate().find(|(_, w)| **w != u64::MAX)?;
        let bit = bits.trailing_ones();
        *bits |= 1 << bit;
        Pcid::new((word * 64) as u16 + bit as u16)
    }

    pub fn release(&self, pcid: Pcid) {
        let v = usize::from(pcid.as_u16());
        if v == 0 {
            return;
        }
        self.used.lock()[v / 64] &= !(1 << (v % 64));
    }

    /// PCIDs handed out, the kernel's included.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.used.lock().iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[derive(Default)]
struct CoreTracking {
    active: CoreSet,
    ran_on: CoreSet,
    stale: CoreSet,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    mapper: &'m M,
    tlb: &'m TlbCoordinator<'m>,
    irq: &'m dyn InterruptControl,
    asids: Option<&'m AsidAllocator>,
    root: PhysicalAddress,
    asid: Pcid,
    kind: SpaceKind,
    /// Serializes structural edits (table creation, leaf installation).
    tables: SpinLock<()>,
    cores: SpinLock<CoreTracking>,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Create the kernel address space with an empty root.
    ///
    /// # Errors
    /// [`SpaceError::OutOfMemory`] if no frame is available for the root.
    pub fn new_kernel<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        tlb: &'m TlbCoordinator<'m>,
        irq: &'m dyn InterruptControl,
        alloc: &A,
    ) -> Result<Self, SpaceError> {
        let root = alloc.alloc_4k().ok_or(SpaceError::OutOfMemory)?;
        let space = Self {
            mapper,
            tlb,
            irq,
            asids: None,
            root,
            asid: Pcid::KERNEL,
            kind: SpaceKind::Kernel,
            tables: SpinLock::new(()),
            cores: SpinLock::new(CoreTracking::default()),
        };
        space.table(root).zero();
        debug!("aspace: kernel root at {root}");
        Ok(space)
    }

    /// Create a user address space sharing `kernel`'s upper half.
    ///
    /// # Errors
    /// [`SpaceError::NoAsid`] if the PCID pool is exhausted,
    /// [`SpaceError::OutOfMemory`] if no frame is available for the root.
    pub fn new_user<A: FrameAlloc + ?Sized>(
        kernel: &Self,
        asids: &'m AsidAllocator,
        alloc: &A,
    ) -> Result<Self, SpaceError> {
        debug_assert_eq!(kernel.kind, SpaceKind::Kernel);
        let asid = asids.allocate().ok_or(SpaceError::NoAsid)?;
        let Some(root) = alloc.alloc_4k() else {
            asids.release(asid);
            return Err(SpaceError::OutOfMemory);
        };

        let space = Self {
            mapper: kernel.mapper,
            tlb: kernel.tlb,
            irq: kernel.irq,
            asids: Some(asids),
            root,
            asid,
            kind: SpaceKind::User,
            tables: SpinLock::new(()),
            cores: SpinLock::new(CoreTracking::default()),
        };

        let table = space.table(root);
        table.zero();
        {
            let _g = kernel.tables.lock_irq(kernel.irq);
            let kernel_root = kernel.table(kernel.root);
            for i in KERNEL_HALF_FIRST_SLOT..ENTRIES {
                table.set(i, kernel_root.get(i));
            }
        }
        debug!("aspace: user root at {root}, pcid {asid}");
        Ok(space)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn asid(&self) -> Pcid {
        self.asid
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &'m TlbCoordinator<'m> {
        self.tlb
    }

    /// Root register value for loading this space.
    #[must_use]
    pub fn cr3(&self, no_flush: bool) -> Cr3 {
        Cr3::from_root(self.root, self.asid, no_flush)
    }

    /// Cores that have this space loaded right now.
    #[must_use]
    pub fn active_cores(&self) -> CoreSet {
        self.cores.lock_irq(self.irq).active
    }

    /// Cores that have loaded this space at least once.
    #[must_use]
    pub fn ran_on(&self) -> CoreSet {
        self.cores.lock_irq(self.irq).ran_on
    }

    /// Cores that must drop this space's tagged entries on their next switch to it.
    #[must_use]
    pub fn stale_cores(&self) -> CoreSet {
        self.cores.lock_irq(self.irq).stale
    }

    /// Create the PDPT under every kernel PML4 slot touched by `[base, base + size)`.
    ///
    /// User spaces copy the kernel's PML4 entries when they are created, so
    /// the kernel calls this for its shared windows before any user space
    /// exists.
    ///
    /// # Errors
    /// [`MapError::WrongHalf`] on a user space or a range outside the kernel
    /// half, [`MapError::OutOfMemory`] if a table frame cannot be allocated.
    pub fn preallocate_kernel_tables<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        base: VirtualAddress,
        size: u64,
    ) -> Result<(), MapError> {
        let last = base
            .checked_add(size.saturating_sub(1))
            .ok_or(MapError::WrongHalf(base))?;
        if self.kind != SpaceKind::Kernel {
            return Err(MapError::WrongHalf(base));
        }
        self.check_half(base)?;
        self.check_half(last)?;

        let _g = self.tables.lock_irq(self.irq);
        let root = self.table(self.root);
        for slot in split_indices(base)[0]..=split_indices(last)[0] {
            if !root.get(slot).present() {
                let pa = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
                self.table(pa).zero();
                root.set(slot, PageEntryBits::table_link(pa, false));
            }
        }
        Ok(())
    }

    /// Install a 4 KiB leaf `va → pa`, creating intermediate tables as needed.
    ///
    /// Kernel leaves are always global, so a per-page flush drops them under
    /// every PCID.
    ///
    /// Does not flush: the caller issues [`flush_range`](Self::flush_range)
    /// (or `flush_page`) for the edited range before relying on it.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] / [`MapError::UnalignedPhys`] for misaligned input.
    /// - [`MapError::WrongHalf`] if `va` is not owned by this space.
    /// - [`MapError::AlreadyMapped`] if a present leaf exists.
    /// - [`MapError::OutOfMemory`] if a table frame cannot be allocated.
    pub fn map_4k<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: PageProtection,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::Unaligned(va));
        }
        if !pa.is_page_aligned() {
            return Err(MapError::UnalignedPhys(pa));
        }
        self.check_half(va)?;

        let prot = match self.kind {
            SpaceKind::Kernel => prot | PageProtection::GLOBAL,
            SpaceKind::User => prot,
        };

        let _g = self.tables.lock_irq(self.irq);
        let leaf = self.walk_create(alloc, va)?;
        let i = split_indices(va)[3];
        if leaf.get(i).present() {
            return Err(MapError::AlreadyMapped(va));
        }
        leaf.set(i, PageEntryBits::leaf(pa, prot));
        trace!("aspace {}: map {va} -> {pa}", self.asid);
        Ok(())
    }

    /// Clear the 4 KiB leaf at `va` and return the entry it held.
    ///
    /// Does not flush; see [`map_4k`](Self::map_4k).
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no present leaf at `va`.
    pub fn unmap_4k(&self, va: VirtualAddress) -> Result<PageEntryBits, MapError> {
        self.check_half(va)?;
        let _g = self.tables.lock_irq(self.irq);
        let leaf = self.walk(va)?;
        let old = leaf.take(split_indices(va)[3]);
        if !old.present() {
            return Err(MapError::NotMapped(va));
        }
        trace!("aspace {}: unmap {va}", self.asid);
        Ok(old)
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.entry(va)?;
        Some(entry.physical_address() + va.page_offset())
    }

    /// The present leaf entry for `va`, if any.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let leaf = self.walk(va).ok()?;
        let e = leaf.get(split_indices(va)[3]);
        e.present().then_some(e)
    }

    /// Clear the hardware accessed bit of the leaf at `va` and return its old value.
    ///
    /// A cleared bit is flushed so the CPU sets it again on the next access.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no present leaf at `va`.
    pub fn test_and_clear_accessed(&self, issuer: CoreId, va: VirtualAddress) -> Result<bool, MapError> {
        let prev = self.clear_leaf_bits(va, PageEntryBits::new().with_accessed(true))?;
        if prev.accessed() {
            self.flush_page(issuer, va);
        }
        Ok(prev.accessed())
    }

    /// Clear the hardware dirty bit of the leaf at `va` and return its old value.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no present leaf at `va`.
    pub fn take_dirty(&self, issuer: CoreId, va: VirtualAddress) -> Result<bool, MapError> {
        let prev = self.clear_leaf_bits(va, PageEntryBits::new().with_dirty(true))?;
        if prev.dirty() {
            self.flush_page(issuer, va);
        }
        Ok(prev.dirty())
    }

    /// Invalidate one page of this space wherever it may be cached.
    pub fn flush_page(&self, issuer: CoreId, va: VirtualAddress) {
        let targets = self.flush_targets();
        self.tlb.flush_page(issuer, targets, self.asid, va);
    }

    /// Invalidate `[base, base + size)` of this space wherever it may be cached.
    pub fn flush_range(&self, issuer: CoreId, base: VirtualAddress, size: u64) {
        let targets = self.flush_targets();
        self.tlb.flush_range(issuer, targets, self.asid, base, size);
    }

    /// Invalidate everything wherever this space may be cached.
    pub fn flush_all(&self, issuer: CoreId) {
        let targets = self.flush_targets();
        self.tlb.flush_all(issuer, targets);
    }

    /// Tear down a user space: free every table frame and the root, return
    /// the PCID, and hand every present leaf to `on_leaf` so the owner can
    /// drop its frame reference.
    ///
    /// # Errors
    /// Hands the handle back with the reason:
    /// - [`SpaceError::KernelSpace`] for the kernel space.
    /// - [`SpaceError::StillActive`] if any core has the space loaded.
    /// - [`SpaceError::StillShared`] if other handles to the space exist.
    pub fn destroy<A: FrameAlloc + ?Sized>(
        this: Arc<Self>,
        issuer: CoreId,
        alloc: &A,
        mut on_leaf: impl FnMut(VirtualAddress, PageEntryBits),
    ) -> Result<(), (Arc<Self>, SpaceError)> {
        if this.kind == SpaceKind::Kernel {
            return Err((this, SpaceError::KernelSpace));
        }
        let active = this.active_cores();
        if !active.is_empty() {
            return Err((this, SpaceError::StillActive(active)));
        }
        let space = Arc::try_unwrap(this).map_err(|this| (this, SpaceError::StillShared))?;
        space.teardown(issuer, alloc, &mut on_leaf);
        Ok(())
    }

    /// Record that `core` loads this space. Returns whether the load must flush.
    pub(crate) fn activate_on(&self, core: CoreId) -> bool {
        let mut c = self.cores.lock();
        c.active.insert(core);
        c.ran_on.insert(core);
        c.stale.remove(core)
    }

    /// Record that `core` switched away from this space.
    pub(crate) fn deactivate_on(&self, core: CoreId) {
        self.cores.lock().active.remove(core);
    }

    fn teardown<A: FrameAlloc + ?Sized>(
        self,
        issuer: CoreId,
        alloc: &A,
        on_leaf: &mut impl FnMut(VirtualAddress, PageEntryBits),
    ) {
        // Drop tagged entries before any frame can be reused.
        let ran_on = self.cores.lock_irq(self.irq).ran_on;
        self.tlb.flush_all(issuer, ran_on);

        let mut freed = 0usize;
        let root = self.table(self.root);
        for i4 in 0..KERNEL_HALF_FIRST_SLOT {
            let e4 = root.take(i4);
            if !e4.present() {
                continue;
            }
            let pdpt = self.table(e4.physical_address());
            for i3 in 0..ENTRIES {
                let e3 = pdpt.take(i3);
                if !e3.present() {
                    continue;
                }
                if e3.large_page() {
                    on_leaf(join_indices([i4, i3, 0, 0]), e3);
                    continue;
                }
                let pd = self.table(e3.physical_address());
                for i2 in 0..ENTRIES {
                    let e2 = pd.take(i2);
                    if !e2.present() {
                        continue;
                    }
                    if e2.large_page() {
                        on_leaf(join_indices([i4, i3, i2, 0]), e2);
                        continue;
                    }
                    let pt = self.table(e2.physical_address());
                    for i1 in 0..ENTRIES {
                        let e1 = pt.take(i1);
                        if e1.present() {
                            on_leaf(join_indices([i4, i3, i2, i1]), e1);
                        }
                    }
                    alloc.free_4k(e2.physical_address());
                    freed += 1;
                }
                alloc.free_4k(e3.physical_address());
                freed += 1;
            }
            alloc.free_4k(e4.physical_address());
            freed += 1;
        }
        alloc.free_4k(self.root);
        if let Some(asids) = self.asids {
            asids.release(self.asid);
        }
        debug!(
            "aspace: destroyed root {} (pcid {}), freed {} table frames",
            self.root,
            self.asid,
            freed + 1
        );
    }

    fn flush_targets(&self) -> CoreSet {
        match self.kind {
            SpaceKind::Kernel => self.tlb.online(),
            SpaceKind::User => {
                let mut c = self.cores.lock_irq(self.irq);
                c.stale = c.stale.union(c.ran_on.difference(c.active));
                c.active
            }
        }
    }

    fn clear_leaf_bits(&self, va: VirtualAddress, mask: PageEntryBits) -> Result<PageEntryBits, MapError> {
        self.check_half(va)?;
        let leaf = self.walk(va)?;
        let i = split_indices(va)[3];
        if !leaf.get(i).present() {
            return Err(MapError::NotMapped(va));
        }
        Ok(leaf.clear_bits(i, mask))
    }

    fn check_half(&self, va: VirtualAddress) -> Result<(), MapError> {
        let v = va.as_u64();
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let canonical = (((v as i64) << 16) >> 16) as u64 == v;
        let upper = split_indices(va)[0] >= KERNEL_HALF_FIRST_SLOT;
        let owned = match self.kind {
            SpaceKind::Kernel => upper,
            SpaceKind::User => !upper,
        };
        if canonical && owned {
            Ok(())
        } else {
            Err(MapError::WrongHalf(va))
        }
    }

    #[inline]
    fn table(&self, pa: PhysicalAddress) -> &'m PageTable {
        // SAFETY: `pa` is a table frame owned by this tree (or its fresh allocation).
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    /// The leaf table for `va`, without creating anything.
    fn walk(&self, va: VirtualAddress) -> Result<&'m PageTable, MapError> {
        let idx = split_indices(va);
        let mut table = self.table(self.root);
        for &i in &idx[..3] {
            let e = table.get(i);
            if !e.present() {
                return Err(MapError::NotMapped(va));
            }
            if e.large_page() {
                return Err(MapError::HugePage(va));
            }
            table = self.table(e.physical_address());
        }
        Ok(table)
    }

    /// The leaf table for `va`, creating missing intermediate tables.
    fn walk_create<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
    ) -> Result<&'m PageTable, MapError> {
        let user = self.kind == SpaceKind::User;
        let idx = split_indices(va);
        let mut table = self.table(self.root);
        for &i in &idx[..3] {
            let e = table.get(i);
            let next = if e.present() {
                if e.large_page() {
                    return Err(MapError::HugePage(va));
                }
                e.physical_address()
            } else {
                let pa = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
                self.table(pa).zero();
                table.set(i, PageEntryBits::table_link(pa, user));
                pa
            };
            table = self.table(next);
        }
        Ok(table)
    }
}

impl<M: PhysMapper> fmt::Debug for AddressSpace<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("asid", &self.asid)
            .finish_non_exhaustive()
    }
}
