//! # TLB coordination
//!
//! Every page-table edit is followed by one of the `flush_*` calls here
//! before anything relies on the new entry. The issuing core always
//! invalidates locally; every other core in the target set receives a
//! [`Shootdown`] through [`Mmu::send_shootdown`] and executes it in
//! [`TlbCoordinator::handle_shootdown`].
//!
//! Page and range requests name the PCID of the address space they belong
//! to. A core may have switched away from that space by the time it handles
//! the request, so the invalidation targets the tagged entries, not whatever
//! the core has loaded right now.
//!
//! Ranges of at most [`threshold_pages`](TlbCoordinator::threshold_pages)
//! pages are invalidated page by page; anything larger (or a range whose
//! size does not fit the address space) becomes a single full invalidation
//! per core.

use crate::{CoreId, CoreSet, Mmu};
use core::sync::atomic::{AtomicU64, Ordering, fence};
use kernel_info::memory::TLB_FLUSH_ALL_THRESHOLD_PAGES;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};
use kernel_registers::Pcid;
use log::trace;

/// Work a remote core performs on behalf of the issuer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Shootdown {
    /// One 4 KiB page of the space tagged `pcid`.
    Page { pcid: Pcid, va: VirtualAddress },
    /// `pages` consecutive pages starting at the page-aligned `base`.
    Range {
        pcid: Pcid,
        base: VirtualAddress,
        pages: u64,
    },
    /// Every cached translation.
    All,
}

/// Snapshot of the coordinator's counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    pub page_flushes: u64,
    pub range_flushes: u64,
    pub full_flushes: u64,
    pub shootdowns_sent: u64,
}

pub struct TlbCoordinator<'m> {
    mmu: &'m dyn Mmu,
    online: AtomicU64,
    threshold_pages: u64,
    page_flushes: AtomicU64,
    range_flushes: AtomicU64,
    full_flushes: AtomicU64,
    shootdowns_sent: AtomicU64,
}

impl<'m> TlbCoordinator<'m> {
    /// Coordinator for `online` cores using the default range threshold.
    #[must_use]
    pub const fn new(mmu: &'m dyn Mmu, online: CoreSet) -> Self {
        Self::with_threshold(mmu, online, TLB_FLUSH_ALL_THRESHOLD_PAGES)
    }

    /// Coordinator with a custom per-page/full-flush threshold (in pages, at least 1).
    #[must_use]
    pub const fn with_threshold(mmu: &'m dyn Mmu, online: CoreSet, threshold_pages: u64) -> Self {
        Self {
            mmu,
            online: AtomicU64::new(online.bits()),
            threshold_pages: if threshold_pages == 0 { 1 } else { threshold_pages },
            page_flushes: AtomicU64::new(0),
            range_flushes: AtomicU64::new(0),
            full_flushes: AtomicU64::new(0),
            shootdowns_sent: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn mmu(&self) -> &'m dyn Mmu {
        self.mmu
    }

    /// Cores that currently take part in shootdowns.
    #[must_use]
    pub fn online(&self) -> CoreSet {
        CoreSet::from_bits(self.online.load(Ordering::Acquire))
    }

    /// Bring a core into (or take it out of) the shootdown set.
    pub fn set_online(&self, core: CoreId, online: bool) {
        let bit = CoreSet::single(core).bits();
        if online {
            self.online.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.online.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub const fn threshold_pages(&self) -> u64 {
        self.threshold_pages
    }

    /// Invalidate the page containing `va` of the space tagged `pcid` on
    /// `issuer` and on every core in `targets`.
    pub fn flush_page(&self, issuer: CoreId, targets: CoreSet, pcid: Pcid, va: VirtualAddress) {
        self.page_flushes.fetch_add(1, Ordering::Relaxed);
        trace!("tlb: page {va} (pcid {pcid}) from {issuer} to {targets}");
        self.dispatch(
            issuer,
            targets,
            Shootdown::Page {
                pcid,
                va: va.page_base(),
            },
        );
    }

    /// Invalidate every page overlapping `[base, base + size)`.
    ///
    /// Falls back to [`flush_all`](Self::flush_all) above the threshold.
    pub fn flush_range(
        &self,
        issuer: CoreId,
        targets: CoreSet,
        pcid: Pcid,
        base: VirtualAddress,
        size: u64,
    ) {
        if size == 0 {
            return;
        }
        let start = base.page_base();
        let pages = base
            .as_u64()
            .checked_add(size)
            .and_then(|end| align_up(end, PAGE_SIZE))
            .map(|end| (end - start.as_u64()) / PAGE_SIZE);

        match pages {
            Some(pages) if pages <= self.threshold_pages => {
                self.range_flushes.fetch_add(1, Ordering::Relaxed);
                trace!("tlb: {pages} pages at {start} (pcid {pcid}) from {issuer} to {targets}");
                self.dispatch(
                    issuer,
                    targets,
                    Shootdown::Range {
                        pcid,
                        base: start,
                        pages,
                    },
                );
            }
            _ => {
                trace!("tlb: range at {start} ({size:#x} bytes) exceeds threshold, flushing all");
                self.flush_all(issuer, targets);
            }
        }
    }

    /// Invalidate everything on `issuer` and on every core in `targets`.
    pub fn flush_all(&self, issuer: CoreId, targets: CoreSet) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
        trace!("tlb: full flush from {issuer} to {targets}");
        self.dispatch(issuer, targets, Shootdown::All);
    }

    /// Execute a shootdown received from another core. Called on `core` itself.
    pub fn handle_shootdown(&self, core: CoreId, request: Shootdown) {
        match request {
            Shootdown::Page { pcid, va } => self.mmu.invalidate_page(core, pcid, va),
            Shootdown::Range { pcid, base, pages } => {
                for va in base.pages(pages) {
                    self.mmu.invalidate_page(core, pcid, va);
                }
            }
            Shootdown::All => self.mmu.invalidate_all(core),
        }
    }

    #[must_use]
    pub fn stats(&self) -> FlushStats {
        FlushStats {
            page_flushes: self.page_flushes.load(Ordering::Relaxed),
            range_flushes: self.range_flushes.load(Ordering::Relaxed),
            full_flushes: self.full_flushes.load(Ordering::Relaxed),
            shootdowns_sent: self.shootdowns_sent.load(Ordering::Relaxed),
        }
    }

    fn dispatch(&self, issuer: CoreId, targets: CoreSet, request: Shootdown) {
        // Entry stores must be globally visible before any core re-walks.
        fence(Ordering::SeqCst);
        self.handle_shootdown(issuer, request);

        let remote = targets
            .intersection(self.online())
            .difference(CoreSet::single(issuer));
        for core in remote.iter() {
            self.shootdowns_sent.fetch_add(1, Ordering::Relaxed);
            self.mmu.send_shootdown(issuer, core, request);
        }
    }
}
