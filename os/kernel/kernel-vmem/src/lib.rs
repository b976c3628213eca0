//! # Virtual Memory Support
//!
//! x86-64 paging, address spaces, and translation-cache coherence for the
//! kernel.
//!
//! ## What you get
//! - The 4-level [`PageTable`] format with [`PageEntryBits`] and a
//!   [`PageProtection`] vocabulary for leaf mappings.
//! - [`AddressSpace`]: one PML4 root plus the bookkeeping of which cores have
//!   it loaded (and which cores may still cache its old translations).
//! - [`TlbCoordinator`]: page, range and full invalidations, local plus
//!   shootdowns to the other cores that need them.
//! - [`CoreContexts`]: the per-core record of the active address space and the
//!   [`switch_to`](CoreContexts::switch_to) entry point of the task switcher.
//! - The seams to the rest of the kernel: [`FrameAlloc`] (page-table frames),
//!   [`PhysMapper`] (touching physical memory) and [`Mmu`] (the hardware).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (maps 4 KiB page)
//!   │        │        └────────────► PDE   (points to a PT)
//!   │        └─────────────────────► PDPTE (points to a PD)
//!   └──────────────────────────────► PML4E (points to a PDPT)
//! ```
//!
//! Only 4 KiB leaves are ever installed by this crate. The upper 256 PML4
//! slots form the kernel half and are shared (by copying the PML4 entries)
//! between the kernel space and every user space.
//!
//! ## Coherence rule
//!
//! After a page-table entry changes, the matching invalidation is issued
//! before anything relies on the new state. Mapping functions on
//! [`AddressSpace`] only edit tables; the `flush_*` functions on the same
//! type pick the cores that need to hear about it.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod core_set;
mod page_table;
pub mod switch;
pub mod tlb;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod x86;

pub use crate::address_space::{AddressSpace, AsidAllocator, MapError, SpaceError, SpaceKind};
pub use crate::core_set::{CoreId, CoreSet};
pub use crate::page_table::{
    ENTRIES, KERNEL_HALF_FIRST_SLOT, PageEntryBits, PageProtection, PageTable, join_indices,
    split_indices,
};
pub use crate::switch::{CoreContexts, SwitchOutcome};
pub use crate::tlb::{FlushStats, Shootdown, TlbCoordinator};
pub use kernel_registers::{Cr3, Pcid};

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::x86::X86Mmu;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Implementations lock internally, so the trait takes `&self` and can be
/// shared by every address space.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Returns `None` on out-of-memory.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, pa: PhysicalAddress);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via identity map or a higher-half direct map, HHDM).
pub trait PhysMapper: Sync {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped as writable for the lifetime `'a`.
    /// - Type `T` must match the bytes at `pa`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The translation hardware of every core.
///
/// Local operations (`load_root`, `invalidate_*`) run on `core`, which is
/// always the core executing the call. [`send_shootdown`](Self::send_shootdown)
/// asks another core to run [`TlbCoordinator::handle_shootdown`] and returns
/// once that core acknowledged.
pub trait Mmu: Sync {
    /// Write the translation root register of `core`.
    fn load_root(&self, core: CoreId, root: Cr3);

    /// Drop `core`'s cached translation of the page containing `va`, as
    /// tagged with `pcid`, whether or not that space is loaded on `core`.
    ///
    /// For [`Pcid::KERNEL`] the translation is global.
    fn invalidate_page(&self, core: CoreId, pcid: Pcid, va: VirtualAddress);

    /// Drop every cached translation on `core`, global ones included.
    fn invalidate_all(&self, core: CoreId);

    /// Deliver `request` from `from` to `to` and wait for it to complete.
    fn send_shootdown(&self, from: CoreId, to: CoreId, request: Shootdown);
}
