//! # Memory Page Table
//!
//! The hardware format of one x86-64 paging structure (512 × 8-byte entries)
//! plus the protection vocabulary callers use to describe leaf mappings.
//!
//! Entries are stored as [`AtomicU64`] because the CPU sets the accessed and
//! dirty bits of live entries behind our back; harvesting those bits is a
//! read-modify-write that must not lose a concurrent hardware update.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Number of entries per table at every level.
pub const ENTRIES: usize = 512;

/// First PML4 slot of the shared kernel half.
pub const KERNEL_HALF_FIRST_SLOT: usize = ENTRIES / 2;

/// Represents a single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This models the common superset of fields found in all four paging
/// levels (PML4E, PDPTE, PDE, PTE).
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–62     | OS avail high     | Reserved for OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x12345000));
/// assert!(e.present());
/// assert_eq!(e.physical_address().as_u64(), 0x12345000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5).
    ///
    /// Set by the CPU on first access through this entry.
    pub accessed: bool,

    /// Dirty (D, bit 6): **leaf only**.
    ///
    /// Set by the CPU on first write to a leaf mapping.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Never set by this crate; encountered in a walk it means somebody else
    /// installed a 2 MiB / 1 GiB leaf.
    pub large_page: bool,

    /// Global (G, bit 8): **leaf only**.
    ///
    /// When set, the TLB entry survives CR3 reloads.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=62).
    #[bits(11)]
    pub os_available_high: u16,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, phys: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_51_12(phys.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Non-leaf link to a next-level table.
    ///
    /// Links are always writable; user links are additionally `US` so that the
    /// leaf decides the effective permission.
    #[inline]
    #[must_use]
    pub const fn table_link(next: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(next)
    }

    /// 4 KiB leaf mapping `phys` with the given protection.
    #[inline]
    #[must_use]
    pub const fn leaf(phys: PhysicalAddress, prot: PageProtection) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(prot.contains(PageProtection::WRITE))
            .with_user_access(prot.contains(PageProtection::USER))
            .with_write_through(prot.contains(PageProtection::WRITE_THROUGH))
            .with_cache_disabled(prot.contains(PageProtection::NO_CACHE))
            .with_global_translation(prot.contains(PageProtection::GLOBAL))
            .with_no_execute(!prot.contains(PageProtection::EXECUTE))
            .with_physical_address(phys)
    }
}

bitflags::bitflags! {
    /// Access rights and cache attributes of a leaf mapping.
    ///
    /// Readable is implied for every present mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageProtection: u8 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
        const USER = 1 << 2;
        /// Survives root switches; kernel-half mappings only.
        const GLOBAL = 1 << 3;
        /// Uncached; device registers.
        const NO_CACHE = 1 << 4;
        const WRITE_THROUGH = 1 << 5;

        /// Kernel data: read/write, no execute, global.
        const KERNEL_DATA = Self::WRITE.bits() | Self::GLOBAL.bits();
        /// Device registers: read/write, uncached, global.
        const DEVICE = Self::WRITE.bits() | Self::NO_CACHE.bits() | Self::GLOBAL.bits();
        /// User data: read/write, no execute.
        const USER_DATA = Self::WRITE.bits() | Self::USER.bits();
    }
}

/// One 4 KiB paging structure.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES],
}

impl PageTable {
    /// Clear every entry.
    pub fn zero(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[index].load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, index: usize, entry: PageEntryBits) {
        self.entries[index].store(entry.into_bits(), Ordering::Release);
    }

    /// Atomically clear the entry and return what it held.
    #[inline]
    pub fn take(&self, index: usize) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[index].swap(0, Ordering::AcqRel))
    }

    /// Atomically clear the bits in `mask` and return the previous entry.
    #[inline]
    pub fn clear_bits(&self, index: usize, mask: PageEntryBits) -> PageEntryBits {
        PageEntryBits::from_bits(
            self.entries[index].fetch_and(!mask.into_bits(), Ordering::AcqRel),
        )
    }
}

/// Split a virtual address into its `[PML4, PDPT, PD, PT]` indices.
///
/// ```text
/// | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
/// |  PML4 |  PDPT |   PD  |   PT  | Offset |
/// ```
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_indices(va: VirtualAddress) -> [usize; 4] {
    let v = va.as_u64();
    [
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    ]
}

/// Rebuild the canonical virtual address of a 4 KiB leaf from its indices.
#[inline]
#[must_use]
pub const fn join_indices(idx: [usize; 4]) -> VirtualAddress {
    let raw = ((idx[0] as u64) << 39)
        | ((idx[1] as u64) << 30)
        | ((idx[2] as u64) << 21)
        | ((idx[3] as u64) << 12);
    // sign-extend bit 47
    let canonical = if raw & (1 << 47) != 0 {
        raw | 0xFFFF_0000_0000_0000
    } else {
        raw
    };
    VirtualAddress::new(canonical)
}
