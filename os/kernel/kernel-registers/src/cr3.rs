#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Process-context identifier (12 bits) tagging TLB entries with their address space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pcid(u16);

impl Pcid {
    /// Largest representable PCID.
    pub const MAX: u16 = 0x0FFF;

    /// Reserved for the kernel's own address space.
    pub const KERNEL: Self = Self(0);

    /// Returns `None` if `v` does not fit in 12 bits.
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        if v <= Self::MAX { Some(Self(v)) } else { None }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Pcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

/// CR3: Page-Map Level-4 Base Register (IA-32e, CR4.PCIDE = 1).
///
/// Holds the physical base address of the PML4 table, the PCID the loaded
/// translations are tagged with, and the no-flush hint for the write.
#[bitfield(u64, debug = false)]
pub struct Cr3 {
    /// Bits 0–11: PCID of the address space being loaded.
    #[bits(12)]
    pcid_bits: u16,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–62: Reserved (must be 0).
    #[bits(11)]
    __: u16,

    /// Bit 63: on a write, keep TLB entries tagged with this PCID.
    ///
    /// Not stored by the CPU; reads always return 0.
    pub no_flush: bool,
}

impl Cr3 {
    /// Create a `Cr3` value from a PML4 physical base address, PCID and no-flush hint.
    ///
    /// `pml4_phys` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_root(pml4_phys: PhysicalAddress, pcid: Pcid, no_flush: bool) -> Self {
        debug_assert!(pml4_phys.is_page_aligned(), "PML4 base must be 4K-aligned");
        Self::new()
            .with_pcid_bits(pcid.as_u16())
            .with_pml4_base_4k(pml4_phys.as_u64() >> 12)
            .with_no_flush(no_flush)
    }

    /// Return the full physical address of the PML4 base.
    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }

    #[must_use]
    pub const fn pcid(&self) -> Pcid {
        Pcid(self.pcid_bits())
    }
}

impl fmt::Debug for Cr3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cr3")
            .field("pml4", &self.pml4_phys())
            .field("pcid", &self.pcid())
            .field("no_flush", &self.no_flush())
            .finish()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        // SAFETY: reading CR3 has no side effects in ring 0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        // SAFETY: upheld by the caller per the trait contract.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
