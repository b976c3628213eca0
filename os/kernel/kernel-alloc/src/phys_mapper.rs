//! # HHDM-based `PhysMapper`
//!
//! With a higher-half direct map every physical address is reachable at
//! `HHDM_BASE + pa`. [`HhdmPhysMapper`] is the [`PhysMapper`] the running
//! kernel hands to its [`AddressSpace`](kernel_vmem::AddressSpace)s; hosted
//! tests use [`TestPhysMemory`](kernel_vmem::testing::TestPhysMemory) instead.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let mapper = HhdmPhysMapper;
//! unsafe {
//!     let table: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x1234_0000));
//!     table.zero();
//! }
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// # Safety
/// The direct map must be present and cover every frame handed to it.
#[derive(Debug, Copy, Clone, Default)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Where `pa` shows up in the direct map.
    #[must_use]
    pub const fn virt(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virt(pa).as_u64() as *mut T;
        // SAFETY: Caller guarantees `pa` is mapped through the HHDM and holds a `T`.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_offsets_by_hhdm_base() {
        let va = HhdmPhysMapper::virt(PhysicalAddress::new(0x1234_5000));
        assert_eq!(va.as_u64(), HHDM_BASE + 0x1234_5000);
        assert!(va.is_page_aligned());
    }
}
