//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the addresses the memory subsystem passes
//! around, so a physical frame address can never be handed to code that
//! expects a virtual one (or a frame *number* where a byte address is meant).
//!
//! | Type | Meaning |
//! |----------|----------|
//! | [`PhysicalAddress`] | Byte address in host RAM or MMIO space. |
//! | [`VirtualAddress`] | Byte address translated by the page tables. |
//! | [`FrameNumber`] | Index of a 4 KiB physical frame (`pa >> PAGE_SHIFT`). |
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! let frame = FrameNumber::containing(pa);
//! assert_eq!(frame.base().as_u64(), 0x0000_0010_2000_0000);
//! assert_eq!(pa.page_offset(), 0x42);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys.
//! - All alignment and offset calculations are `const fn`.
//! - Only the 4 KiB base granularity is modelled; the subsystem never
//!   installs huge leaves.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of 4 KiB pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(align_down(0x1fff, PAGE_SIZE), 0x1000);
        assert_eq!(align_up(0x1001, PAGE_SIZE), Some(0x2000));
    }

    #[test]
    fn frame_number_roundtrips_page_base() {
        let pa = PhysicalAddress::new(0x0000_0000_0030_0123);
        let f = FrameNumber::containing(pa);
        assert_eq!(f.as_u64(), 0x300);
        assert_eq!(f.base(), PhysicalAddress::new(0x30_0000));
        assert_eq!(FrameNumber::from_base(f.base()), Some(f));
        assert_eq!(FrameNumber::from_base(pa), None);
    }

    #[test]
    fn virtual_address_helpers() {
        let va = VirtualAddress::new(0xFFFF_C900_0000_1234);
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_base(), VirtualAddress::new(0xFFFF_C900_0000_1000));
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(va.checked_add(u64::MAX), None);
        assert_eq!(format!("{va}"), "0xFFFFC90000001234");
    }
}
