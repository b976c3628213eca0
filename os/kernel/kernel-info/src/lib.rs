//! # Kernel Memory Configuration
//!
//! This crate is the single source of truth for the compile-time layout and
//! tuning constants shared by the memory subsystem crates (`kernel-vmem`,
//! `kernel-alloc`). Everything in here is a `const`; runtime parameters such
//! as the managed frame range or the set of online cores are passed to the
//! respective constructors instead.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//!                       │  (per address space, lower half)│
//! USERSPACE_END         ├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! VMALLOC_START         ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   Kernel region window          │
//!                       │   (heap growth, device mmio)    │
//! VMALLOC_END           ├─────────────────────────────────┤ 0xffff_e900_0000_0000
//!                       │        Guard Region             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The upper half (everything at or above [`KERNEL_HALF_START`](memory::KERNEL_HALF_START))
//! is shared by every address space; the lower half is private.
//!
//! ## Allocator Tuning
//!
//! * [`MAX_ORDER`](memory::MAX_ORDER): largest buddy block is `2^MAX_ORDER` frames.
//! * [`TLB_FLUSH_ALL_THRESHOLD_PAGES`](memory::TLB_FLUSH_ALL_THRESHOLD_PAGES):
//!   ranges above this size are flushed with one full invalidation.
//! * [`IOREMAP_MAX_ALIGN_SHIFT`](memory::IOREMAP_MAX_ALIGN_SHIFT): cap on the
//!   natural alignment given to device mappings.
//! * [`MAX_CORES`](memory::MAX_CORES): width of the per-address-space core sets.
//!
//! Compile-time assertions in [`memory`] reject inconsistent combinations.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
