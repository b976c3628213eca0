//! # Kernel Memory Allocation
//!
//! Physical frame management and kernel virtual regions, built on the page
//! tables and TLB coordination of `kernel-vmem`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  VirtualRegionAllocator          UserMemory         │
//! │    • vmalloc window intervals      • anonymous maps │
//! │    • device (ioremap) windows      • shared frames  │
//! └──────────────┬───────────────────────────┬──────────┘
//!                │ map / unmap / flush        │
//! ┌──────────────▼───────────────────────────▼──────────┐
//! │            AddressSpace + TlbCoordinator            │
//! │                    (kernel-vmem)                    │
//! └──────────────┬──────────────────────────────────────┘
//!                │ frames for data and page tables
//! ┌──────────────▼──────────────────────────────────────┐
//! │  FramePool                                          │
//! │    • FrameAllocator: buddy lists, orders 0..=10     │
//! │    • PageRegistry: refcount + flags per frame       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure model
//!
//! Exhaustion and bad arguments come back as [`MemoryError`]. Damaged
//! allocator state (a double free, a broken free list, a reference count
//! dropping below zero) is never returned: it goes to the [`Halt`] the
//! allocator was built with, which does not return.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::{FramePool, PanicHalt};
//! use kernel_memory_addresses::FrameNumber;
//! use kernel_sync::NoInterrupts;
//!
//! let pool = FramePool::new(FrameNumber::new(0x100), 64, &NoInterrupts, &PanicHalt).unwrap();
//! let block = pool.alloc_pages(2).unwrap();
//! assert_eq!(pool.registry().refcount(block), 1);
//! assert!(pool.put_pages(block, 2));
//! assert_eq!(pool.frames().free_frames(), 64);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod error;
pub mod frame_alloc;
mod free_list;
pub mod page_meta;
pub mod phys_mapper;
pub mod pool;
pub mod user;
pub mod vmm;

pub use crate::error::{Corruption, Halt, MemoryError, PanicHalt};
pub use crate::frame_alloc::{FrameAllocator, block_frames};
pub use crate::page_meta::{PageFlags, PageRegistry};
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::pool::FramePool;
pub use crate::user::UserMemory;
pub use crate::vmm::{RegionWindow, VirtualRegion, VirtualRegionAllocator};
