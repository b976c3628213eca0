//! # Kernel synchronization primitives
//!
//! A test-and-test-and-set [`SpinLock`] plus the [`InterruptControl`]
//! capability used to make lock holders safe against re-entry from
//! interrupt handlers on the same core.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{InterruptControl, IrqGuard, NoInterrupts};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use irq::CpuInterrupts;
