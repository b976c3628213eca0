//! Error channels of the memory subsystem.
//!
//! [`MemoryError`] is returned to the caller, who decides whether to retry,
//! shrink the request or give up. [`Corruption`] is never returned: the
//! allocator hands it to its [`Halt`] capability, which does not come back.

use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_vmem::{MapError, SpaceError};
use log::error;

/// Recoverable failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("order {order} exceeds the maximum order {max}")]
    InvalidOrder { order: usize, max: usize },
    #[error("region {base:#x}+{size:#x} is not page-aligned")]
    UnalignedRegion { base: u64, size: u64 },
    #[error("region {base:#x}+{size:#x} overlaps a reserved region")]
    Overlap { base: u64, size: u64 },
    #[error("empty region")]
    EmptyRegion,
    #[error("region {base:#x}+{size:#x} wraps around or leaves the managed range")]
    AddressOverflow { base: u64, size: u64 },
    #[error("no region is reserved at {0}")]
    UnknownRegion(VirtualAddress),
    #[error("page-table update failed: {0}")]
    Mapping(MapError),
    #[error(transparent)]
    Space(#[from] SpaceError),
}

impl From<MapError> for MemoryError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Mapping(other),
        }
    }
}

/// Internal consistency failures. Continuing after one of these could hand
/// the same frame to two owners.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Corruption {
    #[error("double free of frame {frame} at order {order}")]
    DoubleFree { frame: FrameNumber, order: usize },
    #[error("corrupt free list at frame {frame} (order {order}): {detail}")]
    CorruptFreeList {
        frame: FrameNumber,
        order: usize,
        detail: &'static str,
    },
    #[error("reference count underflow on frame {frame}")]
    RefcountUnderflow { frame: FrameNumber },
    #[error("reference count overflow on frame {frame}")]
    RefcountOverflow { frame: FrameNumber },
    #[error("reference taken on free frame {frame}")]
    RefOnFreeFrame { frame: FrameNumber },
    #[error("frame {frame} is released with {refcount} references left")]
    StillReferenced { frame: FrameNumber, refcount: u32 },
    #[error("frame {frame} is not managed here")]
    UnknownFrame { frame: FrameNumber },
}

/// The unrecoverable path.
pub trait Halt: Sync {
    /// Stop after `fault` was detected in `operation`.
    fn halt(&self, fault: Corruption, operation: &'static str) -> !;
}

/// Logs the fault and panics; with `panic = "abort"` this stops the machine.
#[derive(Debug, Default, Copy, Clone)]
pub struct PanicHalt;

impl Halt for PanicHalt {
    fn halt(&self, fault: Corruption, operation: &'static str) -> ! {
        error!("fatal memory corruption in {operation}: {fault}");
        panic!("fatal memory corruption in {operation}: {fault}")
    }
}
