//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// First address of the shared kernel half (PML4 slot 256 onwards).
pub const KERNEL_HALF_START: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window handed out by the kernel region allocator.
pub const VMALLOC_START: u64 = 0xffff_c900_0000_0000;

/// Exclusive end of the kernel region window (32 TiB).
pub const VMALLOC_END: u64 = 0xffff_e900_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Largest buddy order; blocks span at most `2^MAX_ORDER` frames (4 MiB).
pub const MAX_ORDER: usize = 10;

/// Device mappings are naturally aligned up to `1 << IOREMAP_MAX_ALIGN_SHIFT` bytes.
pub const IOREMAP_MAX_ALIGN_SHIFT: u32 = 19;

/// Ranges larger than this many pages get one full invalidation instead of per-page ones.
pub const TLB_FLUSH_ALL_THRESHOLD_PAGES: u64 = 32;

/// Number of cores representable in a core set.
pub const MAX_CORES: usize = 64;

const _: () = {
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_HALF_START >= USERSPACE_END);
    assert!(HHDM_BASE >= KERNEL_HALF_START);
    assert!(VMALLOC_START > HHDM_BASE);
    assert!(VMALLOC_END > VMALLOC_START);
    assert!(KERNEL_BASE > VMALLOC_END);
    assert!(VMALLOC_START.is_multiple_of(1 << IOREMAP_MAX_ALIGN_SHIFT));
    assert!(IOREMAP_MAX_ALIGN_SHIFT >= 12);
    assert!(MAX_ORDER < 16);
    assert!(TLB_FLUSH_ALL_THRESHOLD_PAGES > 0);
    assert!(MAX_CORES <= u64::BITS as usize);
};
