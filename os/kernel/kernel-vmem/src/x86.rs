//! `x86_64` implementation of [`Mmu`].

use crate::{CoreId, Mmu, Shootdown};
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::{Cr3, Pcid, StoreRegisterUnsafe};

/// Drives the local MMU with `mov cr3`, `invlpg` and `invpcid`.
///
/// Remote work is handed to `send_ipi`, which must deliver the request to
/// the target core, have it call `TlbCoordinator::handle_shootdown`, and wait
/// for the acknowledgement.
pub struct X86Mmu<F> {
    send_ipi: F,
}

impl<F> X86Mmu<F>
where
    F: Fn(CoreId, CoreId, Shootdown) + Sync,
{
    pub const fn new(send_ipi: F) -> Self {
        Self { send_ipi }
    }
}

/// INVPCID type 0: one address in one context.
const INVPCID_INDIVIDUAL_ADDRESS: u64 = 0;

/// INVPCID type 2: all contexts, global translations included.
const INVPCID_ALL_INCLUDING_GLOBAL: u64 = 2;

impl<F> Mmu for X86Mmu<F>
where
    F: Fn(CoreId, CoreId, Shootdown) + Sync,
{
    fn load_root(&self, _core: CoreId, root: Cr3) {
        // SAFETY: ring 0; the root maps the running kernel through the shared upper half.
        unsafe { root.store_unsafe() }
    }

    fn invalidate_page(&self, _core: CoreId, pcid: Pcid, va: VirtualAddress) {
        if pcid == Pcid::KERNEL {
            // Kernel leaves are global; `invlpg` drops them under every PCID.
            // SAFETY: ring 0; `invlpg` only discards cached translations.
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
            }
            return;
        }

        let descriptor = [u64::from(pcid.as_u16()), va.as_u64()];
        // SAFETY: ring 0 with CR4.PCIDE set; the descriptor is a valid
        // 16-byte INVPCID operand with a 12-bit PCID and a canonical address.
        unsafe {
            core::arch::asm!(
                "invpcid {}, [{}]",
                in(reg) INVPCID_INDIVIDUAL_ADDRESS,
                in(reg) descriptor.as_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn invalidate_all(&self, _core: CoreId) {
        let descriptor = [0u64; 2];
        // SAFETY: ring 0 with CR4.PCIDE set; type 2 ignores the descriptor contents.
        unsafe {
            core::arch::asm!(
                "invpcid {}, [{}]",
                in(reg) INVPCID_ALL_INCLUDING_GLOBAL,
                in(reg) descriptor.as_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn send_shootdown(&self, from: CoreId, to: CoreId, request: Shootdown) {
        (self.send_ipi)(from, to, request);
    }
}
