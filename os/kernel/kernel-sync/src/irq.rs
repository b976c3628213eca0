//! Interrupt masking on the calling core.
//!
//! Allocator and mapping paths may be entered from interrupt context, so
//! every lock they take is taken with interrupts off. How interrupts are
//! switched off is a capability handed to the owning object at construction:
//! [`CpuInterrupts`] on real hardware, [`NoInterrupts`] where there is
//! nothing to mask, or a recording double in tests.

/// Capability to mask and unmask interrupts on the calling core.
pub trait InterruptControl: Sync {
    /// Disable interrupts and return whether they were enabled before.
    fn disable(&self) -> bool;

    /// Re-enable interrupts if `were_enabled` is set.
    fn restore(&self, were_enabled: bool);
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Nesting is fine: an inner guard created while interrupts are already off
/// records `were_enabled == false` and leaves them off when it drops.
///
/// ```rust
/// use kernel_sync::{IrqGuard, NoInterrupts};
///
/// let irq = NoInterrupts;
/// {
///     let _g = IrqGuard::new(&irq);
///     // critical section
/// }
/// ```
pub struct IrqGuard<'a> {
    irq: &'a dyn InterruptControl,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    #[inline]
    #[must_use]
    pub fn new(irq: &'a dyn InterruptControl) -> Self {
        let were_enabled = irq.disable();
        Self { irq, were_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.irq.restore(self.were_enabled);
    }
}

/// Interrupt control for contexts with nothing to mask.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    #[inline]
    fn disable(&self) -> bool {
        false
    }

    #[inline]
    fn restore(&self, _were_enabled: bool) {}
}

/// `cli`/`sti` based interrupt control for `x86_64`.
///
/// # Safety & Privilege
///
/// Must only be used in contexts where `cli`/`sti` are legal (ring 0).
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct CpuInterrupts;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl CpuInterrupts {
    /// `RFLAGS.IF`.
    const IF: u64 = 1 << 9;

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        // SAFETY: reads RFLAGS through the stack; no other state changes.
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
        r
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl InterruptControl for CpuInterrupts {
    #[inline]
    fn disable(&self) -> bool {
        let enabled = Self::rflags() & Self::IF != 0;
        if enabled {
            // SAFETY: ring 0; masking interrupts on this core only.
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        enabled
    }

    #[inline]
    fn restore(&self, were_enabled: bool) {
        if were_enabled {
            // SAFETY: ring 0; they were enabled when the matching `disable` ran.
            unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}
