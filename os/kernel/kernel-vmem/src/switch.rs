//! # Per-core active address space
//!
//! [`CoreContexts`] is the one place that records which address space each
//! core runs on. The task switcher passes the executing core's [`CoreId`]
//! explicitly; nothing here reads a register or a per-CPU pointer to find
//! out where it is running.
//!
//! ## Switch sequence
//!
//! With interrupts off on the switching core:
//!
//! 1. If the slot already holds the target, return: no root write, no flush.
//! 2. Add the core to the target's active set (clearing a stale mark).
//! 3. Write the root register, keeping tagged entries unless the core was stale.
//! 4. Store the target in the slot and drop the core from the previous
//!    space's active set.
//!
//! Step 2 precedes the root write so that a concurrent flush of the target
//! either reaches this core by shootdown or leaves a stale mark that step 3
//! honors.

use crate::{AddressSpace, CoreId, Mmu, PhysMapper, SpaceError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{InterruptControl, IrqGuard, SpinLock};
use log::debug;

/// Result of [`CoreContexts::switch_to`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwitchOutcome {
    /// The target was already active on the core; nothing was written.
    AlreadyActive,
    /// The root register was written.
    Switched {
        /// Whether the load dropped the target's tagged translations.
        flushed: bool,
    },
}

type Slot<'m, M> = SpinLock<Option<Arc<AddressSpace<'m, M>>>>;

pub struct CoreContexts<'m, M: PhysMapper> {
    slots: Vec<Slot<'m, M>>,
    mmu: &'m dyn Mmu,
    irq: &'m dyn InterruptControl,
    root_writes: AtomicU64,
}

impl<'m, M: PhysMapper> CoreContexts<'m, M> {
    /// Slots for `cores` cores, all detached.
    #[must_use]
    pub fn new(cores: usize, mmu: &'m dyn Mmu, irq: &'m dyn InterruptControl) -> Self {
        let cores = cores.min(kernel_info::memory::MAX_CORES);
        Self {
            slots: (0..cores).map(|_| SpinLock::new(None)).collect(),
            mmu,
            irq,
            root_writes: AtomicU64::new(0),
        }
    }

    /// Number of configured cores.
    #[must_use]
    pub fn cores(&self) -> usize {
        self.slots.len()
    }

    /// The address space currently active on `core`.
    #[must_use]
    pub fn current(&self, core: CoreId) -> Option<Arc<AddressSpace<'m, M>>> {
        let slot = self.slots.get(core.index())?;
        slot.lock_irq(self.irq).clone()
    }

    /// Make `target` the active address space of `core`.
    ///
    /// Must be called on `core` itself.
    ///
    /// # Errors
    /// [`SpaceError::UnknownCore`] if `core` has no slot.
    pub fn switch_to(
        &self,
        core: CoreId,
        target: &Arc<AddressSpace<'m, M>>,
    ) -> Result<SwitchOutcome, SpaceError> {
        let slot = self
            .slots
            .get(core.index())
            .ok_or(SpaceError::UnknownCore(core))?;

        let _irq = IrqGuard::new(self.irq);
        let mut current = slot.lock();
        if current.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, target)) {
            return Ok(SwitchOutcome::AlreadyActive);
        }

        let flush = target.activate_on(core);
        self.mmu.load_root(core, target.cr3(!flush));
        self.root_writes.fetch_add(1, Ordering::Relaxed);

        let previous = current.replace(Arc::clone(target));
        if let Some(prev) = &previous {
            prev.deactivate_on(core);
        }
        drop(current);

        debug!(
            "switch: {core} -> root {} (pcid {}){}",
            target.root(),
            target.asid(),
            if flush { ", flushed" } else { "" }
        );
        Ok(SwitchOutcome::Switched { flushed: flush })
    }

    /// Forget the active space of an offline core without touching its registers.
    ///
    /// # Errors
    /// [`SpaceError::UnknownCore`] if `core` has no slot.
    pub fn detach(&self, core: CoreId) -> Result<Option<Arc<AddressSpace<'m, M>>>, SpaceError> {
        let slot = self
            .slots
            .get(core.index())
            .ok_or(SpaceError::UnknownCore(core))?;
        let previous = slot.lock_irq(self.irq).take();
        if let Some(prev) = &previous {
            prev.deactivate_on(core);
        }
        Ok(previous)
    }

    /// Root-register writes performed so far.
    #[must_use]
    pub fn root_writes(&self) -> u64 {
        self.root_writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpFrameAlloc, MachineEvent, RecordingMachine, TestPhysMemory};
    use crate::{AsidAllocator, CoreSet, PageProtection, TlbCoordinator};
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
    use kernel_registers::Pcid;

    fn c(i: usize) -> CoreId {
        CoreId::new(i).unwrap()
    }

    fn alloc() -> BumpFrameAlloc {
        BumpFrameAlloc::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x20_0000))
    }

    #[test]
    fn second_switch_to_same_space_is_a_no_op() {
        let phys = TestPhysMemory::new();
        let m = RecordingMachine::new();
        let frames = alloc();
        let asids = AsidAllocator::new();
        let tlb = TlbCoordinator::new(&m, CoreSet::first(2));
        let k = AddressSpace::new_kernel(&phys, &tlb, &m, &frames).unwrap();
        let a = Arc::new(AddressSpace::new_user(&k, &asids, &frames).unwrap());
        let va = VirtualAddress::new(0x40_0000);
        a.map_4k(&frames, va, PhysicalAddress::new(0x7_0000), PageProtection::USER_DATA)
            .unwrap();
        let ctx = CoreContexts::new(2, &m, &m);

        assert_eq!(ctx.switch_to(c(0), &a), Ok(SwitchOutcome::Switched { flushed: false }));
        assert_eq!(a.query(va), Some(PhysicalAddress::new(0x7_0000)));
        assert_eq!(ctx.switch_to(c(0), &a), Ok(SwitchOutcome::AlreadyActive));
        assert_eq!(a.query(va), Some(PhysicalAddress::new(0x7_0000)));

        assert_eq!(ctx.root_writes(), 1);
        assert_eq!(
            m.events(),
            vec![MachineEvent::LoadRoot {
                core: c(0),
                root: a.root(),
                pcid: a.asid(),
                no_flush: true,
            }]
        );
        assert_eq!(m.loads_with_interrupts_enabled(), 0);
        assert!(m.interrupts_enabled());
    }

    #[test]
    fn switch_moves_core_between_active_sets() {
        let phys = TestPhysMemory::new();
        let m = RecordingMachine::new();
        let frames = alloc();
        let asids = AsidAllocator::new();
        let tlb = TlbCoordinator::new(&m, CoreSet::first(2));
        let k = Arc::new(AddressSpace::new_kernel(&phys, &tlb, &m, &frames).unwrap());
        let a = Arc::new(AddressSpace::new_user(&k, &asids, &frames).unwrap());
        let b = Arc::new(AddressSpace::new_user(&k, &asids, &frames).unwrap());
        let ctx = CoreContexts::new(2, &m, &m);

        ctx.switch_to(c(0), &a).unwrap();
        ctx.switch_to(c(1), &a).unwrap();
        assert_eq!(a.active_cores(), CoreSet::first(2));

        ctx.switch_to(c(1), &b).unwrap();
        assert_eq!(a.active_cores(), CoreSet::single(c(0)));
        assert_eq!(b.active_cores(), CoreSet::single(c(1)));
        assert!(Arc::ptr_eq(&ctx.current(c(1)).unwrap(), &b));

        ctx.switch_to(c(1), &k).unwrap();
        assert!(b.active_cores().is_empty());
        assert_eq!(m.root_loads().last(), Some(&(c(1), k.root(), true)));
        assert_eq!(k.asid(), Pcid::KERNEL);
    }

    #[test]
    fn edit_while_inactive_forces_flushing_load() {
        let phys = TestPhysMemory::new();
        let m = RecordingMachine::new();
        let frames = alloc();
        let asids = AsidAllocator::new();
        let tlb = TlbCoordinator::new(&m, CoreSet::first(2));
        let k = Arc::new(AddressSpace::new_kernel(&phys, &tlb, &m, &frames).unwrap());
        let a = Arc::new(AddressSpace::new_user(&k, &asids, &frames).unwrap());
        let ctx = CoreContexts::new(2, &m, &m);

        ctx.switch_to(c(1), &a).unwrap();
        ctx.switch_to(c(1), &k).unwrap();

        let va = VirtualAddress::new(0x40_0000);
        a.map_4k(&frames, va, PhysicalAddress::new(0x8_0000), PageProtection::USER_DATA)
            .unwrap();
        a.flush_page(c(0), va);
        assert!(m.shootdowns_to().is_empty());

        assert_eq!(ctx.switch_to(c(1), &a), Ok(SwitchOutcome::Switched { flushed: true }));
        assert_eq!(m.root_loads().last(), Some(&(c(1), a.root(), false)));
        // mark consumed
        ctx.switch_to(c(1), &k).unwrap();
        assert_eq!(ctx.switch_to(c(1), &a), Ok(SwitchOutcome::Switched { flushed: false }));
    }

    #[test]
    fn late_shootdown_targets_the_space_it_was_sent_for() {
        let phys = TestPhysMemory::new();
        let m = RecordingMachine::new();
        let frames = alloc();
        let asids = AsidAllocator::new();
        let tlb = TlbCoordinator::new(&m, CoreSet::first(2));
        let k = Arc::new(AddressSpace::new_kernel(&phys, &tlb, &m, &frames).unwrap());
        let a = Arc::new(AddressSpace::new_user(&k, &asids, &frames).unwrap());
        let ctx = CoreContexts::new(2, &m, &m);
        let va = VirtualAddress::new(0x40_0000);
        a.map_4k(&frames, va, PhysicalAddress::new(0x8_0000), PageProtection::USER_DATA)
            .unwrap();

        ctx.switch_to(c(1), &a).unwrap();
        m.clear();
        a.unmap_4k(va).unwrap();
        a.flush_page(c(0), va);
        let request = match m.events().last() {
            Some(MachineEvent::Shootdown { to, request, .. }) if *to == c(1) => *request,
            other => panic!("expected a shootdown to cpu1, got {other:?}"),
        };

        // cpu1 leaves before it gets to handle the request
        ctx.switch_to(c(1), &k).unwrap();
        m.clear();
        tlb.handle_shootdown(c(1), request);
        assert_eq!(
            m.events(),
            vec![MachineEvent::InvalidatePage {
                core: c(1),
                pcid: a.asid(),
                va
            }]
        );
        assert_ne!(a.asid(), k.asid());
    }

    #[test]
    fn detach_and_unknown_core() {
        let phys = TestPhysMemory::new();
        let m = RecordingMachine::new();
        let frames = alloc();
        let tlb = TlbCoordinator::new(&m, CoreSet::first(1));
        let k = Arc::new(AddressSpace::new_kernel(&phys, &tlb, &m, &frames).unwrap());
        let ctx = CoreContexts::new(1, &m, &m);

        assert_eq!(ctx.switch_to(c(5), &k), Err(SpaceError::UnknownCore(c(5))));
        ctx.switch_to(c(0), &k).unwrap();
        let prev = ctx.detach(c(0)).unwrap();
        assert!(prev.is_some_and(|p| Arc::ptr_eq(&p, &k)));
        assert!(k.active_cores().is_empty());
        assert!(ctx.current(c(0)).is_none());
    }
}
