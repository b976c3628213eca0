//! Host-side stand-ins for physical memory and the MMU.
//!
//! Available to this crate's unit tests and, through the `test-support`
//! feature, to the tests of crates layered on top.

use crate::{CoreId, FrameAlloc, Mmu, PageTable, PhysMapper, Shootdown, split_indices};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_registers::{Cr3, Pcid};
use kernel_sync::{InterruptControl, SpinLock};

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// Sparse "physical RAM": frames spring into existence, zeroed, on first touch.
///
/// Physical addresses are plain byte offsets. Backing boxes are never freed
/// before the memory itself is dropped, so handed-out references stay valid.
#[derive(Default)]
pub struct TestPhysMemory {
    frames: SpinLock<BTreeMap<u64, Box<UnsafeCell<Frame>>>>,
}

impl TestPhysMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct frames touched so far.
    #[must_use]
    pub fn frames_touched(&self) -> usize {
        self.frames.lock().len()
    }

    /// Do what the CPU's page walker does on an access through `root`: set
    /// the accessed bit of the leaf for `va`, and the dirty bit on a write.
    ///
    /// Returns `false` if `va` has no present 4 KiB leaf.
    #[must_use]
    pub fn touch(&self, root: PhysicalAddress, va: VirtualAddress, write: bool) -> bool {
        let idx = split_indices(va);
        // SAFETY: `root` and every linked table are frames of this memory.
        let mut table: &PageTable = unsafe { self.phys_to_mut::<PageTable>(root) };
        for &i in &idx[..3] {
            let e = table.get(i);
            if !e.present() || e.large_page() {
                return false;
            }
            // SAFETY: as above.
            table = unsafe { self.phys_to_mut::<PageTable>(e.physical_address()) };
        }
        let leaf = table.get(idx[3]);
        if !leaf.present() {
            return false;
        }
        table.set(idx[3], leaf.with_accessed(true).with_dirty(leaf.dirty() || write));
        true
    }

    fn frame_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(pa.as_u64() >> PAGE_SHIFT)
            .or_insert_with(|| Box::new(UnsafeCell::new(Frame([0; 4096]))));
        frame.get().cast::<u8>()
    }
}

impl PhysMapper for TestPhysMemory {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.page_offset() as usize + size_of::<T>() <= PAGE_SIZE as usize);
        let base = self.frame_ptr(pa);
        // SAFETY: the frame outlives `self`; the caller promises `T` matches.
        unsafe { &mut *base.add(pa.page_offset() as usize).cast::<T>() }
    }
}

/// Hands out consecutive frames from `[start, end)` and records frees.
pub struct BumpFrameAlloc {
    next: AtomicU64,
    end: u64,
    freed: SpinLock<Vec<PhysicalAddress>>,
}

impl BumpFrameAlloc {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            next: AtomicU64::new(start.as_u64()),
            end: end.as_u64(),
            freed: SpinLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn freed(&self) -> Vec<PhysicalAddress> {
        self.freed.lock().clone()
    }
}

impl FrameAlloc for BumpFrameAlloc {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        let pa = self.next.fetch_add(PAGE_SIZE, Ordering::Relaxed);
        (pa + PAGE_SIZE <= self.end).then(|| PhysicalAddress::new(pa))
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        self.freed.lock().push(pa);
    }
}

/// What the recording machine observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MachineEvent {
    LoadRoot {
        core: CoreId,
        root: PhysicalAddress,
        pcid: Pcid,
        no_flush: bool,
    },
    InvalidatePage {
        core: CoreId,
        pcid: Pcid,
        va: VirtualAddress,
    },
    InvalidateAll {
        core: CoreId,
    },
    Shootdown {
        from: CoreId,
        to: CoreId,
        request: Shootdown,
    },
}

/// An [`Mmu`] and [`InterruptControl`] that only records.
///
/// Shootdowns are logged, not executed on the target.
pub struct RecordingMachine {
    events: SpinLock<Vec<MachineEvent>>,
    interrupts_enabled: AtomicBool,
    interrupt_disables: AtomicUsize,
    loads_with_interrupts: AtomicUsize,
}

impl Default for RecordingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingMachine {
    /// A machine with interrupts enabled.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: SpinLock::new(Vec::new()),
            interrupts_enabled: AtomicBool::new(true),
            interrupt_disables: AtomicUsize::new(0),
            loads_with_interrupts: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Every root-register write as `(core, root, no_flush)`.
    #[must_use]
    pub fn root_loads(&self) -> Vec<(CoreId, PhysicalAddress, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match *e {
                MachineEvent::LoadRoot {
                    core,
                    root,
                    no_flush,
                    ..
                } => Some((core, root, no_flush)),
                _ => None,
            })
            .collect()
    }

    /// Targets of every shootdown, in send order.
    #[must_use]
    pub fn shootdowns_to(&self) -> Vec<CoreId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match *e {
                MachineEvent::Shootdown { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn local_page_invalidations(&self) -> usize {
        self.count(|e| matches!(e, MachineEvent::InvalidatePage { .. }))
    }

    #[must_use]
    pub fn full_invalidations(&self) -> usize {
        self.count(|e| matches!(e, MachineEvent::InvalidateAll { .. }))
    }

    #[must_use]
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn interrupt_disables(&self) -> usize {
        self.interrupt_disables.load(Ordering::SeqCst)
    }

    /// Root writes that happened while interrupts were enabled.
    #[must_use]
    pub fn loads_with_interrupts_enabled(&self) -> usize {
        self.loads_with_interrupts.load(Ordering::SeqCst)
    }

    fn count(&self, f: impl Fn(&MachineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }

    fn record(&self, event: MachineEvent) {
        self.events.lock().push(event);
    }
}

impl Mmu for RecordingMachine {
    fn load_root(&self, core: CoreId, root: Cr3) {
        if self.interrupts_enabled() {
            self.loads_with_interrupts.fetch_add(1, Ordering::SeqCst);
        }
        self.record(MachineEvent::LoadRoot {
            core,
            root: root.pml4_phys(),
            pcid: root.pcid(),
            no_flush: root.no_flush(),
        });
    }

    fn invalidate_page(&self, core: CoreId, pcid: Pcid, va: VirtualAddress) {
        self.record(MachineEvent::InvalidatePage { core, pcid, va });
    }

    fn invalidate_all(&self, core: CoreId) {
        self.record(MachineEvent::InvalidateAll { core });
    }

    fn send_shootdown(&self, from: CoreId, to: CoreId, request: Shootdown) {
        self.record(MachineEvent::Shootdown { from, to, request });
    }
}

impl InterruptControl for RecordingMachine {
    fn disable(&self) -> bool {
        self.interrupt_disables.fetch_add(1, Ordering::SeqCst);
        self.interrupts_enabled.swap(false, Ordering::SeqCst)
    }

    fn restore(&self, were_enabled: bool) {
        if were_enabled {
            self.interrupts_enabled.store(true, Ordering::SeqCst);
        }
    }
}
