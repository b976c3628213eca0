use kernel_alloc::{FramePool, MemoryError, PanicHalt, RegionWindow, VirtualRegionAllocator};
use kernel_info::memory::VMALLOC_START;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::NoInterrupts;
use kernel_vmem::testing::{MachineEvent, RecordingMachine, TestPhysMemory};
use kernel_vmem::{AddressSpace, AsidAllocator, CoreId, CoreSet, PageProtection, Pcid, TlbCoordinator};

const W: u64 = VMALLOC_START;

fn c(i: usize) -> CoreId {
    CoreId::new(i).unwrap()
}

fn va(offset: u64) -> VirtualAddress {
    VirtualAddress::new(W + offset)
}

fn window(pages: u64) -> RegionWindow {
    RegionWindow::new(va(0), va(pages * PAGE_SIZE)).unwrap()
}

struct Rig {
    phys: TestPhysMemory,
    machine: RecordingMachine,
    pool: FramePool<'static>,
}

impl Rig {
    /// `frames` frames of RAM from 1 MiB.
    fn new(frames: u64) -> Self {
        Self {
            phys: TestPhysMemory::new(),
            machine: RecordingMachine::new(),
            pool: FramePool::new(FrameNumber::new(0x100), frames, &NoInterrupts, &PanicHalt).unwrap(),
        }
    }

    fn free(&self) -> u64 {
        self.pool.frames().free_frames()
    }
}

#[test]
fn reserve_maps_and_release_returns_frames() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(2));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();

    let region = regions.reserve(c(0), 3 * PAGE_SIZE, PageProtection::KERNEL_DATA).unwrap();
    assert_eq!(region.base(), va(0));
    assert_eq!(region.pages(), 3);
    assert_eq!(region.frames().len(), 3);
    for (page, frame) in region.base().pages(3).zip(region.frames()) {
        assert_eq!(kernel.query(page + 0x10), Some(frame.base() + 0x10));
        assert_eq!(rig.pool.registry().refcount(*frame), 1);
        assert!(kernel.entry(page).unwrap().global_translation());
    }
    assert_eq!(regions.region_at(va(2 * PAGE_SIZE + 5)), Some((va(0), 3 * PAGE_SIZE)));
    assert_eq!(regions.region_at(va(3 * PAGE_SIZE)), None);
    assert_eq!(regions.reserved_bytes(), 3 * PAGE_SIZE);
    // the new entries were flushed everywhere
    assert_eq!(rig.machine.shootdowns_to(), vec![c(1)]);

    let free = rig.free();
    rig.machine.clear();
    regions.release(c(0), region).unwrap();

    assert_eq!(kernel.query(va(0)), None);
    assert_eq!(rig.free(), free + 3);
    assert_eq!(regions.regions(), 0);
    assert_eq!(rig.machine.local_page_invalidations(), 3);
    assert_eq!(rig.machine.shootdowns_to(), vec![c(1)]);

    // the interval is handed out again
    let again = regions.reserve(c(0), PAGE_SIZE, PageProtection::KERNEL_DATA).unwrap();
    assert_eq!(again.base(), va(0));
}

#[test]
fn fixed_reservations_never_overlap() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();
    let prot = PageProtection::KERNEL_DATA;

    let fixed = regions.reserve_fixed(c(0), va(4 * PAGE_SIZE), 2 * PAGE_SIZE, prot).unwrap();
    assert_eq!(fixed.base(), va(4 * PAGE_SIZE));

    let free = rig.free();
    assert_eq!(
        regions.reserve_fixed(c(0), va(5 * PAGE_SIZE), PAGE_SIZE, prot).unwrap_err(),
        MemoryError::Overlap {
            base: W + 5 * PAGE_SIZE,
            size: PAGE_SIZE
        }
    );
    assert!(matches!(
        regions.reserve_fixed(c(0), va(3 * PAGE_SIZE), 2 * PAGE_SIZE, prot),
        Err(MemoryError::Overlap { .. })
    ));
    assert_eq!(rig.free(), free);

    // touching, not overlapping
    regions.reserve_fixed(c(0), va(3 * PAGE_SIZE), PAGE_SIZE, prot).unwrap();
    regions.reserve_fixed(c(0), va(6 * PAGE_SIZE), PAGE_SIZE, prot).unwrap();

    // first fit skips the three-page hole below the fixed regions
    let any = regions.reserve(c(0), 4 * PAGE_SIZE, prot).unwrap();
    assert_eq!(any.base(), va(7 * PAGE_SIZE));

    assert!(matches!(
        regions.reserve_fixed(c(0), va(63 * PAGE_SIZE), 2 * PAGE_SIZE, prot),
        Err(MemoryError::AddressOverflow { .. })
    ));
    assert_eq!(regions.regions(), 4);
}

#[test]
fn device_mapping_translates_every_offset() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(1024), &rig.machine).unwrap();

    // push the next page-aligned gap off the device alignment
    regions.reserve(c(0), PAGE_SIZE, PageProtection::KERNEL_DATA).unwrap();
    let free = rig.free();

    let phys = PhysicalAddress::new(0xFEE0_0000);
    let size = 0x3000;
    let dev = regions.map_device(c(0), phys, size, PageProtection::WRITE).unwrap();
    assert_eq!(dev.base(), va(0x4000));
    assert_eq!(dev.device_base(), Some(phys));
    assert!(dev.frames().is_empty());

    for offset in (0..size).step_by(0x800) {
        assert_eq!(kernel.query(dev.base() + offset), Some(phys + offset));
    }
    let entry = kernel.entry(dev.base()).unwrap();
    assert!(entry.cache_disabled());
    assert!(entry.writable());
    assert_eq!(rig.free(), free);

    // 1 MiB clamps to the largest device alignment
    let big = regions
        .map_device(c(0), PhysicalAddress::new(0xC000_0000), 0x10_0000, PageProtection::DEVICE)
        .unwrap();
    assert_eq!(big.base(), va(0x8_0000));
    assert_eq!(kernel.query(big.base() + 0xF_F123), Some(PhysicalAddress::new(0xC00F_F123)));

    // device frames are not pool frames; release must not put them
    regions.release(c(0), dev).unwrap();
    assert_eq!(kernel.query(va(0x4000)), None);
    assert_eq!(rig.free(), free);
}

#[test]
fn fixed_device_mapping() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();

    let phys = PhysicalAddress::new(0xFEB0_0000);
    let dev = regions
        .map_device_fixed(c(0), va(0x1_0000), phys, 2 * PAGE_SIZE, PageProtection::DEVICE)
        .unwrap();
    for p in [phys, phys + 0x8, phys + 0x1FF8] {
        assert_eq!(kernel.query(dev.base() + (p.as_u64() - phys.as_u64())), Some(p));
    }
    assert!(matches!(
        regions.map_device_fixed(c(0), va(0x1_1000), phys, PAGE_SIZE, PageProtection::DEVICE),
        Err(MemoryError::Overlap { .. })
    ));
}

#[test]
fn plain_kernel_regions_are_global() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(2));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();

    let region = regions.reserve(c(0), PAGE_SIZE, PageProtection::WRITE).unwrap();
    let dev = regions
        .map_device(c(0), PhysicalAddress::new(0xFEE0_0000), PAGE_SIZE, PageProtection::WRITE)
        .unwrap();
    assert!(kernel.entry(region.base()).unwrap().global_translation());
    assert!(kernel.entry(dev.base()).unwrap().global_translation());

    rig.machine.clear();
    let base = region.base();
    regions.release(c(0), region).unwrap();
    assert!(rig.machine.events().iter().all(|e| match e {
        MachineEvent::InvalidatePage { pcid, va, .. } => *pcid == Pcid::KERNEL && *va == base,
        MachineEvent::Shootdown { to, .. } => *to == c(1),
        _ => false,
    }));
    assert_eq!(rig.machine.shootdowns_to(), vec![c(1)]);
}

#[test]
fn bad_input_is_rejected() {
    let rig = Rig::new(64);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();
    let prot = PageProtection::KERNEL_DATA;

    assert_eq!(regions.reserve(c(0), 0, prot).unwrap_err(), MemoryError::EmptyRegion);
    assert!(matches!(
        regions.reserve(c(0), 0x1800, prot),
        Err(MemoryError::UnalignedRegion { .. })
    ));
    assert!(matches!(
        regions.reserve_fixed(c(0), va(0x800), PAGE_SIZE, prot),
        Err(MemoryError::UnalignedRegion { .. })
    ));
    assert!(matches!(
        regions.map_device(c(0), PhysicalAddress::new(0xFEE0_0010), PAGE_SIZE, prot),
        Err(MemoryError::UnalignedRegion { .. })
    ));
    assert_eq!(
        regions.map_device(c(0), PhysicalAddress::new(0xFEE0_0000), 0, prot).unwrap_err(),
        MemoryError::EmptyRegion
    );
    assert!(matches!(
        regions.map_device(c(0), PhysicalAddress::new(u64::MAX - 0xFFF), 2 * PAGE_SIZE, prot),
        Err(MemoryError::AddressOverflow { .. })
    ));
    assert!(matches!(
        RegionWindow::new(VirtualAddress::new(0x1000), VirtualAddress::new(0x9000)),
        Err(MemoryError::AddressOverflow { .. })
    ));
    assert_eq!(regions.regions(), 0);
}

#[test]
fn exhaustion_rolls_back_partial_regions() {
    // root + window PDPT leave 6 frames
    let rig = Rig::new(8);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();
    let prot = PageProtection::KERNEL_DATA;
    assert_eq!(rig.free(), 6);

    // PD + PT + one data frame
    regions.reserve(c(0), PAGE_SIZE, prot).unwrap();
    assert_eq!(rig.free(), 3);

    assert_eq!(
        regions.reserve(c(0), 5 * PAGE_SIZE, prot).unwrap_err(),
        MemoryError::OutOfMemory
    );
    assert_eq!(rig.free(), 3);
    assert_eq!(regions.regions(), 1);
    assert_eq!(kernel.query(va(PAGE_SIZE)), None);

    // no gap at all: nothing is touched
    assert_eq!(
        regions.reserve(c(0), 64 * PAGE_SIZE, prot).unwrap_err(),
        MemoryError::OutOfMemory
    );

    let rest = regions.reserve(c(0), 3 * PAGE_SIZE, prot).unwrap();
    assert_eq!(rest.base(), va(PAGE_SIZE));
    assert_eq!(rig.free(), 0);
}

#[test]
fn user_spaces_see_kernel_regions() {
    let rig = Rig::new(256);
    let asids = AsidAllocator::new();
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(2));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();

    // created before the region exists
    let user = AddressSpace::new_user(&kernel, &asids, &rig.pool).unwrap();
    let region = regions.reserve(c(0), 2 * PAGE_SIZE, PageProtection::KERNEL_DATA).unwrap();

    for page in region.base().pages(2) {
        assert!(user.query(page).is_some());
        assert_eq!(user.query(page), kernel.query(page));
    }
    regions.release(c(1), region).unwrap();
    assert_eq!(user.query(va(0)), None);
}

#[test]
fn hardware_bits_reach_the_registry() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let regions = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();
    let registry = rig.pool.registry();

    let region = regions.reserve(c(0), 2 * PAGE_SIZE, PageProtection::KERNEL_DATA).unwrap();
    let frames = region.frames().to_vec();
    assert!(rig.phys.touch(kernel.root(), region.base(), false));
    assert!(rig.phys.touch(kernel.root(), region.base() + PAGE_SIZE, true));

    regions.sync_page_flags(c(0), &region).unwrap();
    assert!(registry.is_accessed(frames[0]));
    assert!(!registry.is_dirty(frames[0]));
    assert!(registry.is_accessed(frames[1]));
    assert!(registry.is_dirty(frames[1]));
    let entry = kernel.entry(region.base() + PAGE_SIZE).unwrap();
    assert!(!entry.accessed());
    assert!(!entry.dirty());

    // a write after the harvest is still recorded on release
    registry.clear_dirty(frames[1]);
    assert!(rig.phys.touch(kernel.root(), region.base(), true));
    regions.release(c(0), region).unwrap();
    assert!(registry.is_dirty(frames[0]));
    assert!(!registry.is_dirty(frames[1]));
    assert_eq!(registry.refcount(frames[0]), 0);
}

#[test]
fn foreign_regions_are_refused() {
    let rig = Rig::new(256);
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let low = VirtualRegionAllocator::new(&kernel, &rig.pool, window(64), &rig.machine).unwrap();
    let high_window = RegionWindow::new(va(64 * PAGE_SIZE), va(128 * PAGE_SIZE)).unwrap();
    let high = VirtualRegionAllocator::new(&kernel, &rig.pool, high_window, &rig.machine).unwrap();

    let region = high.reserve(c(0), PAGE_SIZE, PageProtection::KERNEL_DATA).unwrap();
    let base = region.base();
    assert_eq!(low.release(c(0), region).unwrap_err(), MemoryError::UnknownRegion(base));
    assert!(kernel.query(base).is_some());
    assert_eq!(high.regions(), 1);
}

#[test]
fn regions_need_the_kernel_space() {
    let rig = Rig::new(64);
    let asids = AsidAllocator::new();
    let tlb = TlbCoordinator::new(&rig.machine, CoreSet::first(1));
    let kernel = AddressSpace::new_kernel(&rig.phys, &tlb, &rig.machine, &rig.pool).unwrap();
    let user = AddressSpace::new_user(&kernel, &asids, &rig.pool).unwrap();
    assert!(matches!(
        VirtualRegionAllocator::new(&user, &rig.pool, window(64), &rig.machine),
        Err(MemoryError::Mapping(_))
    ));
}
