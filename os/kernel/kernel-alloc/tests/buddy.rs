use kernel_alloc::{FrameAllocator, FramePool, MemoryError, PanicHalt, block_frames};
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::FrameNumber;
use kernel_sync::NoInterrupts;
use std::sync::Barrier;
use std::thread;

fn f(n: u64) -> FrameNumber {
    FrameNumber::new(n)
}

fn allocator(base: u64, count: u64) -> FrameAllocator<'static> {
    FrameAllocator::new(f(base), count, &NoInterrupts, &PanicHalt).unwrap()
}

fn snapshot(a: &FrameAllocator<'_>) -> Vec<Vec<FrameNumber>> {
    (0..=MAX_ORDER).map(|k| a.free_list(k)).collect()
}

#[test]
fn one_gigabyte_split_and_reuse() {
    // 2^20 frames, all free: 1024 blocks of the largest order.
    let a = allocator(0, 1 << 20);
    assert_eq!(a.free_blocks(MAX_ORDER), 1024);

    assert_eq!(a.allocate(3), Ok(f(0)));
    assert_eq!(a.allocate(0), Ok(f(8)));
    assert_eq!(a.allocate(0), Ok(f(9)));
    assert_eq!(a.allocate(0), Ok(f(10)));

    // the buddy of 9 is still allocated, so 9 goes back unmerged and first
    a.free(f(9), 0);
    assert_eq!(a.free_list(0)[0], f(9));
    assert_eq!(a.allocate(0), Ok(f(9)));
}

#[test]
fn free_restores_every_list() {
    let a = allocator(0x400, 4096);
    let before = snapshot(&a);

    for order in 0..=MAX_ORDER {
        let frame = a.allocate(order).unwrap();
        assert_eq!(frame.as_u64() % block_frames(order), 0, "order {order} block misaligned");
        a.free(frame, order);
        assert_eq!(snapshot(&a), before, "lists differ after order {order}");
    }
    assert_eq!(a.free_frames(), 4096);
}

#[test]
fn blocks_never_overlap() {
    let a = allocator(0, 512);
    let mut taken: Vec<(u64, u64)> = Vec::new();
    for order in [0, 3, 1, 5, 0, 2, 4, 0, 6, 1] {
        let frame = a.allocate(order).unwrap().as_u64();
        let end = frame + block_frames(order);
        for &(s, e) in &taken {
            assert!(end <= s || frame >= e, "{frame:#x}..{end:#x} overlaps {s:#x}..{e:#x}");
        }
        taken.push((frame, end));
    }
    let used: u64 = taken.iter().map(|(s, e)| e - s).sum();
    assert_eq!(a.free_frames(), 512 - used);
}

#[test]
fn buddies_merge_in_any_free_order() {
    let a = allocator(0, 16);
    let frames: Vec<_> = (0..16).map(|_| a.allocate(0).unwrap()).collect();
    assert_eq!(a.allocate(0), Err(MemoryError::OutOfMemory));

    for i in [5, 14, 0, 9, 3, 12, 7, 1, 15, 10, 2, 6, 13, 8, 4, 11] {
        a.free(frames[i], 0);
    }
    assert_eq!(a.free_list(4), vec![f(0)]);
    for order in 0..4 {
        assert_eq!(a.free_blocks(order), 0, "leftover blocks at order {order}");
    }
}

#[test]
fn unaligned_base_is_carved_into_aligned_blocks() {
    let a = allocator(5, 27);
    for order in 0..=MAX_ORDER {
        for frame in a.free_list(order) {
            assert_eq!(frame.as_u64() % block_frames(order), 0);
        }
    }
    assert_eq!(a.free_frames(), 27);
    assert_eq!(a.allocate(5), Err(MemoryError::OutOfMemory));
    assert_eq!(a.allocate(4), Ok(f(16)));
}

#[test]
fn concurrent_allocate_and_free() {
    const THREADS: usize = 4;
    let pool = FramePool::new(f(0x1000), 2048, &NoInterrupts, &PanicHalt).unwrap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let mut held = Vec::new();
                for round in 0..500 {
                    let order = (t + round) % 4;
                    if let Ok(frame) = pool.alloc_pages(order) {
                        assert_eq!(pool.registry().refcount(frame), 1);
                        held.push((frame, order));
                    }
                    if round % 3 == 0
                        && let Some((frame, order)) = held.pop()
                    {
                        assert!(pool.put_pages(frame, order));
                    }
                }
                for (frame, order) in held {
                    assert!(pool.put_pages(frame, order));
                }
            });
        }
    });

    assert_eq!(pool.frames().free_frames(), 2048);
    assert_eq!(pool.frames().free_blocks(MAX_ORDER), 2);
}
