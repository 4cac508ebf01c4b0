#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use osprey_kernel::memory::pmalloc;

osprey_kernel::test_harness!(
    pmalloc_round_trip_preserves_pool,
    pmalloc_returns_distinct_frames,
    heap_bucket_sizes_round_trip,
    heap_large_allocations_use_the_arena,
    heap_reuses_freed_slots,
);

fn pmalloc_round_trip_preserves_pool() {
    let before = pmalloc::free_pages();
    let page = pmalloc::pmalloc(1);
    assert!(page != 0, "allocator has free frames");
    assert_eq!(pmalloc::free_pages(), before - 1);
    pmalloc::pfree(page, 1);
    assert_eq!(pmalloc::free_pages(), before);
}

fn pmalloc_returns_distinct_frames() {
    let a = pmalloc::pmalloc(1);
    let b = pmalloc::pmalloc(1);
    assert!(a != 0 && b != 0);
    assert_ne!(a, b);
    assert_eq!(a % 4096, 0);
    assert_eq!(b % 4096, 0);
    pmalloc::pfree(a, 1);
    pmalloc::pfree(b, 1);
}

fn heap_bucket_sizes_round_trip() {
    // One allocation per bucket class, all live at once.
    let mut boxes: Vec<Vec<u8>> = Vec::new();
    for size in [16usize, 32, 64, 128, 256, 512, 1024, 2048] {
        let mut buf = alloc::vec![0u8; size - 8];
        buf[0] = size as u8;
        buf[size - 9] = !(size as u8);
        boxes.push(buf);
    }
    for (i, size) in [16usize, 32, 64, 128, 256, 512, 1024, 2048].iter().enumerate() {
        assert_eq!(boxes[i][0], *size as u8);
        assert_eq!(boxes[i][size - 9], !(*size as u8));
    }
}

fn heap_large_allocations_use_the_arena() {
    // Beyond the largest bucket: backed by vmem-mapped pages.
    let mut big = alloc::vec![0xa5u8; 3 * 4096 + 123];
    big[0] = 1;
    *big.last_mut().unwrap() = 2;
    assert_eq!(big[0], 1);
    assert_eq!(*big.last().unwrap(), 2);
    drop(big);

    let exact = alloc::vec![0x5au8; 4096];
    assert!(exact.iter().all(|&b| b == 0x5a));
}

fn heap_reuses_freed_slots() {
    // An odd size class that background threads are unlikely to touch
    // between the free and the re-allocation.
    let first = Box::new([0u8; 1000]);
    let first_addr = first.as_ptr() as usize;
    drop(first);
    let second = Box::new([1u8; 1000]);
    let second_addr = second.as_ptr() as usize;
    // Same bucket, freed slot goes back on the freelist.
    assert_eq!(first_addr, second_addr);
}
