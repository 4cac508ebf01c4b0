#![no_std]
#![no_main]

extern crate alloc;

use osprey_kernel::memory::vmem::VMem;

osprey_kernel::test_harness!(
    xalloc_respects_bounds_and_alignment,
    xalloc_returns_disjoint_segments,
    xfree_merges_neighbors,
    min_max_constraints_are_honored,
    destroy_asserts_empty,
);

const BASE: usize = 0x1000_0000;
const SIZE: usize = 0x100_0000;
const QUANTUM: usize = 4096;

fn xalloc_respects_bounds_and_alignment() {
    let arena = VMem::new();
    arena.init(BASE, SIZE, QUANTUM);

    let a = arena.xalloc(QUANTUM, 0, 0);
    assert!(a >= BASE && a + QUANTUM <= BASE + SIZE);
    assert_eq!(a % QUANTUM, 0);

    // Sub-quantum requests round up.
    let b = arena.xalloc(100, 0, 0);
    assert_eq!(b % QUANTUM, 0);

    arena.xfree(a, QUANTUM);
    arena.xfree(b, 100);
    arena.destroy(true);
}

fn xalloc_returns_disjoint_segments() {
    let arena = VMem::new();
    arena.init(BASE, SIZE, QUANTUM);

    let mut segments = [0usize; 16];
    for (i, slot) in segments.iter_mut().enumerate() {
        let size = QUANTUM * (i % 3 + 1);
        *slot = arena.xalloc(size, 0, 0);
        assert!(*slot != 0);
    }
    for i in 0..segments.len() {
        for j in 0..segments.len() {
            if i == j {
                continue;
            }
            let size_i = QUANTUM * (i % 3 + 1);
            let disjoint =
                segments[j] >= segments[i] + size_i || segments[j] + QUANTUM <= segments[i];
            assert!(disjoint, "segments {i} and {j} overlap");
        }
    }
    for (i, slot) in segments.iter().enumerate() {
        arena.xfree(*slot, QUANTUM * (i % 3 + 1));
    }
    arena.destroy(true);
}

fn xfree_merges_neighbors() {
    let arena = VMem::new();
    arena.init(BASE, SIZE, QUANTUM);

    // Fragment the whole arena, free everything, then the full span
    // must be allocatable again in one piece.
    let count = SIZE / QUANTUM / 4;
    let mut allocations = alloc::vec![0usize; count];
    for slot in allocations.iter_mut() {
        *slot = arena.xalloc(QUANTUM * 4, 0, 0);
        assert!(*slot != 0);
    }
    assert_eq!(arena.xalloc(QUANTUM, 0, 0), 0, "arena is exhausted");

    for slot in &allocations {
        arena.xfree(*slot, QUANTUM * 4);
    }

    let whole = arena.xalloc(SIZE, 0, 0);
    assert_eq!(whole, BASE, "merge rebuilt the full span");
    arena.xfree(whole, SIZE);
    arena.destroy(true);
}

fn min_max_constraints_are_honored() {
    let arena = VMem::new();
    arena.init(BASE, SIZE, QUANTUM);

    let min = BASE + SIZE / 2;
    let a = arena.xalloc(QUANTUM * 2, min, 0);
    assert!(a >= min);

    let max = BASE + QUANTUM * 8;
    let b = arena.xalloc(QUANTUM, 0, max);
    assert!(b + QUANTUM <= max);

    // Impossible window.
    let c = arena.xalloc(QUANTUM * 4, BASE + SIZE - QUANTUM, BASE + SIZE);
    assert_eq!(c, 0);

    arena.xfree(a, QUANTUM * 2);
    arena.xfree(b, QUANTUM);
    arena.destroy(true);
}

fn destroy_asserts_empty() {
    let arena = VMem::new();
    arena.init(BASE, SIZE, QUANTUM);
    let a = arena.xalloc(QUANTUM, 0, 0);
    arena.xfree(a, QUANTUM);
    // No live allocations: the assert variant must pass.
    arena.destroy(true);
}
