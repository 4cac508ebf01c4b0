//! Fixed-size-bucket kernel heap.
//!
//! Buckets of 16..=2048 bytes; each bucket hands out slots from
//! one-page arenas holding a header plus an intrusive free list.
//! Requests of exactly one page go straight to the frame allocator, and
//! anything larger than the biggest bucket is backed by a vmem range
//! with freshly mapped frames. An arena is returned to the frame
//! allocator when its last slot is freed.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spinning_top::Spinlock;
use x86_64::{PhysAddr, VirtAddr};

use super::page_map::MapFlags;
use super::phys_window::{phys_to_virt, window_to_phys};
use super::{PAGE_SIZE, align_up, kernel_map, kernel_vmem, pmalloc};

const BUCKET_COUNT: usize = 8;
const MIN_BUCKET: usize = 16;
const MAX_BUCKET: usize = 2048;

struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Lives at the start of every bucket arena page.
struct ArenaHeader {
    size_class: usize,
    used: usize,
    free: Option<NonNull<FreeSlot>>,
    prev: Option<NonNull<ArenaHeader>>,
    next: Option<NonNull<ArenaHeader>>,
}

struct Bucket {
    /// Arenas with at least one free slot.
    partial: Option<NonNull<ArenaHeader>>,
}

// Safety: arena pointers are only touched under the bucket lock.
unsafe impl Send for Bucket {}

static BUCKETS: [Spinlock<Bucket>; BUCKET_COUNT] =
    [const { Spinlock::new(Bucket { partial: None }) }; BUCKET_COUNT];

fn bucket_index(size: usize) -> usize {
    let class = size.max(MIN_BUCKET).next_power_of_two();
    class.trailing_zeros() as usize - MIN_BUCKET.trailing_zeros() as usize
}

fn first_slot_offset(class: usize) -> usize {
    align_up(size_of::<ArenaHeader>(), class)
}

impl Bucket {
    unsafe fn list_remove(&mut self, mut arena: NonNull<ArenaHeader>) {
        unsafe {
            let prev = arena.as_ref().prev;
            let next = arena.as_ref().next;
            match prev {
                Some(mut p) => p.as_mut().next = next,
                None => self.partial = next,
            }
            if let Some(mut n) = next {
                n.as_mut().prev = prev;
            }
            arena.as_mut().prev = None;
            arena.as_mut().next = None;
        }
    }

    unsafe fn list_push(&mut self, mut arena: NonNull<ArenaHeader>) {
        unsafe {
            arena.as_mut().prev = None;
            arena.as_mut().next = self.partial;
            if let Some(mut head) = self.partial {
                head.as_mut().prev = Some(arena);
            }
            self.partial = Some(arena);
        }
    }
}

fn bucket_alloc(class: usize) -> *mut u8 {
    let index = bucket_index(class);
    let mut bucket = BUCKETS[index].lock();

    if bucket.partial.is_none() {
        let phys = pmalloc::pmalloc(1);
        if phys == 0 {
            return core::ptr::null_mut();
        }
        let header = phys_to_virt(PhysAddr::new(phys as u64)).as_mut_ptr::<ArenaHeader>();
        unsafe {
            header.write(ArenaHeader {
                size_class: class,
                used: 0,
                free: None,
                prev: None,
                next: None,
            });
            let base = header as usize + first_slot_offset(class);
            let slots = (PAGE_SIZE - first_slot_offset(class)) / class;
            for i in (0..slots).rev() {
                let slot = (base + i * class) as *mut FreeSlot;
                slot.write(FreeSlot {
                    next: (*header).free,
                });
                (*header).free = Some(NonNull::new_unchecked(slot));
            }
            bucket.list_push(NonNull::new_unchecked(header));
        }
    }

    let mut arena = bucket.partial.expect("bucket has a partial arena");
    unsafe {
        let slot = arena
            .as_mut()
            .free
            .take()
            .expect("partial arena has a free slot");
        arena.as_mut().free = slot.as_ref().next;
        arena.as_mut().used += 1;
        if arena.as_ref().free.is_none() {
            bucket.list_remove(arena);
        }
        slot.as_ptr() as *mut u8
    }
}

fn bucket_free(ptr: *mut u8, class: usize) {
    let index = bucket_index(class);
    let mut bucket = BUCKETS[index].lock();

    let header = ((ptr as usize) & !(PAGE_SIZE - 1)) as *mut ArenaHeader;
    unsafe {
        let mut arena = NonNull::new_unchecked(header);
        assert_eq!(
            arena.as_ref().size_class,
            class,
            "heap free with wrong size class"
        );

        let was_full = arena.as_ref().free.is_none();
        let slot = ptr as *mut FreeSlot;
        slot.write(FreeSlot {
            next: arena.as_ref().free,
        });
        arena.as_mut().free = Some(NonNull::new_unchecked(slot));
        arena.as_mut().used -= 1;

        if arena.as_ref().used == 0 {
            if !was_full {
                bucket.list_remove(arena);
            }
            pmalloc::pfree(window_to_phys(header as usize), 1);
        } else if was_full {
            bucket.list_push(arena);
        }
    }
}

fn large_alloc(size: usize) -> *mut u8 {
    let bytes = align_up(size, PAGE_SIZE);
    let base = kernel_vmem().xalloc(bytes, 0, 0);
    if base == 0 {
        return core::ptr::null_mut();
    }

    let map = kernel_map();
    for offset in (0..bytes).step_by(PAGE_SIZE) {
        let phys = pmalloc::pmalloc(1);
        if phys == 0 {
            // Roll back the partial mapping.
            for undo in (0..offset).step_by(PAGE_SIZE) {
                if let Some(frame) = map.unmap(VirtAddr::new((base + undo) as u64)) {
                    pmalloc::pfree(frame.as_u64() as usize, 1);
                }
            }
            kernel_vmem().xfree(base, bytes);
            return core::ptr::null_mut();
        }
        map.map(
            VirtAddr::new((base + offset) as u64),
            PhysAddr::new(phys as u64),
            MapFlags::kernel_rw(),
        );
    }
    base as *mut u8
}

fn large_free(ptr: *mut u8, size: usize) {
    let bytes = align_up(size, PAGE_SIZE);
    let base = ptr as usize;
    let map = kernel_map();
    for offset in (0..bytes).step_by(PAGE_SIZE) {
        let frame = map
            .unmap(VirtAddr::new((base + offset) as u64))
            .expect("large heap allocation was mapped");
        pmalloc::pfree(frame.as_u64() as usize, 1);
    }
    kernel_vmem().xfree(base, bytes);
}

/// The kernel heap. Installed as the global allocator in `lib.rs`.
pub struct Allocator;

/// Effective size of a request: alignment above the natural slot
/// alignment is handled by promoting the size class.
fn effective_size(layout: Layout) -> usize {
    layout.size().max(layout.align())
}

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = effective_size(layout);
        if size == PAGE_SIZE {
            let phys = pmalloc::pmalloc(1);
            if phys == 0 {
                return core::ptr::null_mut();
            }
            return phys_to_virt(PhysAddr::new(phys as u64)).as_mut_ptr();
        }
        if size <= MAX_BUCKET {
            return bucket_alloc(size.max(MIN_BUCKET).next_power_of_two());
        }
        large_alloc(size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = effective_size(layout);
        if size == PAGE_SIZE {
            pmalloc::pfree(window_to_phys(ptr as usize), 1);
            return;
        }
        if size <= MAX_BUCKET {
            bucket_free(ptr, size.max(MIN_BUCKET).next_power_of_two());
            return;
        }
        large_free(ptr, size);
    }
}
