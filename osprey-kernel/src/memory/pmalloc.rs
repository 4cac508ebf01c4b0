//! Physical frame allocator.
//!
//! Every usable RAM region registered at boot becomes a `PRegion`: the
//! region's first pages are reserved to hold the region header and one
//! `Page` descriptor per frame, and the remaining frames go on a global
//! free list threaded through the descriptors themselves. `Page::from_phys`
//! walks the (address-sorted, boot-time-small) region list.

use core::ptr::NonNull;

use spinning_top::Spinlock;

use super::phys_window::to_virt_mut;
use super::{PAGE_SIZE, align_up};

/// Fill pattern written over a frame when it is handed out.
const ALLOC_POISON: u8 = 0xCB;
/// Fill pattern written over a frame when it is returned.
const FREE_POISON: u8 = 0xFD;

/// Descriptor for one physical frame.
pub struct Page {
    /// Physical address of the frame this descriptor covers.
    pub phys: usize,
    /// Free-list link, `None` while the page is allocated.
    next: Option<NonNull<Page>>,
}

// Safety: Page descriptors are only reached through the region/freelist
// locks below.
unsafe impl Send for Page {}

/// Header of a registered physical region. Lives in the first frames of
/// the region it describes, followed by `page_count` `Page` descriptors.
struct PRegion {
    base: usize,
    page_count: usize,
    /// Frames reserved for this header and the descriptor array.
    res_count: usize,
    next: Option<NonNull<PRegion>>,
}

impl PRegion {
    /// The descriptor array that follows the header in memory.
    fn pages(&self) -> *mut Page {
        let after_header = (self as *const PRegion).addr() + size_of::<PRegion>();
        let aligned = align_up(after_header, align_of::<Page>());
        aligned as *mut Page
    }
}

struct RegionList {
    head: Option<NonNull<PRegion>>,
}

// Safety: region headers are only mutated under the REGIONS lock.
unsafe impl Send for RegionList {}

struct FreeList {
    head: Option<NonNull<Page>>,
    /// Number of frames currently free.
    count: usize,
}

unsafe impl Send for FreeList {}

static REGIONS: Spinlock<RegionList> = Spinlock::new(RegionList { head: None });
static FREELIST: Spinlock<FreeList> = Spinlock::new(FreeList {
    head: None,
    count: 0,
});
static TOTAL_MEMORY: Spinlock<usize> = Spinlock::new(0);

/// Register a physical region with the allocator.
///
/// `phys` and `size` must be page-aligned. Regions too small to hold
/// their own descriptors are ignored.
pub fn add_region(phys: usize, size: usize) {
    let pages = size / PAGE_SIZE;
    if pages == 0 {
        return;
    }

    let needed = size_of::<PRegion>() + align_of::<Page>() + pages * size_of::<Page>();
    if needed >= size {
        return;
    }
    let res_pages = align_up(needed, PAGE_SIZE) / PAGE_SIZE;

    *TOTAL_MEMORY.lock() += size;

    // The header and descriptor array live at the start of the region.
    let region = to_virt_mut::<PRegion>(phys);
    unsafe {
        region.write(PRegion {
            base: phys,
            page_count: pages,
            res_count: res_pages,
            next: None,
        });

        let descriptors = (*region).pages();
        for i in 0..pages {
            descriptors.add(i).write(Page {
                phys: phys + i * PAGE_SIZE,
                next: None,
            });
        }

        {
            let mut freelist = FREELIST.lock();
            for i in res_pages..pages {
                let page = &mut *descriptors.add(i);
                page.next = freelist.head;
                freelist.head = Some(NonNull::from(page));
                freelist.count += 1;
            }
        }
    }

    // Insert sorted by base so from_phys can stop early.
    let mut regions = REGIONS.lock();
    let mut cursor = &mut regions.head;
    unsafe {
        while let Some(existing) = *cursor {
            if existing.as_ref().base > phys {
                break;
            }
            cursor = &mut (*existing.as_ptr()).next;
        }
        (*region).next = *cursor;
        *cursor = Some(NonNull::new_unchecked(region));
    }
}

/// Allocate one physical frame, poisoning its contents. Returns the
/// frame's physical address, or 0 when memory is exhausted.
///
/// Only single-frame allocation is supported; contiguous multi-frame
/// requests go through `vmem` plus per-page mapping instead.
pub fn pmalloc(count: usize) -> usize {
    debug_assert_eq!(count, 1, "pmalloc only supports single frames");

    let page = {
        let mut freelist = FREELIST.lock();
        let Some(mut head) = freelist.head else {
            return 0;
        };
        let page = unsafe { head.as_mut() };
        freelist.head = page.next.take();
        freelist.count -= 1;
        page.phys
    };

    unsafe {
        core::ptr::write_bytes(to_virt_mut::<u8>(page), ALLOC_POISON, PAGE_SIZE);
    }
    page
}

/// Return a frame to the allocator.
///
/// # Panics
///
/// Panics if `addr` was not produced by [`pmalloc`]; a stray free here
/// implies corruption.
pub fn pfree(addr: usize, count: usize) {
    debug_assert_eq!(count, 1, "pfree only supports single frames");

    let page = Page::from_phys(addr).expect("pfree of address outside any region");
    assert_eq!(page.phys, addr, "pfree of unaligned address");

    unsafe {
        core::ptr::write_bytes(to_virt_mut::<u8>(addr), FREE_POISON, PAGE_SIZE);
    }

    let mut freelist = FREELIST.lock();
    page.next = freelist.head;
    freelist.head = Some(NonNull::from(page));
    freelist.count += 1;
}

impl Page {
    /// Look up the descriptor for a physical address.
    pub fn from_phys(phys: usize) -> Option<&'static mut Page> {
        let regions = REGIONS.lock();
        let mut cursor = regions.head;
        while let Some(region) = cursor {
            let region = unsafe { region.as_ref() };
            if phys >= region.base && phys < region.base + region.page_count * PAGE_SIZE {
                let index = (phys - region.base) / PAGE_SIZE;
                return Some(unsafe { &mut *region.pages().add(index) });
            }
            if region.base > phys {
                break;
            }
            cursor = region.next;
        }
        None
    }
}

/// Total bytes of RAM registered with the allocator.
pub fn total_memory() -> usize {
    *TOTAL_MEMORY.lock()
}

/// Number of frames currently on the free list.
pub fn free_pages() -> usize {
    FREELIST.lock().count
}
