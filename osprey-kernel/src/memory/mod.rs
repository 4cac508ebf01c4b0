//! Memory management.
//!
//! Three allocators layered per the kernel's design:
//! - `pmalloc`: physical frames with `Page`/`PRegion` descriptors
//! - `vmem`: boundary-tag arena over kernel virtual space
//! - `heap`: fixed-size buckets installed as the global allocator
//!
//! plus `PageMap`, the per-process four-level page table.

pub mod heap;
pub mod page_map;
pub mod phys_window;
pub mod pmalloc;
pub mod shared;
pub mod vmem;

use alloc::vec::Vec;

use log::{debug, info};
use spinning_top::{MappedSpinlockGuard, Spinlock, SpinlockGuard};
use uefi::boot::MemoryType;
use uefi::mem::memory_map::{MemoryMap, MemoryMapOwned};
use x86_64::{PhysAddr, VirtAddr};

pub use page_map::{MapFlags, PageMap, USER_BASE, USER_TOP};
pub use phys_window::{phys_to_virt, virt_to_phys};

pub const PAGE_SIZE: usize = 4096;

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

static KERNEL_MAP: Spinlock<Option<PageMap>> = Spinlock::new(None);
static KERNEL_VMEM: vmem::VMem = vmem::VMem::new();

/// The kernel page map, locked for mutation.
pub fn kernel_map() -> MappedSpinlockGuard<'static, PageMap> {
    SpinlockGuard::map(KERNEL_MAP.lock(), |map| {
        map.as_mut().expect("memory::init has run")
    })
}

/// The kernel virtual-address arena.
pub fn kernel_vmem() -> &'static vmem::VMem {
    &KERNEL_VMEM
}

/// Whether a UEFI region is RAM that must appear in the identity map
/// and the physical window.
fn is_ram(ty: MemoryType) -> bool {
    matches!(
        ty,
        MemoryType::CONVENTIONAL
            | MemoryType::LOADER_CODE
            | MemoryType::LOADER_DATA
            | MemoryType::BOOT_SERVICES_CODE
            | MemoryType::BOOT_SERVICES_DATA
            | MemoryType::RUNTIME_SERVICES_CODE
            | MemoryType::RUNTIME_SERVICES_DATA
            | MemoryType::ACPI_RECLAIM
    )
}

/// Initialize all of memory management from the UEFI memory map.
///
/// # Safety
/// Must be called exactly once, after `exit_boot_services`, while the
/// firmware's identity mapping is still active.
pub unsafe fn init(memory_map: &MemoryMapOwned) {
    // Free conventional memory becomes the frame pool. The descriptor
    // array itself lives in boot-services data, which is not handed out.
    for descriptor in memory_map.entries() {
        if descriptor.ty == MemoryType::CONVENTIONAL {
            pmalloc::add_region(
                descriptor.phys_start as usize,
                descriptor.page_count as usize * PAGE_SIZE,
            );
        }
    }
    info!(
        "pmalloc: {} MiB in {} free frames",
        pmalloc::total_memory() / (1024 * 1024),
        pmalloc::free_pages()
    );

    let mut ram = Vec::new();
    let mut kernel_code = Vec::new();
    for descriptor in memory_map.entries() {
        let base = descriptor.phys_start;
        let size = descriptor.page_count * PAGE_SIZE as u64;
        if is_ram(descriptor.ty) {
            ram.push((base, size));
        }
        if descriptor.ty == MemoryType::LOADER_CODE {
            kernel_code.push((base, size));
        }
    }

    let map = PageMap::new_kernel(&ram, &kernel_code);
    map.activate();
    phys_window::enable_window();
    debug!("kernel page map active, physical window enabled");

    KERNEL_VMEM.init(
        page_map::VMEM_BASE as usize,
        page_map::VMEM_SIZE as usize,
        PAGE_SIZE,
    );

    *KERNEL_MAP.lock() = Some(map);
}

/// Map a physical MMIO range into the kernel window, uncached. Returns
/// the virtual address of `phys`.
pub fn map_mmio(phys: PhysAddr, size: usize) -> VirtAddr {
    let base = align_down(phys.as_u64() as usize, PAGE_SIZE);
    let end = align_up(phys.as_u64() as usize + size, PAGE_SIZE);

    let map = kernel_map();
    for page in (base..end).step_by(PAGE_SIZE) {
        let virt = phys_to_virt(PhysAddr::new(page as u64));
        if map.get_phys(virt).is_none() {
            map.map(virt, PhysAddr::new(page as u64), MapFlags::mmio());
        }
    }
    phys_to_virt(phys)
}

/// A user memory region mapped into one process's page map: either
/// anonymous (owned frames) or a view of a `SharedMemory` object.
pub struct Mapping {
    base: VirtAddr,
    frames: Vec<usize>,
    /// Pages mapped but owned elsewhere (shared memory).
    shared_pages: usize,
    shared: Option<alloc::sync::Arc<shared::SharedMemory>>,
    flags: MapFlags,
}

impl Mapping {
    /// Allocate `size` bytes of zeroed frames and map them at `base`.
    pub fn new_anonymous(
        map: &PageMap,
        base: VirtAddr,
        size: usize,
        flags: MapFlags,
    ) -> Option<Mapping> {
        let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
        let mut frames = Vec::with_capacity(pages);
        for i in 0..pages {
            let phys = pmalloc::pmalloc(1);
            if phys == 0 {
                for frame in frames {
                    pmalloc::pfree(frame, 1);
                }
                return None;
            }
            unsafe {
                core::ptr::write_bytes(phys_window::to_virt_mut::<u8>(phys), 0, PAGE_SIZE);
            }
            map.map(
                base + (i * PAGE_SIZE) as u64,
                PhysAddr::new(phys as u64),
                flags,
            );
            frames.push(phys);
        }
        Some(Mapping {
            base,
            frames,
            shared_pages: 0,
            shared: None,
            flags,
        })
    }

    /// A view of shared memory; the mapping keeps the backing object
    /// alive but does not own the frames.
    pub fn new_shared(
        base: VirtAddr,
        pages: usize,
        shared: alloc::sync::Arc<shared::SharedMemory>,
    ) -> Mapping {
        Mapping {
            base,
            frames: Vec::new(),
            shared_pages: pages,
            shared: Some(shared),
            flags: MapFlags {
                user: true,
                writable: true,
                executable: false,
                uncached: false,
            },
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        (self.frames.len() + self.shared_pages) * PAGE_SIZE
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.base + self.size() as u64
    }

    /// Copy `data` into the mapping's frames at `offset`, through the
    /// physical window. Used by the ELF loader to populate images in a
    /// page map that is not active.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.frames.len() * PAGE_SIZE);
        let mut written = 0;
        while written < data.len() {
            let pos = offset + written;
            let frame = self.frames[pos / PAGE_SIZE];
            let page_off = pos % PAGE_SIZE;
            let n = (PAGE_SIZE - page_off).min(data.len() - written);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr().add(written),
                    phys_window::to_virt_mut::<u8>(frame + page_off),
                    n,
                );
            }
            written += n;
        }
    }

    /// Unmap from `map` and release the owned frames. Shared frames are
    /// released by the backing object when its last holder drops.
    pub fn destroy(self, map: &PageMap) {
        let pages = self.frames.len() + self.shared_pages;
        for i in 0..pages {
            map.unmap(self.base + (i * PAGE_SIZE) as u64);
        }
        for frame in self.frames {
            pmalloc::pfree(frame, 1);
        }
    }
}
