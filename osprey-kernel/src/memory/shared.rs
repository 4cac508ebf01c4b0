//! Shared memory objects.
//!
//! A `SharedMemory` owns a list of physical pages; the `Arc` strong
//! count is the usage counter, so the pages outlive their creator for
//! as long as any peer still holds a handle or a mapping.

use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::{SysError, SysResult};
use x86_64::{PhysAddr, VirtAddr};

use super::page_map::MapFlags;
use super::{Mapping, PAGE_SIZE, PageMap, align_up, phys_window, pmalloc};

pub struct SharedMemory {
    pages: Vec<usize>,
}

impl SharedMemory {
    /// Allocate `size` bytes of zeroed frames.
    pub fn alloc(size: usize) -> SysResult<Arc<SharedMemory>> {
        let count = align_up(size, PAGE_SIZE) / PAGE_SIZE;
        if count == 0 {
            return Err(SysError::InvalidArgument);
        }
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let phys = pmalloc::pmalloc(1);
            if phys == 0 {
                for page in pages {
                    pmalloc::pfree(page, 1);
                }
                return Err(SysError::NoMem);
            }
            unsafe {
                core::ptr::write_bytes(phys_window::to_virt_mut::<u8>(phys), 0, PAGE_SIZE);
            }
            pages.push(phys);
        }
        Ok(Arc::new(SharedMemory { pages }))
    }

    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Map every page into `map` at `base`, read-write. Returns a
    /// mapping that keeps this object (and so the frames) alive.
    pub fn map_into(self: &Arc<Self>, map: &PageMap, base: VirtAddr) -> Mapping {
        let flags = MapFlags {
            user: true,
            writable: true,
            executable: false,
            uncached: false,
        };
        for (i, &phys) in self.pages.iter().enumerate() {
            map.map(
                base + (i * PAGE_SIZE) as u64,
                PhysAddr::new(phys as u64),
                flags,
            );
        }
        Mapping::new_shared(base, self.pages.len(), self.clone())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        for &page in &self.pages {
            pmalloc::pfree(page, 1);
        }
    }
}
