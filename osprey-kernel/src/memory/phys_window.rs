//! The kernel's view of physical memory.
//!
//! During early boot the UEFI identity mapping is still live, so
//! physical addresses are usable directly (offset 0). Once the kernel
//! page map is built, all of RAM is mirrored at `PHYS_WINDOW_BASE` and
//! the offset switches over; both mappings stay valid on the kernel
//! map, so pointers created before the switch keep working.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

/// Base of the all-of-RAM mirror in the higher half (PML4 entry 256).
pub const PHYS_WINDOW_BASE: u64 = 0xffff_8000_0000_0000;

static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Switch address translation over to the higher-half window.
///
/// Called once after the kernel page map (with the window mapped) is
/// installed.
pub fn enable_window() {
    PHYS_OFFSET.store(PHYS_WINDOW_BASE, Ordering::SeqCst);
}

/// Translate a physical address into the kernel's window.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + PHYS_OFFSET.load(Ordering::Relaxed))
}

/// Translate a window virtual address back to physical.
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64() - PHYS_OFFSET.load(Ordering::Relaxed))
}

/// Translate a raw virtual address (window or early identity) back to
/// physical. Valid for both translation regimes, so callers holding
/// pointers created before the window switch can still use it.
pub fn window_to_phys(virt: usize) -> usize {
    if virt as u64 >= PHYS_WINDOW_BASE {
        virt - PHYS_WINDOW_BASE as usize
    } else {
        virt
    }
}

/// Typed pointer into the window for a physical address.
pub fn to_virt<T>(phys: usize) -> *const T {
    phys_to_virt(PhysAddr::new(phys as u64)).as_ptr()
}

/// Mutable typed pointer into the window for a physical address.
pub fn to_virt_mut<T>(phys: usize) -> *mut T {
    phys_to_virt(PhysAddr::new(phys as u64)).as_mut_ptr()
}
