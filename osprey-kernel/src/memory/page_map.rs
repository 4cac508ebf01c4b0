//! Per-process four-level page tables.
//!
//! Every `PageMap` shares the kernel's higher-half entries (the
//! physical-memory window, the vmem arena) plus the low-half entries
//! covering the identity-mapped kernel image, so kernel code keeps
//! running no matter which map is active. User mappings are confined to
//! `USER_BASE..USER_TOP`, which by construction never overlaps a kernel
//! entry.
//!
//! Intermediate tables come straight from `pmalloc` and are reached
//! through the physical window; there is no recursive mapping.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::phys_window::{PHYS_WINDOW_BASE, phys_to_virt};
use super::{PAGE_SIZE, pmalloc};

/// Lowest user-mappable address (PML4 entry 192).
pub const USER_BASE: u64 = 0x6000_0000_0000;
/// One past the highest user-mappable address.
pub const USER_TOP: u64 = 0x7fff_ffff_f000;

/// Base of the kernel vmem arena (PML4 entry 320 in the higher half).
pub const VMEM_BASE: u64 = 0xffff_a000_0000_0000;
/// Size of the kernel vmem arena.
pub const VMEM_SIZE: u64 = 64 * 1024 * 1024 * 1024;

const HIGHER_HALF_START: usize = 256;

/// Bitmap of low-half PML4 entries owned by the kernel (identity map of
/// RAM and MMIO); recorded when the kernel map is built so user map
/// construction can mirror them and destruction can skip them.
static KERNEL_LOW_ENTRIES: [AtomicU64; 4] = [const { AtomicU64::new(0) }; 4];

fn mark_kernel_low_entry(index: usize) {
    KERNEL_LOW_ENTRIES[index / 64].fetch_or(1 << (index % 64), Ordering::Relaxed);
}

fn is_kernel_low_entry(index: usize) -> bool {
    KERNEL_LOW_ENTRIES[index / 64].load(Ordering::Relaxed) & (1 << (index % 64)) != 0
}

/// Access permissions for one mapping.
#[derive(Clone, Copy, Debug)]
pub struct MapFlags {
    pub user: bool,
    pub writable: bool,
    pub executable: bool,
    /// Disable caching (MMIO).
    pub uncached: bool,
}

impl MapFlags {
    pub const fn kernel_rw() -> Self {
        Self {
            user: false,
            writable: true,
            executable: false,
            uncached: false,
        }
    }

    pub const fn mmio() -> Self {
        Self {
            user: false,
            writable: true,
            executable: false,
            uncached: true,
        }
    }

    fn page_table_flags(self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if self.uncached {
            flags |= PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH;
        }
        flags
    }
}

/// A four-level page table rooted at `pml4_phys`.
pub struct PageMap {
    pml4_phys: PhysAddr,
    /// User maps free their low-half intermediate tables on drop.
    user: bool,
}

fn alloc_table() -> PhysAddr {
    let phys = pmalloc::pmalloc(1);
    assert!(phys != 0, "out of memory for page tables");
    let table = phys_to_virt(PhysAddr::new(phys as u64)).as_mut_ptr::<PageTable>();
    unsafe {
        (*table).zero();
    }
    PhysAddr::new(phys as u64)
}

fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

impl PageMap {
    /// Build the kernel map: identity map + higher-half window for
    /// every RAM range (2 MiB pages), with the vmem arena's
    /// intermediate tables pre-created so every later user map shares
    /// them. MMIO is not covered; `memory::map_mmio` adds uncached 4 KiB
    /// mappings on demand.
    ///
    /// `kernel_code` lists `(phys, size)` ranges that must stay
    /// executable (the loaded kernel image).
    pub fn new_kernel(ram: &[(u64, u64)], kernel_code: &[(u64, u64)]) -> Self {
        let map = Self {
            pml4_phys: alloc_table(),
            user: false,
        };

        const HUGE: u64 = 2 * 1024 * 1024;
        for &(range_base, range_size) in ram {
            let mut phys = range_base & !(HUGE - 1);
            let end = (range_base + range_size).next_multiple_of(HUGE);
            while phys < end {
                let executable = kernel_code
                    .iter()
                    .any(|&(base, size)| phys + HUGE > base && phys < base + size);

                let mut flags =
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE;
                if !executable {
                    flags |= PageTableFlags::NO_EXECUTE;
                }
                map.map_huge(VirtAddr::new(phys), PhysAddr::new(phys), flags);
                map.map_huge(
                    VirtAddr::new(PHYS_WINDOW_BASE + phys),
                    PhysAddr::new(phys),
                    flags | PageTableFlags::NO_EXECUTE,
                );
                phys += HUGE;
            }
        }

        // Record which low-half PML4 entries the identity map consumed.
        let pml4 = table_mut(map.pml4_phys);
        for (i, entry) in pml4.iter().enumerate().take(HIGHER_HALF_START) {
            if !entry.is_unused() {
                mark_kernel_low_entry(i);
            }
        }

        // Pre-create the arena's PDPTs so the PML4 entries exist before
        // the first user map clones the higher half.
        let mut addr = VMEM_BASE;
        while addr < VMEM_BASE + VMEM_SIZE {
            map.ensure_intermediate(VirtAddr::new(addr));
            addr += 512 * 1024 * 1024 * 1024;
        }

        map
    }

    /// Create a user map whose high half (and kernel low-half entries)
    /// mirror the kernel map.
    pub fn new_user() -> Self {
        let map = Self {
            pml4_phys: alloc_table(),
            user: true,
        };

        let kernel = super::kernel_map();
        let src = table_mut(kernel.pml4_phys);
        let dst = table_mut(map.pml4_phys);
        for i in 0..512 {
            if i >= HIGHER_HALF_START || is_kernel_low_entry(i) {
                dst[i] = src[i].clone();
            }
        }
        map
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.pml4_phys
    }

    /// Install this map as the active one on the current CPU.
    pub fn activate(&self) {
        let frame = PhysFrame::from_start_address(self.pml4_phys)
            .expect("page map root must be page-aligned");
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    /// Whether this map is the active one on the current CPU.
    pub fn is_active(&self) -> bool {
        Cr3::read().0.start_address() == self.pml4_phys
    }

    fn map_huge(&self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) {
        let pml4 = table_mut(self.pml4_phys);
        let pdpt_entry = &mut pml4[virt.p4_index()];
        if pdpt_entry.is_unused() {
            pdpt_entry.set_addr(
                alloc_table(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }
        let pdpt = table_mut(pdpt_entry.addr());
        let pd_entry = &mut pdpt[virt.p3_index()];
        if pd_entry.is_unused() {
            pd_entry.set_addr(
                alloc_table(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }
        let pd = table_mut(pd_entry.addr());
        pd[virt.p2_index()].set_addr(phys, flags);
    }

    /// Make sure the PML4 entry covering `virt` points at a PDPT.
    fn ensure_intermediate(&self, virt: VirtAddr) {
        let pml4 = table_mut(self.pml4_phys);
        let entry = &mut pml4[virt.p4_index()];
        if entry.is_unused() {
            entry.set_addr(
                alloc_table(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }
    }

    /// Walk to the L1 entry for `virt`, allocating intermediate tables.
    /// Intermediate entries are created with the union of permissions;
    /// the leaf carries the real ones.
    fn walk_create(&self, virt: VirtAddr, user: bool) -> &'static mut PageTable {
        let mut inter = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            inter |= PageTableFlags::USER_ACCESSIBLE;
        }

        let mut table = table_mut(self.pml4_phys);
        for index in [virt.p4_index(), virt.p3_index(), virt.p2_index()] {
            let entry = &mut table[index];
            if entry.is_unused() {
                entry.set_addr(alloc_table(), inter);
            } else if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
            }
            assert!(
                !entry.flags().contains(PageTableFlags::HUGE_PAGE),
                "4 KiB mapping attempted inside a huge page"
            );
            table = table_mut(entry.addr());
        }
        table
    }

    /// Map one page.
    ///
    /// User mappings must fall inside `USER_BASE..USER_TOP`; kernel
    /// mappings must not. This is the collision invariant between user
    /// and kernel address space.
    pub fn map(&self, virt: VirtAddr, phys: PhysAddr, flags: MapFlags) {
        assert!(virt.is_aligned(PAGE_SIZE as u64));
        if flags.user {
            assert!(
                virt.as_u64() >= USER_BASE && virt.as_u64() < USER_TOP,
                "user mapping outside the user range"
            );
        } else {
            assert!(
                virt.as_u64() < USER_BASE || virt.as_u64() >= PHYS_WINDOW_BASE,
                "kernel mapping inside the user range"
            );
        }

        let l1 = self.walk_create(virt, flags.user);
        let entry = &mut l1[virt.p1_index()];
        entry.set_addr(phys, flags.page_table_flags());
        self.flush(virt);
    }

    /// Remove one mapping, returning the frame it pointed at.
    pub fn unmap(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let l1 = self.walk(virt)?;
        let entry = &mut l1[virt.p1_index()];
        if entry.is_unused() {
            return None;
        }
        let phys = entry.addr();
        entry.set_unused();
        self.flush(virt);
        Some(phys)
    }

    /// Change the permissions of an existing mapping.
    pub fn protect(&self, virt: VirtAddr, flags: MapFlags) -> bool {
        let Some(l1) = self.walk(virt) else {
            return false;
        };
        let entry = &mut l1[virt.p1_index()];
        if entry.is_unused() {
            return false;
        }
        let phys = entry.addr();
        entry.set_addr(phys, flags.page_table_flags());
        self.flush(virt);
        true
    }

    /// Translate a virtual address, honoring huge pages.
    pub fn get_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table = table_mut(self.pml4_phys);
        for (index, huge_shift) in [
            (virt.p4_index(), None),
            (virt.p3_index(), Some(30u64)),
            (virt.p2_index(), Some(21u64)),
        ] {
            let entry = &table[index];
            if entry.is_unused() {
                return None;
            }
            if let Some(shift) = huge_shift
                && entry.flags().contains(PageTableFlags::HUGE_PAGE)
            {
                let offset = virt.as_u64() & ((1 << shift) - 1);
                return Some(entry.addr() + offset);
            }
            table = table_mut(entry.addr());
        }
        let entry = &table[virt.p1_index()];
        if entry.is_unused() {
            return None;
        }
        Some(entry.addr() + (virt.as_u64() & 0xfff))
    }

    fn walk(&self, virt: VirtAddr) -> Option<&'static mut PageTable> {
        let mut table = table_mut(self.pml4_phys);
        for index in [virt.p4_index(), virt.p3_index(), virt.p2_index()] {
            let entry = &table[index];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = table_mut(entry.addr());
        }
        Some(table)
    }

    /// Flush the local TLB for one page and shoot down remote CPUs that
    /// may hold the mapping.
    fn flush(&self, virt: VirtAddr) {
        if self.is_active() {
            x86_64::instructions::tlb::flush(virt);
        }
        crate::cpu::tlb_shootdown(virt);
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        if !self.user {
            return;
        }
        // Free user-owned intermediate tables. Leaf frames belong to
        // the process's Mapping/SharedMemory objects, not to the map.
        let pml4 = table_mut(self.pml4_phys);
        for i in 0..HIGHER_HALF_START {
            if is_kernel_low_entry(i) {
                continue;
            }
            let entry = &pml4[i];
            if entry.is_unused() {
                continue;
            }
            let pdpt = table_mut(entry.addr());
            for pdpt_entry in pdpt.iter() {
                if pdpt_entry.is_unused()
                    || pdpt_entry.flags().contains(PageTableFlags::HUGE_PAGE)
                {
                    continue;
                }
                let pd = table_mut(pdpt_entry.addr());
                for pd_entry in pd.iter() {
                    if pd_entry.is_unused()
                        || pd_entry.flags().contains(PageTableFlags::HUGE_PAGE)
                    {
                        continue;
                    }
                    pmalloc::pfree(pd_entry.addr().as_u64() as usize, 1);
                }
                pmalloc::pfree(pdpt_entry.addr().as_u64() as usize, 1);
            }
            pmalloc::pfree(entry.addr().as_u64() as usize, 1);
        }
        pmalloc::pfree(self.pml4_phys.as_u64() as usize, 1);
    }
}
