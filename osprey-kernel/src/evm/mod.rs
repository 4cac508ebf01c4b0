//! EVM: the hardware virtualization runtime.
//!
//! An `Evm` is a guest physical address space backed by EPT; the host
//! frames backing guest memory are pinned for the `Evm`'s lifetime and
//! reference-counted so several guests can share a backing page. Each
//! `VirtualCpu` owns a VMCS plus a guest-state page mapped into the
//! owning process.

pub mod vcpu;
pub mod vmx;

pub use vcpu::VirtualCpu;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;
use x86_64::VirtAddr;

use crate::memory::{PAGE_SIZE, phys_window, pmalloc};
use crate::sched::process::Process;

/// EPT leaf permissions: read, write, execute, WB memory type.
const EPT_LEAF_FLAGS: u64 = 0x7 | (6 << 3);
/// EPT intermediate permissions.
const EPT_TABLE_FLAGS: u64 = 0x7;

/// A pinned host frame backing guest memory, shared between guests
/// through the `Arc` count.
pub struct PinnedPage {
    phys: usize,
    /// Frames allocated by the EVM itself (not views of user memory)
    /// are released when the pin drops.
    owned: bool,
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        if self.owned {
            pmalloc::pfree(self.phys, 1);
        }
    }
}

pub struct Evm {
    ept_root: usize,
    /// Guest frame number → pinned backing page.
    mappings: Spinlock<BTreeMap<u64, Arc<PinnedPage>>>,
    /// Intermediate EPT tables, freed on drop.
    tables: Spinlock<Vec<usize>>,
    pub vcpus: Spinlock<Vec<Arc<VirtualCpu>>>,
}

fn alloc_table_page() -> SysResult<usize> {
    let phys = pmalloc::pmalloc(1);
    if phys == 0 {
        return Err(SysError::NoMem);
    }
    unsafe {
        core::ptr::write_bytes(phys_window::to_virt_mut::<u8>(phys), 0, PAGE_SIZE);
    }
    Ok(phys)
}

impl Evm {
    /// Create a guest address space. Fails with `Unsupported` when the
    /// CPU lacks (or the firmware locked out) VMX.
    pub fn create() -> SysResult<Arc<Evm>> {
        vmx::ensure_vmxon()?;
        let ept_root = alloc_table_page()?;
        Ok(Arc::new(Evm {
            ept_root,
            mappings: Spinlock::new(BTreeMap::new()),
            tables: Spinlock::new(Vec::new()),
            vcpus: Spinlock::new(Vec::new()),
        }))
    }

    pub fn ept_pointer(&self) -> u64 {
        self.ept_root as u64
    }

    /// Walk (and build) the EPT down to the L1 table for `guest_phys`.
    fn ept_l1(&self, guest_phys: u64) -> SysResult<*mut u64> {
        let mut table = self.ept_root;
        for level in (1..4).rev() {
            let index = ((guest_phys >> (12 + 9 * level)) & 0x1ff) as usize;
            let entry = unsafe { phys_window::to_virt_mut::<u64>(table).add(index) };
            let value = unsafe { entry.read() };
            table = if value & 0x7 == 0 {
                let new_table = alloc_table_page()?;
                self.tables.lock().push(new_table);
                unsafe {
                    entry.write(new_table as u64 | EPT_TABLE_FLAGS);
                }
                new_table
            } else {
                (value & !0xfff) as usize
            };
        }
        Ok(phys_window::to_virt_mut::<u64>(table))
    }

    fn ept_map_page(&self, guest_phys: u64, host_phys: usize) -> SysResult<()> {
        let l1 = self.ept_l1(guest_phys)?;
        let index = ((guest_phys >> 12) & 0x1ff) as usize;
        unsafe {
            l1.add(index).write(host_phys as u64 | EPT_LEAF_FLAGS);
        }
        Ok(())
    }

    fn ept_unmap_page(&self, guest_phys: u64) {
        if let Ok(l1) = self.ept_l1(guest_phys) {
            let index = ((guest_phys >> 12) & 0x1ff) as usize;
            unsafe {
                l1.add(index).write(0);
            }
        }
    }

    /// Map `size` bytes of the caller's memory at `host_virt` into the
    /// guest at `guest_phys`. The backing frames are pinned until unmap
    /// or EVM destruction.
    pub fn map(
        &self,
        process: &Arc<Process>,
        guest_phys: u64,
        host_virt: u64,
        size: usize,
    ) -> SysResult<()> {
        if guest_phys as usize % PAGE_SIZE != 0
            || host_virt as usize % PAGE_SIZE != 0
            || size % PAGE_SIZE != 0
            || size == 0
        {
            return Err(SysError::InvalidArgument);
        }

        let mut mappings = self.mappings.lock();
        for offset in (0..size as u64).step_by(PAGE_SIZE) {
            let host_phys = process
                .page_map
                .get_phys(VirtAddr::new(host_virt + offset))
                .ok_or(SysError::Fault)?;
            let frame = host_phys.as_u64() as usize & !(PAGE_SIZE - 1);
            let gfn = (guest_phys + offset) >> 12;
            self.ept_map_page(guest_phys + offset, frame)?;
            mappings.insert(
                gfn,
                Arc::new(PinnedPage {
                    phys: frame,
                    owned: false,
                }),
            );
        }
        Ok(())
    }

    /// Remove guest mappings, dropping the pins.
    pub fn unmap(&self, guest_phys: u64, size: usize) -> SysResult<()> {
        if guest_phys as usize % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(SysError::InvalidArgument);
        }
        let mut mappings = self.mappings.lock();
        for offset in (0..size as u64).step_by(PAGE_SIZE) {
            let gfn = (guest_phys + offset) >> 12;
            if mappings.remove(&gfn).is_none() {
                return Err(SysError::NotExists);
            }
            self.ept_unmap_page(guest_phys + offset);
        }
        Ok(())
    }

    /// Host physical backing of one guest page, for instruction fetch
    /// during MMIO decode.
    pub fn guest_to_host(&self, guest_phys: u64) -> Option<usize> {
        let mappings = self.mappings.lock();
        mappings
            .get(&(guest_phys >> 12))
            .map(|pin| pin.phys + (guest_phys as usize & (PAGE_SIZE - 1)))
    }
}

impl Drop for Evm {
    fn drop(&mut self) {
        for table in self.tables.lock().drain(..) {
            pmalloc::pfree(table, 1);
        }
        pmalloc::pfree(self.ept_root, 1);
    }
}
