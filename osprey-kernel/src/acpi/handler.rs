//! The `acpi` crate's platform handler, backed by the physical window
//! and port IO. The AML-facing hooks (region access, stalls, mutexes)
//! are live: the interpreter uses them while walking `_S5` and `_PRT`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use x86_64::PhysAddr;
use x86_64::instructions::port::Port;

use crate::memory::{map_mmio, phys_to_virt};

#[derive(Clone, Copy)]
pub struct KernelAcpiHandler;

fn mem_ptr<T>(address: usize) -> *mut T {
    phys_to_virt(PhysAddr::new(address as u64)).as_mut_ptr()
}

impl ::acpi::Handler for KernelAcpiHandler {
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> acpi::PhysicalMapping<Self, T> {
        // Tables live in reclaimable RAM already covered by the window;
        // map_mmio fills in anything (fixed hardware registers) that is
        // not.
        let phys = PhysAddr::new(physical_address as u64);
        map_mmio(phys, size);
        let virt = phys_to_virt(phys).as_u64() as usize;
        let virtual_start = unsafe { NonNull::new_unchecked(virt as *mut _) };

        acpi::PhysicalMapping {
            physical_start: physical_address,
            virtual_start,
            region_length: size,
            mapped_length: size,
            handler: *self,
        }
    }

    fn unmap_physical_region<T>(_region: &acpi::PhysicalMapping<Self, T>) {
        // Window mappings persist for the kernel's lifetime.
    }

    fn read_u8(&self, address: usize) -> u8 {
        unsafe { core::ptr::read_volatile(mem_ptr(address)) }
    }

    fn read_u16(&self, address: usize) -> u16 {
        unsafe { core::ptr::read_volatile(mem_ptr(address)) }
    }

    fn read_u32(&self, address: usize) -> u32 {
        unsafe { core::ptr::read_volatile(mem_ptr(address)) }
    }

    fn read_u64(&self, address: usize) -> u64 {
        unsafe { core::ptr::read_volatile(mem_ptr(address)) }
    }

    fn write_u8(&self, address: usize, value: u8) {
        unsafe { core::ptr::write_volatile(mem_ptr(address), value) }
    }

    fn write_u16(&self, address: usize, value: u16) {
        unsafe { core::ptr::write_volatile(mem_ptr(address), value) }
    }

    fn write_u32(&self, address: usize, value: u32) {
        unsafe { core::ptr::write_volatile(mem_ptr(address), value) }
    }

    fn write_u64(&self, address: usize, value: u64) {
        unsafe { core::ptr::write_volatile(mem_ptr(address), value) }
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        unsafe { Port::new(port).read() }
    }

    fn read_io_u16(&self, port: u16) -> u16 {
        unsafe { Port::new(port).read() }
    }

    fn read_io_u32(&self, port: u16) -> u32 {
        unsafe { Port::new(port).read() }
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        unsafe { Port::new(port).write(value) }
    }

    fn write_io_u16(&self, port: u16, value: u16) {
        unsafe { Port::new(port).write(value) }
    }

    fn write_io_u32(&self, port: u16, value: u32) {
        unsafe { Port::new(port).write(value) }
    }

    fn read_pci_u8(&self, address: acpi::PciAddress, offset: u16) -> u8 {
        (legacy_pci_read(address, offset) >> ((offset & 3) * 8)) as u8
    }

    fn read_pci_u16(&self, address: acpi::PciAddress, offset: u16) -> u16 {
        (legacy_pci_read(address, offset) >> ((offset & 2) * 8)) as u16
    }

    fn read_pci_u32(&self, address: acpi::PciAddress, offset: u16) -> u32 {
        legacy_pci_read(address, offset)
    }

    fn write_pci_u8(&self, address: acpi::PciAddress, offset: u16, value: u8) {
        let old = legacy_pci_read(address, offset);
        let shift = (offset & 3) * 8;
        legacy_pci_write(
            address,
            offset,
            (old & !(0xff << shift)) | ((value as u32) << shift),
        );
    }

    fn write_pci_u16(&self, address: acpi::PciAddress, offset: u16, value: u16) {
        let old = legacy_pci_read(address, offset);
        let shift = (offset & 2) * 8;
        legacy_pci_write(
            address,
            offset,
            (old & !(0xffff << shift)) | ((value as u32) << shift),
        );
    }

    fn write_pci_u32(&self, address: acpi::PciAddress, offset: u16, value: u32) {
        legacy_pci_write(address, offset, value);
    }

    fn nanos_since_boot(&self) -> u64 {
        crate::time::now_ns()
    }

    fn stall(&self, microseconds: u64) {
        crate::time::busy_wait_us(microseconds);
    }

    fn sleep(&self, milliseconds: u64) {
        if crate::cpu::try_current_thread().is_some() {
            crate::sched::sleep_us(milliseconds * 1000);
        } else {
            crate::time::busy_wait_us(milliseconds * 1000);
        }
    }

    fn create_mutex(&self) -> acpi::Handle {
        // AML runs single-threaded here; handles only need identity.
        static NEXT: AtomicU32 = AtomicU32::new(1);
        acpi::Handle(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    fn acquire(&self, _mutex: acpi::Handle, _timeout: u16) -> Result<(), acpi::aml::AmlError> {
        Ok(())
    }

    fn release(&self, _mutex: acpi::Handle) {}
}

/// Legacy CF8/CFC config access, used only from AML (segment 0).
fn legacy_pci_address(address: acpi::PciAddress, offset: u16) -> u32 {
    0x8000_0000
        | ((address.bus as u32) << 16)
        | ((address.device as u32) << 11)
        | ((address.function as u32) << 8)
        | (offset as u32 & 0xfc)
}

fn legacy_pci_read(address: acpi::PciAddress, offset: u16) -> u32 {
    unsafe {
        Port::new(0xcf8).write(legacy_pci_address(address, offset));
        Port::new(0xcfc).read()
    }
}

fn legacy_pci_write(address: acpi::PciAddress, offset: u16, value: u32) {
    unsafe {
        Port::new(0xcf8).write(legacy_pci_address(address, offset));
        Port::new(0xcfc).write(value)
    }
}
