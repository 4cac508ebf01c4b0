//! PCI enumeration over MCFG-described ECAM space.
//!
//! Every segment group's config window is mapped once; buses are walked
//! breadth-first and each discovered function is matched against the
//! static driver table by `(vendor, device)` or
//! `(class, subclass, prog_if)`. Legacy INTx lines are routed through
//! ACPI `_PRT` where available, with the interrupt-line register as the
//! fallback.

use alloc::vec::Vec;

use acpi::sdt::mcfg::Mcfg;
use log::{debug, info};
use spinning_top::RwSpinlock;
use x86_64::PhysAddr;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PciSegmentGroup {
    group_id: u16,
    base_virt: u64,
    bus_start: u8,
    bus_end: u8,
}

static SEGMENT_GROUPS: RwSpinlock<Vec<PciSegmentGroup>> = RwSpinlock::new(Vec::new());

/// One PCI function's config space.
#[derive(Clone, Copy)]
pub struct PciDevice {
    config_base: u64,
    pub segment: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciDevice {
    fn new(group: &PciSegmentGroup, bus: u8, slot: u8, function: u8) -> PciDevice {
        let offset = ((bus as u64 - group.bus_start as u64) << 20)
            | ((slot as u64) << 15)
            | ((function as u64) << 12);
        PciDevice {
            config_base: group.base_virt + offset,
            segment: group.group_id,
            bus,
            slot,
            function,
        }
    }

    pub fn read32(&self, offset: u16) -> u32 {
        unsafe { core::ptr::read_volatile((self.config_base + offset as u64) as *const u32) }
    }

    pub fn write32(&self, offset: u16, value: u32) {
        unsafe { core::ptr::write_volatile((self.config_base + offset as u64) as *mut u32, value) }
    }

    pub fn read16(&self, offset: u16) -> u16 {
        (self.read32(offset & !3) >> ((offset & 3) * 8)) as u16
    }

    pub fn read8(&self, offset: u16) -> u8 {
        (self.read32(offset & !3) >> ((offset & 3) * 8)) as u8
    }

    pub fn vendor_id(&self) -> u16 {
        self.read16(0x00)
    }

    pub fn device_id(&self) -> u16 {
        self.read16(0x02)
    }

    pub fn class(&self) -> u8 {
        self.read8(0x0b)
    }

    pub fn subclass(&self) -> u8 {
        self.read8(0x0a)
    }

    pub fn prog_if(&self) -> u8 {
        self.read8(0x09)
    }

    pub fn is_multifunction(&self) -> bool {
        self.read8(0x0e) & 0x80 != 0
    }

    /// The INTx pin this function asserts (1 = INTA), 0 when none.
    pub fn interrupt_pin(&self) -> u8 {
        self.read8(0x3d)
    }

    pub fn interrupt_line(&self) -> u8 {
        self.read8(0x3c)
    }

    /// Decode a memory BAR's base address, honoring 64-bit BARs.
    pub fn bar_mmio(&self, index: u8) -> Option<u64> {
        let offset = 0x10 + index as u16 * 4;
        let low = self.read32(offset);
        if low & 1 != 0 {
            return None; // IO space
        }
        let base = (low & !0xf) as u64;
        if (low >> 1) & 0x3 == 0x2 {
            let high = self.read32(offset + 4) as u64;
            Some(base | (high << 32))
        } else {
            Some(base)
        }
    }

    /// Allow the device to master the bus (DMA) and decode memory.
    pub fn enable_bus_master(&self) {
        let command = self.read32(0x04);
        self.write32(0x04, command | 0x6);
    }

    /// Route this function's legacy interrupt to `vector` on the boot
    /// CPU: `_PRT` first, the interrupt-line register as fallback.
    pub fn route_interrupt(&self, vector: u8) {
        let pin = self.interrupt_pin();
        if pin != 0
            && let Some(gsi) = crate::acpi::routing::lookup(self.bus, self.slot, pin - 1)
        {
            debug!(
                "pci {:02x}:{:02x}.{}: INT{} -> GSI {gsi} -> vector {vector:#x}",
                self.bus,
                self.slot,
                self.function,
                (b'A' + pin - 1) as char,
            );
            let bsp = crate::apic::current_lapic_id();
            // PCI interrupts are level-triggered, active-low.
            crate::apic::ioapic::route_gsi(gsi, vector, bsp, true, true);
            return;
        }

        let line = self.interrupt_line();
        if line != 0 && line != 0xff {
            debug!(
                "pci {:02x}:{:02x}.{}: legacy line {line} -> vector {vector:#x}",
                self.bus, self.slot, self.function
            );
            crate::apic::ioapic::route_isa_irq(line, vector);
        }
    }
}

/// A driver registration: which functions it matches and its init.
pub struct PciDriver {
    pub name: &'static str,
    pub matches: PciMatch,
    pub init: fn(&PciDevice),
}

pub enum PciMatch {
    Id { vendor: u16, device: u16 },
    Class { class: u8, subclass: u8, prog_if: Option<u8> },
}

impl PciMatch {
    fn matches(&self, device: &PciDevice) -> bool {
        match *self {
            PciMatch::Id { vendor, device: id } => {
                device.vendor_id() == vendor && device.device_id() == id
            }
            PciMatch::Class {
                class,
                subclass,
                prog_if,
            } => {
                device.class() == class
                    && device.subclass() == subclass
                    && prog_if.is_none_or(|p| device.prog_if() == p)
            }
        }
    }
}

/// The link-time driver table.
static DRIVERS: &[PciDriver] = &[PciDriver {
    name: "e1000",
    matches: PciMatch::Id {
        vendor: 0x8086,
        device: 0x100e,
    },
    init: crate::net::e1000::init,
}];

/// Map ECAM windows from the MCFG and walk every bus.
pub fn init() {
    let mcfg_entries = crate::acpi::with_tables(|tables| {
        let mut entries = Vec::new();
        if let Ok(mcfg) = tables.find_table::<Mcfg>() {
            for entry in mcfg.entries() {
                entries.push((
                    entry.pci_segment_group,
                    entry.base_address,
                    entry.bus_number_start,
                    entry.bus_number_end,
                ));
            }
        }
        entries
    });

    if mcfg_entries.is_empty() {
        info!("pci: no MCFG, skipping enumeration");
        return;
    }

    {
        let mut groups = SEGMENT_GROUPS.write();
        for (group_id, base, bus_start, bus_end) in mcfg_entries {
            let buses = (bus_end - bus_start) as usize + 1;
            let window = buses << 20;
            let base_virt = crate::memory::map_mmio(PhysAddr::new(base), window).as_u64();
            groups.push(PciSegmentGroup {
                group_id,
                base_virt,
                bus_start,
                bus_end,
            });
        }
    }

    let groups = SEGMENT_GROUPS.read().clone();
    for group in &groups {
        for bus in group.bus_start..=group.bus_end {
            for slot in 0..32 {
                scan_slot(group, bus, slot);
            }
        }
    }
}

fn scan_slot(group: &PciSegmentGroup, bus: u8, slot: u8) {
    let first = PciDevice::new(group, bus, slot, 0);
    if first.vendor_id() == 0xffff {
        return;
    }
    let functions = if first.is_multifunction() { 8 } else { 1 };
    for function in 0..functions {
        let device = PciDevice::new(group, bus, slot, function);
        if device.vendor_id() == 0xffff {
            continue;
        }
        debug!(
            "pci {:02x}:{:02x}.{}: {:04x}:{:04x} class {:02x}.{:02x}",
            bus,
            slot,
            function,
            device.vendor_id(),
            device.device_id(),
            device.class(),
            device.subclass()
        );
        for driver in DRIVERS {
            if driver.matches.matches(&device) {
                info!("pci: binding {} to {:02x}:{:02x}.{}", driver.name, bus, slot, function);
                (driver.init)(&device);
            }
        }
    }
}
