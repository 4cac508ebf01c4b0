//! I/O APIC driver for external interrupt routing.
//!
//! Routes Global System Interrupts (ISA lines after override
//! translation, PCI INTx pins from `_PRT`) to Local APIC vectors. Every
//! IOAPIC listed in the MADT is registered with its GSI base.

use alloc::vec::Vec;

use log::debug;
use spinning_top::Spinlock;
use x86_64::PhysAddr;

/// IOAPIC register offsets (accessed via index/data registers)
mod reg {
    #![allow(dead_code)]
    pub const ID: u32 = 0x00;
    pub const VERSION: u32 = 0x01;
    /// Redirection table entries start at 0x10, two 32-bit registers each.
    pub const REDIRECTION_BASE: u32 = 0x10;
}

/// One IOAPIC's registers plus its GSI window.
struct IoApic {
    base_virt: u64,
    gsi_base: u32,
    max_entries: u32,
}

impl IoApic {
    fn read(&self, index: u32) -> u32 {
        unsafe {
            core::ptr::write_volatile(self.base_virt as *mut u32, index);
            core::ptr::read_volatile((self.base_virt + 0x10) as *const u32)
        }
    }

    fn write(&self, index: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile(self.base_virt as *mut u32, index);
            core::ptr::write_volatile((self.base_virt + 0x10) as *mut u32, value);
        }
    }

    fn covers(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.max_entries
    }

    fn set_redirection(&self, gsi: u32, raw: u64) {
        let entry = reg::REDIRECTION_BASE + (gsi - self.gsi_base) * 2;
        self.write(entry, raw as u32);
        self.write(entry + 1, (raw >> 32) as u32);
    }
}

/// An ISA IRQ → GSI override from the MADT.
#[derive(Clone, Copy)]
pub struct IsaOverride {
    pub isa_irq: u8,
    pub gsi: u32,
    pub polarity_low: bool,
    pub trigger_level: bool,
}

struct Routing {
    ioapics: Vec<IoApic>,
    overrides: Vec<IsaOverride>,
}

static ROUTING: Spinlock<Routing> = Spinlock::new(Routing {
    ioapics: Vec::new(),
    overrides: Vec::new(),
});

/// Register one IOAPIC from the MADT.
pub fn register(phys: PhysAddr, gsi_base: u32) {
    let base_virt = crate::memory::map_mmio(phys, 0x20).as_u64();
    let mut ioapic = IoApic {
        base_virt,
        gsi_base,
        max_entries: 0,
    };
    ioapic.max_entries = ((ioapic.read(reg::VERSION) >> 16) & 0xff) + 1;

    // Mask everything until a driver asks for a route.
    for gsi in gsi_base..gsi_base + ioapic.max_entries {
        ioapic.set_redirection(gsi, 1 << 16);
    }

    debug!(
        "IOAPIC at {:#x}: GSI {}..{}",
        phys.as_u64(),
        gsi_base,
        gsi_base + ioapic.max_entries
    );
    ROUTING.lock().ioapics.push(ioapic);
}

/// Record an ISA interrupt source override from the MADT.
pub fn add_isa_override(entry: IsaOverride) {
    ROUTING.lock().overrides.push(entry);
}

/// Route a GSI to a LAPIC vector on the CPU with `dest_apic_id`.
pub fn route_gsi(gsi: u32, vector: u8, dest_apic_id: u32, polarity_low: bool, trigger_level: bool) {
    let routing = ROUTING.lock();
    let Some(ioapic) = routing.ioapics.iter().find(|ioapic| ioapic.covers(gsi)) else {
        log::warn!("no IOAPIC covers GSI {gsi}");
        return;
    };

    let mut raw = vector as u64;
    if polarity_low {
        raw |= 1 << 13;
    }
    if trigger_level {
        raw |= 1 << 15;
    }
    raw |= (dest_apic_id as u64) << 56;
    ioapic.set_redirection(gsi, raw);
}

/// Route a legacy ISA IRQ, honoring MADT overrides, to a vector on the
/// boot CPU.
pub fn route_isa_irq(isa_irq: u8, vector: u8) {
    let (gsi, polarity_low, trigger_level) = {
        let routing = ROUTING.lock();
        match routing.overrides.iter().find(|o| o.isa_irq == isa_irq) {
            Some(o) => (o.gsi, o.polarity_low, o.trigger_level),
            // Identity-mapped, active-high, edge-triggered by default.
            None => (isa_irq as u32, false, false),
        }
    };
    let bsp = crate::apic::current_lapic_id();
    route_gsi(gsi, vector, bsp, polarity_low, trigger_level);
}
