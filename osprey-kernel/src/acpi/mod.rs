//! ACPI bring-up.
//!
//! Tables are located from the firmware RSDP. FADT, MADT and MCFG are
//! consumed directly; the DSDT (and SSDTs) go through the AML
//! interpreter for the pieces firmware only describes there: the `_S5`
//! sleep package and PCI `_PRT` interrupt routing.

pub mod handler;
pub mod power;
pub mod routing;

use ::acpi::AcpiTables;
use ::acpi::sdt::madt::{Madt, MadtEntry};
use log::{debug, info, warn};
use spinning_top::Spinlock;
use x86_64::PhysAddr;

use handler::KernelAcpiHandler;

static TABLES: Spinlock<Option<AcpiTables<KernelAcpiHandler>>> = Spinlock::new(None);

/// Parse the static tables and register every CPU and IOAPIC the MADT
/// lists. The boot CPU must already be online.
pub fn init(rsdp: PhysAddr) {
    let tables = match unsafe {
        AcpiTables::from_rsdp(KernelAcpiHandler, rsdp.as_u64() as usize)
    } {
        Ok(tables) => tables,
        Err(err) => {
            warn!("acpi: failed to parse tables: {err:?}");
            return;
        }
    };

    if let Ok(madt) = tables.find_table::<Madt>() {
        let bsp_apic_id = crate::cpu::current_cpu().apic_id;

        for entry in madt.entries() {
            match entry {
                MadtEntry::LocalApic(lapic) => {
                    // Bit 0: processor enabled.
                    if lapic.flags & 1 != 0 && lapic.apic_id as u32 != bsp_apic_id {
                        debug!("acpi: CPU slot for apic id {}", lapic.apic_id);
                        crate::cpu::register_cpu(lapic.apic_id as u32);
                    }
                }
                MadtEntry::IoApic(ioapic) => {
                    crate::apic::ioapic::register(
                        PhysAddr::new(ioapic.io_apic_address as u64),
                        ioapic.global_system_interrupt_base,
                    );
                }
                MadtEntry::InterruptSourceOverride(along) => {
                    // Polarity/trigger: 2-bit fields, 0b11 = low/level.
                    let polarity_low = along.flags & 0x3 == 0x3;
                    let trigger_level = (along.flags >> 2) & 0x3 == 0x3;
                    crate::apic::ioapic::add_isa_override(crate::apic::ioapic::IsaOverride {
                        isa_irq: along.irq,
                        gsi: along.global_system_interrupt,
                        polarity_low,
                        trigger_level,
                    });
                }
                _ => {}
            }
        }
    }

    *TABLES.lock() = Some(tables);
    info!("acpi: tables parsed, {} cpus known", crate::cpu::cpu_count());

    power::init();
    routing::init();
}

/// Run `f` against the parsed tables.
///
/// # Panics
/// Panics when called before `init` (a boot-ordering invariant).
pub fn with_tables<R>(f: impl FnOnce(&AcpiTables<KernelAcpiHandler>) -> R) -> R {
    let tables = TABLES.lock();
    let tables = tables.as_ref().expect("acpi::init has parsed the tables");
    f(tables)
}

/// Whether table parsing succeeded.
pub fn is_ready() -> bool {
    TABLES.lock().is_some()
}
