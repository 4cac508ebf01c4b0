//! Power transitions: S5 power-off and reset.
//!
//! Power-off follows the ACPI recipe: evaluate the `\_S5` package for
//! the SLP_TYP values, then write SLP_TYP | SLP_EN into PM1a (and PM1b
//! when present). Reset goes through the FADT reset register with the
//! 8042 pulse as fallback.

use ::acpi::aml::Interpreter;
use ::acpi::aml::namespace::AmlName;
use ::acpi::aml::object::Object;
use ::acpi::sdt::fadt::Fadt;
use log::{info, warn};
use spinning_top::Spinlock;
use x86_64::instructions::port::Port;

use super::handler::KernelAcpiHandler;

const SLP_EN: u16 = 1 << 13;

struct SleepValues {
    pm1a_port: u16,
    pm1b_port: Option<u16>,
    slp_typ_a: u16,
    slp_typ_b: u16,
}

static S5: Spinlock<Option<SleepValues>> = Spinlock::new(None);
static INTERPRETER: Spinlock<Option<Interpreter<KernelAcpiHandler>>> = Spinlock::new(None);

/// Load the DSDT/SSDTs into the interpreter and cache the `_S5`
/// values. Failures are logged and shutdown falls back to the QEMU
/// exit device.
pub fn init() {
    let interpreter = super::with_tables(|tables| {
        // DSDT revision 2 selects 64-bit integer semantics.
        let interpreter = Interpreter::new(KernelAcpiHandler, 2);

        match tables.dsdt() {
            Ok(dsdt) => {
                let stream = unsafe {
                    core::slice::from_raw_parts(
                        crate::memory::phys_to_virt(x86_64::PhysAddr::new(dsdt.address as u64))
                            .as_ptr(),
                        dsdt.length as usize,
                    )
                };
                if let Err(err) = interpreter.load_table(stream) {
                    warn!("acpi: DSDT load failed: {err:?}");
                }
            }
            Err(err) => warn!("acpi: no DSDT: {err:?}"),
        }

        for ssdt in tables.ssdts() {
            let stream = unsafe {
                core::slice::from_raw_parts(
                    crate::memory::phys_to_virt(x86_64::PhysAddr::new(ssdt.address as u64))
                        .as_ptr(),
                    ssdt.length as usize,
                )
            };
            if let Err(err) = interpreter.load_table(stream) {
                warn!("acpi: SSDT load failed: {err:?}");
            }
        }

        interpreter
    });

    let s5 = read_s5(&interpreter);
    *INTERPRETER.lock() = Some(interpreter);
    match s5 {
        Some(values) => {
            info!(
                "acpi: _S5 = ({}, {})",
                values.slp_typ_a, values.slp_typ_b
            );
            *S5.lock() = Some(values);
        }
        None => warn!("acpi: no usable _S5 package"),
    }
}

/// Run `f` with the loaded interpreter, if AML came up.
pub fn with_interpreter<R>(
    f: impl FnOnce(&Interpreter<KernelAcpiHandler>) -> R,
) -> Option<R> {
    let interpreter = INTERPRETER.lock();
    interpreter.as_ref().map(f)
}

fn read_s5(interpreter: &Interpreter<KernelAcpiHandler>) -> Option<SleepValues> {
    let name = AmlName::from_str("\\_S5").ok()?;
    let value = interpreter.evaluate(name, alloc::vec::Vec::new()).ok()?;

    let Object::Package(elements) = &*value else {
        return None;
    };
    let mut typ = [0u16; 2];
    for (slot, element) in typ.iter_mut().zip(elements.iter()) {
        if let Object::Integer(value) = &**element {
            *slot = *value as u16;
        }
    }

    let (pm1a_port, pm1b_port) = super::with_tables(|tables| {
        let fadt = tables.find_table::<Fadt>().ok()?;
        let pm1a = fadt.pm1a_control_block().ok()?.address as u16;
        let pm1b = fadt
            .pm1b_control_block()
            .ok()
            .flatten()
            .map(|block| block.address as u16);
        Some((pm1a, pm1b))
    })?;

    Some(SleepValues {
        pm1a_port,
        pm1b_port,
        slp_typ_a: typ[0],
        slp_typ_b: typ[1],
    })
}

/// Enter S5. Falls back to the QEMU debug exit device when ACPI did
/// not provide the sleep values.
pub fn power_off() -> ! {
    if let Some(values) = S5.lock().take() {
        info!("acpi: entering S5");
        unsafe {
            let mut pm1a: Port<u16> = Port::new(values.pm1a_port);
            pm1a.write((values.slp_typ_a << 10) | SLP_EN);
            if let Some(port) = values.pm1b_port {
                let mut pm1b: Port<u16> = Port::new(port);
                pm1b.write((values.slp_typ_b << 10) | SLP_EN);
            }
        }
        // The write should not return; give the chipset a moment.
        crate::time::busy_wait_us(1_000_000);
    }
    crate::qemu::exit_qemu(crate::qemu::QemuExitCode::Success);
}

/// Reset the machine: FADT reset register first, 8042 pulse second.
pub fn reboot() -> ! {
    let reset = super::with_tables(|tables| {
        let fadt = tables.find_table::<Fadt>().ok()?;
        let register = fadt.reset_register().ok()?;
        Some((register.address as u16, fadt.reset_value))
    });

    if let Some((port, value)) = reset {
        unsafe {
            Port::new(port).write(value);
        }
        crate::time::busy_wait_us(100_000);
    }

    // Keyboard controller CPU reset pulse.
    unsafe {
        let mut kbd: Port<u8> = Port::new(0x64);
        kbd.write(0xfe);
    }
    loop {
        x86_64::instructions::hlt();
    }
}
