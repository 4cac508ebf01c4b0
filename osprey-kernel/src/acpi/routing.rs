//! PCI legacy interrupt routing from `_PRT`.
//!
//! The root bus's `_PRT` package maps (device, INTx pin) to a GSI.
//! Entries whose source is a link device would need the link's `_CRS`
//! interpreted; those are skipped here and the device falls back to its
//! interrupt-line register.

use alloc::collections::BTreeMap;

use ::acpi::aml::namespace::AmlName;
use ::acpi::aml::object::Object;
use log::{debug, warn};
use spinning_top::Spinlock;

/// (device, pin 0..=3) → GSI for the root bus.
static ROUTES: Spinlock<BTreeMap<(u8, u8), u32>> = Spinlock::new(BTreeMap::new());

/// Walk `\_SB.PCI0._PRT` and record the static-GSI entries.
pub fn init() {
    let parsed = super::power::with_interpreter(|interpreter| {
        let Ok(name) = AmlName::from_str("\\_SB.PCI0._PRT") else {
            return 0;
        };
        let Ok(value) = interpreter.evaluate(name, alloc::vec::Vec::new()) else {
            warn!("acpi: no _PRT on the root bus");
            return 0;
        };
        let Object::Package(entries) = &*value else {
            return 0;
        };

        let mut routes = ROUTES.lock();
        let mut count = 0;
        for entry in entries {
            let Object::Package(fields) = &**entry else {
                continue;
            };
            if fields.len() < 4 {
                continue;
            }
            let Object::Integer(address) = &*fields[0] else {
                continue;
            };
            let Object::Integer(pin) = &*fields[1] else {
                continue;
            };
            // A zero (integer) source means field 4 is the GSI
            // directly; a reference names a link device whose _CRS is
            // not interpreted here.
            let is_static = matches!(&*fields[2], Object::Integer(0));
            if !is_static {
                continue;
            }
            let Object::Integer(gsi) = &*fields[3] else {
                continue;
            };

            let device = (address >> 16) as u8;
            routes.insert((device, *pin as u8), *gsi as u32);
            count += 1;
        }
        count
    });

    if let Some(count) = parsed {
        debug!("acpi: {count} static _PRT routes");
    }
}

/// The GSI for `(bus, device, pin)`; root bus only.
pub fn lookup(bus: u8, device: u8, pin: u8) -> Option<u32> {
    if bus != 0 {
        return None;
    }
    ROUTES.lock().get(&(device, pin)).copied()
}
