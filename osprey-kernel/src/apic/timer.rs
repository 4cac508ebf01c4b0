//! APIC timer calibration.
//!
//! Uses the PIT (Programmable Interval Timer) as a reference clock to
//! calibrate the APIC timer frequency; the tick source itself is the
//! one-shot LAPIC timer armed by the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use x86_64::instructions::port::Port;

use super::{DIVIDE_BY_16, TIMER_MASKED, TIMER_VECTOR, reg};

/// PIT frequency in Hz (standard PC timer crystal)
const PIT_FREQUENCY: u32 = 1_193_182;

/// Calibration duration in milliseconds
const CALIBRATION_MS: u32 = 10;

/// Calibrated APIC timer ticks per microsecond
static TICKS_PER_US: AtomicU64 = AtomicU64::new(0);

/// PIT I/O ports
mod pit {
    pub const CHANNEL0_DATA: u16 = 0x40;
    pub const COMMAND: u16 = 0x43;
}

/// PIT command byte: channel 0, lobyte/hibyte, mode 0 (interrupt on
/// terminal count)
const PIT_ONESHOT_CMD: u8 = 0b00_11_000_0;

/// Wait for approximately `ms` milliseconds using the PIT.
pub fn pit_wait_ms(ms: u32) {
    let count = (PIT_FREQUENCY * ms) / 1000;
    let count = count.min(0xFFFF) as u16;

    unsafe {
        let mut cmd_port: Port<u8> = Port::new(pit::COMMAND);
        let mut data_port: Port<u8> = Port::new(pit::CHANNEL0_DATA);

        cmd_port.write(PIT_ONESHOT_CMD);

        // Write count (low byte then high byte)
        data_port.write((count & 0xFF) as u8);
        data_port.write((count >> 8) as u8);

        // Poll until count reaches 0
        loop {
            cmd_port.write(0b11_10_00_00); // Read-back command, channel 0, latch count
            let low = data_port.read();
            let high = data_port.read();
            let current = (high as u16) << 8 | (low as u16);
            if current == 0 || current > count {
                break;
            }
        }
    }
}

/// Calibrate the APIC timer against the PIT.
pub fn calibrate() {
    super::write(reg::TIMER_DIVIDE, DIVIDE_BY_16);
    super::write(reg::LVT_TIMER, TIMER_VECTOR as u32 | TIMER_MASKED);
    super::write(reg::TIMER_INITIAL, 0xFFFF_FFFF);

    pit_wait_ms(CALIBRATION_MS);

    let elapsed = 0xFFFF_FFFF - super::read(reg::TIMER_CURRENT);
    super::write(reg::TIMER_INITIAL, 0);

    let per_us = (elapsed as u64 / (CALIBRATION_MS as u64 * 1000)).max(1);
    TICKS_PER_US.store(per_us, Ordering::SeqCst);

    debug!(
        "APIC timer calibrated: {} ticks/us (~{} MHz bus)",
        per_us,
        per_us * 16
    );
}

/// Calibrated APIC timer ticks per microsecond.
pub fn ticks_per_us() -> u64 {
    TICKS_PER_US.load(Ordering::SeqCst)
}
