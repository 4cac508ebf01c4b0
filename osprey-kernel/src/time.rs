//! Monotonic time and wall-clock access.
//!
//! The monotonic clock is a pluggable `ClockSource` behind a
//! reader-writer spinlock; readers (every `now_ns` call) never hold the
//! lock for more than the register read. The only source on x86-64 is
//! the invariant TSC, calibrated against the PIT at boot. Wall-clock
//! time comes from the CMOS RTC.

use alloc::boxed::Box;
use core::arch::x86_64::_rdtsc;

use log::debug;
use osprey_abi::DateTime;
use spinning_top::RwSpinlock;
use x86_64::instructions::port::Port;

/// A monotonic tick source.
pub trait ClockSource: Send + Sync {
    fn name(&self) -> &'static str;
    /// Nanoseconds since an arbitrary epoch at or before boot.
    fn now_ns(&self) -> u64;
}

static CLOCK_SOURCE: RwSpinlock<Option<&'static dyn ClockSource>> = RwSpinlock::new(None);

struct TscClock {
    base: u64,
    ticks_per_ms: u64,
}

impl ClockSource for TscClock {
    fn name(&self) -> &'static str {
        "tsc"
    }

    fn now_ns(&self) -> u64 {
        let now = unsafe { _rdtsc() };
        let delta = now.wrapping_sub(self.base);
        // Split to avoid overflowing the multiply on long uptimes.
        let ms = delta / self.ticks_per_ms;
        let rem = delta % self.ticks_per_ms;
        ms * 1_000_000 + rem * 1_000_000 / self.ticks_per_ms
    }
}

/// Calibrate the TSC against the PIT and install it as the clock
/// source.
pub fn init() {
    const CALIBRATION_MS: u32 = 10;

    let start = unsafe { _rdtsc() };
    crate::apic::timer::pit_wait_ms(CALIBRATION_MS);
    let end = unsafe { _rdtsc() };

    let ticks_per_ms = (end - start) / CALIBRATION_MS as u64;
    debug!(
        "TSC calibrated: {} ticks/ms (~{} MHz)",
        ticks_per_ms,
        ticks_per_ms / 1000
    );

    TSC_TICKS_PER_MS.store(ticks_per_ms, core::sync::atomic::Ordering::Relaxed);
    let clock = Box::leak(Box::new(TscClock {
        base: start,
        ticks_per_ms: ticks_per_ms.max(1),
    }));
    *CLOCK_SOURCE.write() = Some(clock);
}

/// TSC ticks per millisecond, for `GetArchInfo`.
pub fn ticks_per_ms() -> u64 {
    TSC_TICKS_PER_MS.load(core::sync::atomic::Ordering::Relaxed)
}

static TSC_TICKS_PER_MS: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Monotonic nanoseconds since boot. Zero before `init`.
pub fn now_ns() -> u64 {
    let guard = CLOCK_SOURCE.read();
    match *guard {
        Some(source) => source.now_ns(),
        None => 0,
    }
}

/// Monotonic microseconds since boot.
pub fn now_us() -> u64 {
    now_ns() / 1_000
}

/// Spin for at least `us` microseconds.
pub fn busy_wait_us(us: u64) {
    let deadline = now_ns() + us * 1_000;
    while now_ns() < deadline {
        core::hint::spin_loop();
    }
}

// ── CMOS RTC ─────────────────────────────────────────────────────────

const CMOS_ADDRESS: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;

fn cmos_read(register: u8) -> u8 {
    unsafe {
        Port::new(CMOS_ADDRESS).write(register);
        Port::new(CMOS_DATA).read()
    }
}

fn bcd_to_binary(value: u8) -> u8 {
    (value & 0x0f) + (value >> 4) * 10
}

/// Read the wall-clock date and time from the CMOS RTC.
///
/// Reads twice until stable so a rollover mid-read cannot produce a
/// torn value.
pub fn date_time() -> DateTime {
    fn read_once() -> DateTime {
        // Wait for the update-in-progress flag to clear.
        while cmos_read(0x0a) & 0x80 != 0 {
            core::hint::spin_loop();
        }

        let status_b = cmos_read(0x0b);
        let bcd = status_b & 0x04 == 0;
        let convert = |v: u8| if bcd { bcd_to_binary(v) } else { v };

        let mut hour_raw = cmos_read(0x04);
        let pm = hour_raw & 0x80 != 0;
        hour_raw &= 0x7f;
        let mut hour = convert(hour_raw);
        // 12-hour mode conversion.
        if status_b & 0x02 == 0 {
            hour %= 12;
            if pm {
                hour += 12;
            }
        }

        DateTime {
            year: 2000 + convert(cmos_read(0x09)) as u16,
            month: convert(cmos_read(0x08)),
            day: convert(cmos_read(0x07)),
            hour,
            minute: convert(cmos_read(0x02)),
            second: convert(cmos_read(0x00)),
        }
    }

    loop {
        let first = read_once();
        let second = read_once();
        if first == second {
            return first;
        }
    }
}
