//! APIC drivers for interrupt management.
//!
//! - Local APIC: the per-CPU tick source, EOI, and inter-processor
//!   interrupts (TLB shootdown, halt).
//! - I/O APIC: external interrupt routing from ISA and PCI devices.

pub mod ioapic;
pub mod timer;

use core::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use x86_64::PhysAddr;

/// Local APIC register offsets
#[allow(dead_code)]
mod reg {
    pub const ID: u32 = 0x020;
    pub const VERSION: u32 = 0x030;
    pub const TPR: u32 = 0x080; // Task Priority Register
    pub const EOI: u32 = 0x0B0; // End of Interrupt
    pub const SPURIOUS: u32 = 0x0F0; // Spurious Interrupt Vector
    pub const ERROR_STATUS: u32 = 0x280;
    pub const ICR_LOW: u32 = 0x300; // Interrupt Command Register (low)
    pub const ICR_HIGH: u32 = 0x310; // Interrupt Command Register (high)
    pub const LVT_TIMER: u32 = 0x320; // Local Vector Table - Timer
    pub const LVT_LINT0: u32 = 0x350;
    pub const LVT_LINT1: u32 = 0x360;
    pub const TIMER_INITIAL: u32 = 0x380; // Timer Initial Count
    pub const TIMER_CURRENT: u32 = 0x390; // Timer Current Count
    pub const TIMER_DIVIDE: u32 = 0x3E0; // Timer Divide Configuration
}

/// Vector taken by the LAPIC timer (the scheduler tick).
pub const TIMER_VECTOR: u8 = 0x20;
/// Spurious interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xff;

const TIMER_ONE_SHOT: u32 = 0b00 << 17;
const TIMER_MASKED: u32 = 1 << 16;
const DIVIDE_BY_16: u32 = 0b0011;

/// The standard Local APIC base; the MADT may relocate it.
const DEFAULT_APIC_BASE: u64 = 0xFEE0_0000;

/// APIC MMIO base virtual address; set once during init, then read
/// lock-free from interrupt context.
static APIC_BASE_VIRT: AtomicU64 = AtomicU64::new(0);

#[inline]
fn read(offset: u32) -> u32 {
    let base = APIC_BASE_VIRT.load(Ordering::Acquire);
    debug_assert!(base != 0, "Local APIC not initialized");
    unsafe { core::ptr::read_volatile((base + offset as u64) as *const u32) }
}

#[inline]
fn write(offset: u32, value: u32) {
    let base = APIC_BASE_VIRT.load(Ordering::Acquire);
    debug_assert!(base != 0, "Local APIC not initialized");
    unsafe { core::ptr::write_volatile((base + offset as u64) as *mut u32, value) }
}

/// Whether `init` has run; cheap gate for code that may execute before
/// the APIC exists (early TLB shootdowns, panic paths).
pub fn is_ready() -> bool {
    APIC_BASE_VIRT.load(Ordering::Acquire) != 0
}

/// Map and enable the local APIC of the calling CPU.
///
/// `base` comes from the MADT; pass `None` to use the architectural
/// default.
pub fn init(base: Option<PhysAddr>) {
    let phys = base.unwrap_or(PhysAddr::new(DEFAULT_APIC_BASE));
    let virt = crate::memory::map_mmio(phys, 4096);
    APIC_BASE_VIRT.store(virt.as_u64(), Ordering::Release);

    debug!(
        "Local APIC: id={} version={:#x}",
        current_lapic_id(),
        read(reg::VERSION) & 0xff
    );

    // Enable (bit 8) with the spurious vector, accept all priorities.
    write(reg::SPURIOUS, (SPURIOUS_VECTOR as u32) | (1 << 8));
    write(reg::TPR, 0);

    // Timer starts masked; the scheduler arms it.
    write(reg::TIMER_DIVIDE, DIVIDE_BY_16);
    write(reg::LVT_TIMER, TIMER_VECTOR as u32 | TIMER_MASKED);

    timer::calibrate();
}

/// The LAPIC ID of the calling CPU.
pub fn current_lapic_id() -> u32 {
    (read(reg::ID) >> 24) & 0xff
}

/// Send End of Interrupt. Lock-free; callable from interrupt handlers.
#[inline]
pub fn eoi() {
    write(reg::EOI, 0);
}

/// Arm the one-shot tick to fire `us` microseconds from now.
pub fn set_timer_oneshot_us(us: u64) {
    let ticks = timer::ticks_per_us()
        .saturating_mul(us)
        .clamp(1, u32::MAX as u64) as u32;
    write(reg::LVT_TIMER, TIMER_VECTOR as u32 | TIMER_ONE_SHOT);
    write(reg::TIMER_INITIAL, ticks);
}

/// Stop the one-shot tick.
pub fn stop_timer() {
    write(reg::TIMER_INITIAL, 0);
    write(reg::LVT_TIMER, TIMER_VECTOR as u32 | TIMER_MASKED);
}

/// Send a fixed-delivery IPI to `apic_id`.
pub fn send_ipi(apic_id: u32, vector: u8) {
    write(reg::ICR_HIGH, apic_id << 24);
    // Fixed delivery, physical destination, assert.
    write(reg::ICR_LOW, vector as u32 | (1 << 14));
    while read(reg::ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}
