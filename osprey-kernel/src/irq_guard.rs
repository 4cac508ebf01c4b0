//! Scoped interrupt-disable guard.

use x86_64::instructions::interrupts;

/// Disables interrupts for the guard's lifetime and restores the
/// previous enable state on drop. Nesting is idempotent: inner guards
/// observe interrupts already off and restore "off".
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        Self { was_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            interrupts::enable();
        }
    }
}
