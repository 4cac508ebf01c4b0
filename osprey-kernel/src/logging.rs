//! Kernel log sinks.
//!
//! Log records go to the COM1 serial port and, when present, the QEMU
//! debugcon port (0xe9). Sinks sit behind a reader-writer spinlock so
//! `get`-style readers (none today) never starve the writers for long.

use core::fmt::{Result, Write};

use spinning_top::RwSpinlock;
use x86_64::instructions::port::Port;

struct SerialPortWriter(u16);

impl Write for SerialPortWriter {
    fn write_str(&mut self, s: &str) -> Result {
        let mut port = Port::new(self.0);

        for c in s.bytes() {
            unsafe {
                port.write(c);
            }
        }

        Ok(())
    }
}

const COM1: u16 = 0x3f8;
const DEBUGCON: u16 = 0xe9;

struct Sinks {
    serial: SerialPortWriter,
    debugcon: SerialPortWriter,
}

static SINKS: RwSpinlock<Sinks> = RwSpinlock::new(Sinks {
    serial: SerialPortWriter(COM1),
    debugcon: SerialPortWriter(DEBUGCON),
});

pub fn _print(args: ::core::fmt::Arguments) {
    // Interrupt handlers log too; holding the sink lock with
    // interrupts enabled would let them spin on this CPU forever.
    let _irq = crate::irq_guard::IrqGuard::new();
    let mut sinks = SINKS.write();
    let _ = sinks.serial.write_fmt(args);
    let _ = sinks.debugcon.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::logging::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($fmt:expr) => {
        {
            $crate::print!($fmt);
            $crate::print!("\n");
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        {
            $crate::print!($fmt, $($arg)*);
            $crate::print!("\n");
        }
    };
}

pub struct Logger;

impl Logger {
    pub fn init(&self) {
        _print(format_args!("\x1b[0m"));
    }
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!(
                "[{}:{}] {}: {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        // nothing
    }
}
