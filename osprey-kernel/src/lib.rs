#![no_std]
#![feature(abi_x86_interrupt)]
#![feature(ptr_as_ref_unchecked)]

extern crate alloc;

pub mod acpi;
pub mod apic;
pub mod cpu;
pub mod devices;
pub mod evm;
pub mod exec;
pub mod handle;
pub mod input;
pub mod interrupts;
pub mod irq_guard;
pub mod logging;
pub mod memory;
pub mod net;
pub mod pci;
pub mod qemu;
pub mod random;
pub mod sched;
pub mod small_fn;
pub mod socket;
pub mod syscall;
pub mod time;
pub mod uefi;
pub mod vfs;

// Panic handler is defined in each binary (main.rs, tests/*) not in lib

use logging::Logger;

pub use qemu::{QemuExitCode, exit_qemu};
pub use uefi::BootInfo;

static LOGGER: Logger = Logger;

#[global_allocator]
static ALLOCATOR: memory::heap::Allocator = memory::heap::Allocator;

/// Initialize kernel subsystems from the frozen boot info. Caller must
/// call `uefi::init()` and `uefi::collect_and_exit_boot_services()`
/// first.
pub fn init(boot: &BootInfo) {
    LOGGER.init();
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Debug);

    unsafe {
        memory::init(&boot.memory_map);
    }

    interrupts::init();
    syscall::init();
    apic::init(None);
    cpu::init_bsp(apic::current_lapic_id());
    time::init();

    // Seed the pool before anything asks for randomness.
    random::add_entropy(&[
        unsafe { core::arch::x86_64::_rdtsc() },
        boot.acpi2_rsdp.map(|a| a.as_u64()).unwrap_or(0),
        pmalloc_fingerprint(),
    ]);

    match boot.acpi2_rsdp {
        Some(rsdp) => acpi::init(rsdp),
        None => log::warn!("no ACPI2 RSDP from firmware"),
    }

    sched::init();
    pci::init();
    input::init();

    if let Some(framebuffer) = boot.framebuffer {
        devices::framebuffer::init(framebuffer);
    }

    sched::start_ticking();
}

fn pmalloc_fingerprint() -> u64 {
    (memory::pmalloc::total_memory() as u64) << 20 ^ memory::pmalloc::free_pages() as u64
}

/// Trait for test functions that can print their name
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        print!("{}...\t", core::any::type_name::<T>());
        self();
        println!("[ok]");
    }
}

/// Test runner that executes all test cases
pub fn test_runner(tests: &[&dyn Testable]) {
    println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    println!();
    println!("All tests passed!");
    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for tests - prints error and exits QEMU with failure
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    println!("[failed]");
    println!();
    println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
}

pub fn breakpoint() {
    // do nothing, just give an address to set breakpoints on in `.gdbinit`
}

/// Run tests and exit QEMU. Call this from test entry points.
pub fn run_tests(tests: &[&dyn Testable]) -> ! {
    test_runner(tests);
    // test_runner calls exit_qemu, but just in case:
    exit_qemu(QemuExitCode::Success);
}

/// Macro to generate test harness boilerplate.
/// Usage:
/// ```
/// osprey_kernel::test_harness!(test1, test2, test3);
/// ```
#[macro_export]
macro_rules! test_harness {
    ($($test:ident),* $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "efiapi" fn efi_main(
            image: ::uefi::Handle,
            system_table: *const core::ffi::c_void,
        ) -> ::uefi::Status {
            unsafe {
                ::uefi::boot::set_image_handle(image);
                ::uefi::table::set_system_table(system_table.cast());
            }
            $crate::uefi::init();
            let boot = $crate::uefi::collect_and_exit_boot_services();
            $crate::init(&boot);
            $crate::vfs::mount("/", $crate::vfs::TarFs::build(boot.initramfs));
            let tests: &[&dyn $crate::Testable] = &[$(&$test),*];
            $crate::run_tests(tests);
        }

        #[panic_handler]
        fn panic(info: &core::panic::PanicInfo) -> ! {
            $crate::test_panic_handler(info)
        }
    };
}
