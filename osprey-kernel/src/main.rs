#![no_main]
#![no_std]

extern crate alloc;

use ::uefi::{Status, entry};
use log::info;
use osprey_kernel::{exec, sched, uefi, vfs};

#[entry]
fn main() -> Status {
    uefi::init();
    let boot = uefi::collect_and_exit_boot_services();
    osprey_kernel::init(&boot);

    // The initramfs is the root filesystem, read-only.
    vfs::mount("/", vfs::TarFs::build(boot.initramfs));

    info!("Osprey");

    match exec::spawn_process("/bin/init", &[alloc::string::String::from("init")], [const { None }; 3]) {
        Ok(process) => info!("spawned init as pid {}", process.id),
        Err(err) => panic!("could not start /bin/init: {err:?}"),
    }

    // The boot context has done its job; the scheduler owns the CPU
    // from here.
    sched::exit_thread(0);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use log::error;
    use x86_64::instructions::hlt;

    let file = info.location().map(|l| l.file()).unwrap_or("unknown");
    let line = info.location().map(|l| l.line()).unwrap_or(0);

    error!("PANIC at [{}:{}]:\n{}", file, line, info.message());
    osprey_kernel::breakpoint();
    loop {
        hlt();
    }
}
