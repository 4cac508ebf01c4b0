#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use osprey_abi::SysError;
use osprey_kernel::memory::{MapFlags, Mapping};
use osprey_kernel::sched::thread::{Thread, ThreadEntry};
use osprey_kernel::{cpu, sched};

osprey_kernel::test_harness!(
    mismatched_value_is_try_again,
    wake_with_no_waiters_wakes_nobody,
    waiter_wakes_exactly_once,
    timeout_reports_timeout,
);

/// Map one user page into the kernel process and activate its map so
/// futex user access works from kernel threads.
fn user_word() -> usize {
    let process = sched::kernel_process();
    let base = process.alloc_user_range(4096);
    let mapping = Mapping::new_anonymous(
        &process.page_map,
        base,
        4096,
        MapFlags {
            user: true,
            writable: true,
            executable: false,
            uncached: false,
        },
    )
    .expect("one page for the futex word");
    process.add_mapping(mapping);
    process.page_map.activate();
    base.as_u64() as usize
}

fn store(addr: usize, value: u32) {
    unsafe {
        core::ptr::write_volatile(addr as *mut u32, value);
    }
}

fn mismatched_value_is_try_again() {
    let addr = user_word();
    store(addr, 7);
    let process = sched::kernel_process();
    assert_eq!(
        process.futexes.wait(addr, 8, 0),
        Err(SysError::TryAgain)
    );
}

fn wake_with_no_waiters_wakes_nobody() {
    let addr = user_word();
    let process = sched::kernel_process();
    assert_eq!(process.futexes.wake(addr, usize::MAX), 0);
}

fn waiter_wakes_exactly_once() {
    let addr = user_word();
    store(addr, 1);
    let process = sched::kernel_process();
    let wakes = Arc::new(AtomicUsize::new(0));

    let waker_wakes = wakes.clone();
    let thread = Thread::new(
        "futex waker",
        cpu::current_cpu(),
        process.clone(),
        ThreadEntry::Kernel(Box::new(move || {
            sched::sleep_us(30_000);
            store(addr, 2);
            let woken = sched::kernel_process().futexes.wake(addr, usize::MAX);
            waker_wakes.store(woken, Ordering::SeqCst);
        })),
    );
    sched::spawn(&thread);

    // Blocks until the value changes and the wake lands; returns once.
    process.futexes.wait(addr, 1, 0).unwrap();
    assert_eq!(unsafe { core::ptr::read_volatile(addr as *const u32) }, 2);

    sched::sleep_us(10_000);
    assert_eq!(wakes.load(Ordering::SeqCst), 1, "exactly one waiter woken");
}

fn timeout_reports_timeout() {
    let addr = user_word();
    store(addr, 5);
    let process = sched::kernel_process();
    let start = osprey_kernel::time::now_us();
    assert_eq!(
        process.futexes.wait(addr, 5, 30_000_000),
        Err(SysError::Timeout)
    );
    let elapsed = osprey_kernel::time::now_us() - start;
    assert!(elapsed >= 25_000, "waited only {elapsed}us");
}
