#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use osprey_kernel::sched::event::Event;
use osprey_kernel::sched::thread::{Thread, ThreadEntry};
use osprey_kernel::{cpu, sched};

osprey_kernel::test_harness!(
    pending_signal_satisfies_wait,
    signal_wakes_a_blocked_waiter,
    timeout_expires_without_signal,
    signal_all_releases_every_waiter,
    wait_any_reports_the_signalled_event,
);

fn spawn_kernel(f: impl FnOnce() + Send + 'static) {
    let thread = Thread::new(
        "test worker",
        cpu::current_cpu(),
        sched::kernel_process(),
        ThreadEntry::Kernel(Box::new(f)),
    );
    sched::spawn(&thread);
}

fn pending_signal_satisfies_wait() {
    let event = Event::new();
    event.signal_one();
    assert!(event.is_pending());
    event.wait();
    assert!(!event.is_pending());
}

fn signal_wakes_a_blocked_waiter() {
    let event = Arc::new(Event::new());
    let hits = Arc::new(AtomicUsize::new(0));

    let worker_event = event.clone();
    let worker_hits = hits.clone();
    spawn_kernel(move || {
        sched::sleep_us(20_000);
        worker_hits.store(1, Ordering::SeqCst);
        worker_event.signal_one();
    });

    event.wait();
    assert_eq!(hits.load(Ordering::SeqCst), 1, "woken after the signal");
}

fn timeout_expires_without_signal() {
    let event = Event::new();
    let start = osprey_kernel::time::now_us();
    assert!(!event.wait_with_timeout(30_000));
    let elapsed = osprey_kernel::time::now_us() - start;
    assert!(elapsed >= 25_000, "timeout waited: {elapsed}us");
}

fn signal_all_releases_every_waiter() {
    let event = Arc::new(Event::new());
    let woken = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let worker_event = event.clone();
        let worker_woken = woken.clone();
        spawn_kernel(move || {
            worker_event.wait();
            worker_woken.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Give the workers time to block, then release them all.
    sched::sleep_us(30_000);
    event.signal_all();
    for _ in 0..100 {
        if woken.load(Ordering::SeqCst) == 3 {
            return;
        }
        sched::sleep_us(10_000);
    }
    panic!("only {} of 3 waiters woke", woken.load(Ordering::SeqCst));
}

fn wait_any_reports_the_signalled_event() {
    let a = Arc::new(Event::new());
    let b = Arc::new(Event::new());

    let signal_b = b.clone();
    spawn_kernel(move || {
        sched::sleep_us(20_000);
        signal_b.signal_one();
    });

    let index = Event::wait_any(&[&a, &b], 500_000);
    assert_eq!(index, Some(1));

    // Timeout path.
    let index = Event::wait_any(&[&a], 20_000);
    assert_eq!(index, None);
}
