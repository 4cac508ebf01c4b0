#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use osprey_kernel::sched::thread::{Thread, ThreadDescriptor, ThreadEntry};
use osprey_kernel::{cpu, sched, time};

osprey_kernel::test_harness!(
    spawned_thread_runs_and_is_reaped,
    sleep_honors_the_deadline,
    descriptor_publishes_exit_status,
    yield_interleaves_equal_threads,
    busy_threads_share_the_cpu,
);

fn spawn_kernel(name: &str, f: impl FnOnce() + Send + 'static) -> Arc<Thread> {
    let thread = Thread::new(
        name,
        cpu::current_cpu(),
        sched::kernel_process(),
        ThreadEntry::Kernel(Box::new(f)),
    );
    sched::spawn(&thread);
    thread
}

/// Create a thread with a descriptor attached before it can run, so
/// the exit publication cannot race the registration.
fn spawn_with_descriptor(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Arc<ThreadDescriptor> {
    let thread = Thread::new(
        name,
        cpu::current_cpu(),
        sched::kernel_process(),
        ThreadEntry::Kernel(Box::new(f)),
    );
    let descriptor = ThreadDescriptor::new(&thread);
    sched::spawn(&thread);
    descriptor
}

fn spawned_thread_runs_and_is_reaped() {
    let ran = Arc::new(AtomicBool::new(false));
    let worker_ran = ran.clone();
    let descriptor = spawn_with_descriptor("runner", move || {
        worker_ran.store(true, Ordering::SeqCst);
    });

    while !descriptor.exited.load(Ordering::SeqCst) {
        descriptor.exit_event.wait_with_timeout(10_000);
    }
    assert!(ran.load(Ordering::SeqCst));
}

fn sleep_honors_the_deadline() {
    let start = time::now_us();
    sched::sleep_us(50_000);
    let elapsed = time::now_us() - start;
    assert!(elapsed >= 45_000, "slept only {elapsed}us");
    assert!(elapsed < 500_000, "overslept: {elapsed}us");
}

fn descriptor_publishes_exit_status() {
    let descriptor = spawn_with_descriptor("exiter", || {});

    while !descriptor.exited.load(Ordering::SeqCst) {
        descriptor.exit_event.wait_with_timeout(10_000);
    }
    // The kernel-thread exit path reports 0, and the back reference is
    // cleared atomically with publication.
    assert_eq!(descriptor.exit_status.load(Ordering::SeqCst), 0);
    assert!(descriptor.thread.lock().is_none());
}

fn yield_interleaves_equal_threads() {
    let counter = Arc::new(AtomicU64::new(0));
    let worker_counter = counter.clone();
    let done = Arc::new(AtomicBool::new(false));
    let worker_done = done.clone();

    spawn_kernel("yielder", move || {
        for _ in 0..100 {
            worker_counter.fetch_add(1, Ordering::SeqCst);
            sched::yield_now();
        }
        worker_done.store(true, Ordering::SeqCst);
    });

    // Yielding from this side must let the worker make progress.
    let mut observed = 0;
    for _ in 0..10_000 {
        sched::yield_now();
        let now = counter.load(Ordering::SeqCst);
        if now > observed {
            observed = now;
        }
        if done.load(Ordering::SeqCst) {
            break;
        }
    }
    assert!(done.load(Ordering::SeqCst), "worker starved");
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

/// Two equal busy threads over ~200 ms each land near half the CPU
/// (generous bounds; the tick is 10 ms at level 0).
fn busy_threads_share_the_cpu() {
    let a = Arc::new(AtomicU64::new(0));
    let b = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    for counter in [a.clone(), b.clone()] {
        let stop = stop.clone();
        spawn_kernel("spinner", move || {
            while !stop.load(Ordering::SeqCst) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    sched::sleep_us(200_000);
    stop.store(true, Ordering::SeqCst);
    sched::sleep_us(20_000);

    let a = a.load(Ordering::SeqCst) as f64;
    let b = b.load(Ordering::SeqCst) as f64;
    assert!(a > 0.0 && b > 0.0, "both spinners ran");
    let share = a / (a + b);
    assert!(
        (0.15..=0.85).contains(&share),
        "unbalanced schedule: {share}"
    );
}
