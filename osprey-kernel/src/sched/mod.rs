//! The per-CPU multi-level scheduler.
//!
//! Each CPU owns `SCHED_LEVELS` run queues. Level *i* gets a time slice
//! of `(i + 1) * MAX_SLICE_US / SCHED_LEVELS` microseconds, so lower
//! levels run shorter slices at higher frequency. A thread that burns
//! its whole slice decays one level (unless `pin_level`); blocking,
//! yielding and sleeping boost it one level back. The tick source is
//! the one-shot LAPIC timer, armed to the earlier of the current slice
//! end and the next sleeper's deadline.
//!
//! Exited threads land on their CPU's destroy list; a dedicated,
//! CPU-pinned destroyer thread drains it, detaches each thread from its
//! process and publishes process exit when the last thread goes.

pub mod context;
pub mod event;
pub mod futex;
pub mod process;
pub mod signal;
pub mod thread;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;

use log::debug;
use spinning_top::Spinlock;

use crate::cpu::{self, Cpu};
use crate::irq_guard::IrqGuard;
use context::{SavedGprs, TrapFrame, switch_context};
use event::Event;
use process::Process;
use thread::{Status, Thread, ThreadEntry, ThreadQueue};

/// Number of run-queue levels.
pub const SCHED_LEVELS: usize = 5;
/// Slice of the slowest level, microseconds.
pub const MAX_SLICE_US: u64 = 50_000;

const US_PER_LEVEL: u64 = MAX_SLICE_US / SCHED_LEVELS as u64;

struct Level {
    slice_us: u64,
    queue: Spinlock<ThreadQueue>,
}

/// Scheduler state touched only by the owning CPU with interrupts
/// disabled.
struct SchedInner {
    current: Option<Arc<Thread>>,
    prev: Option<Arc<Thread>>,
    /// Microseconds left in the current thread's slice.
    us_to_next_schedule: u64,
    /// Length of the currently armed tick.
    current_irq_period: u64,
}

/// One CPU's scheduler.
pub struct Scheduler {
    levels: [Level; SCHED_LEVELS],
    sleeping: Spinlock<ThreadQueue>,
    destroy_queue: Spinlock<ThreadQueue>,
    destroy_event: Event,
    idle: Spinlock<Option<Arc<Thread>>>,
    inner: UnsafeCell<SchedInner>,
}

// Safety: `inner` is only touched from the owning CPU with interrupts
// disabled; everything else carries its own lock.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            levels: core::array::from_fn(|i| Level {
                slice_us: US_PER_LEVEL * (i as u64 + 1),
                queue: Spinlock::new(ThreadQueue::new()),
            }),
            sleeping: Spinlock::new(ThreadQueue::new()),
            destroy_queue: Spinlock::new(ThreadQueue::new()),
            destroy_event: Event::new(),
            idle: Spinlock::new(None),
            inner: UnsafeCell::new(SchedInner {
                current: None,
                prev: None,
                us_to_next_schedule: 0,
                current_irq_period: 0,
            }),
        }
    }

    /// # Safety
    /// Caller must be on this scheduler's CPU with interrupts disabled.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut SchedInner {
        unsafe { &mut *self.inner.get() }
    }

    /// Append a thread to its current level's queue.
    pub fn queue(&self, thread: Arc<Thread>) {
        let level = thread.level_index.load(Ordering::Relaxed);
        let _irq = IrqGuard::new();
        self.levels[level].queue.lock().push_back(thread);
    }
}

static KERNEL_PROCESS: Spinlock<Option<Arc<Process>>> = Spinlock::new(None);

/// The process owning kernel threads (idle, destroyer, net workers).
pub fn kernel_process() -> Arc<Process> {
    KERNEL_PROCESS
        .lock()
        .clone()
        .expect("sched::init has created the kernel process")
}

/// The process of the calling thread.
pub fn current_process() -> Arc<Process> {
    cpu::current_thread().process.clone()
}

/// Set up scheduling on the boot CPU: the kernel process, the idle and
/// destroyer threads, a bootstrap thread wrapping the boot context, and
/// the preemption timer entry.
pub fn init() {
    let kernel_process = Process::new("kernel");
    *KERNEL_PROCESS.lock() = Some(kernel_process.clone());

    crate::interrupts::set_raw_handler(
        crate::apic::TIMER_VECTOR,
        context::timer_entry as usize as u64,
    );

    let cpu = cpu::current_cpu();

    let idle = Thread::new(
        "idle",
        cpu,
        kernel_process.clone(),
        ThreadEntry::Kernel(Box::new(idle_loop)),
    );
    idle.pin_level.store(true, Ordering::Relaxed);
    idle.pin_cpu.store(true, Ordering::Relaxed);
    *cpu.scheduler.idle.lock() = Some(idle);

    let destroyer = Thread::new(
        "thread destroyer",
        cpu,
        kernel_process.clone(),
        ThreadEntry::Kernel(Box::new(move || destroyer_loop())),
    );
    destroyer.pin_cpu.store(true, Ordering::Relaxed);
    spawn(&destroyer);

    // The context we are executing right now becomes a real thread so
    // it can block, yield and exit like any other.
    let bootstrap = Thread::new(
        "boot",
        cpu,
        kernel_process,
        ThreadEntry::Kernel(Box::new(|| {})),
    );
    bootstrap.set_status(Status::Running);
    let _irq = IrqGuard::new();
    let inner = unsafe { cpu.scheduler.inner() };
    inner.us_to_next_schedule = cpu.scheduler.levels[0].slice_us;
    unsafe {
        cpu.set_current_thread(Arc::as_ptr(&bootstrap) as *mut Thread);
    }
    inner.current = Some(bootstrap);
    cpu.thread_count.fetch_add(1, Ordering::SeqCst);

    debug!("scheduler ready on cpu {}", cpu.id);
}

/// Begin preemption on the calling CPU.
pub fn start_ticking() {
    let cpu = cpu::current_cpu();
    let _irq = IrqGuard::new();
    unsafe {
        enable_preemption(cpu);
    }
}

/// Make a new thread runnable.
pub fn spawn(thread: &Arc<Thread>) {
    thread.set_status(Status::Waiting);
    thread.cpu.scheduler.queue(thread.clone());
    thread.cpu.thread_count.fetch_add(1, Ordering::SeqCst);
}

fn idle_loop() {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Drains this CPU's destroy list: detaches each exited thread from its
/// process and tears the process down when its last thread goes.
fn destroyer_loop() -> ! {
    let cpu = cpu::current_cpu();
    loop {
        loop {
            let thread = {
                let _irq = IrqGuard::new();
                cpu.scheduler.destroy_queue.lock().pop_front()
            };
            let Some(thread) = thread else {
                break;
            };

            debug!("destroying exited thread {}", thread.name);
            let process = thread.process.clone();
            let last = process.remove_thread(&thread);
            cpu.thread_count.fetch_sub(1, Ordering::SeqCst);
            drop(thread);

            if last {
                debug!("destroying empty process {}", process.name);
                process.publish_exit();
                process.drain();
            }
        }

        cpu.scheduler.destroy_event.wait();
    }
}

/// Pick the next thread to run.
///
/// Must run with interrupts disabled on the CPU whose scheduler this
/// is. Mirrors the tick path: if the current thread's slice has time
/// left it keeps running; otherwise it decays a level and the queues
/// are scanned lowest level first.
unsafe fn update_schedule(cpu: &'static Cpu) {
    let sched = &cpu.scheduler;
    let inner = unsafe { sched.inner() };

    let current = inner.current.clone().expect("scheduler has a current thread");

    if current.status() == Status::Running {
        if inner.us_to_next_schedule > inner.current_irq_period {
            inner.us_to_next_schedule -= inner.current_irq_period;
            inner.prev = Some(current);
            return;
        }

        let level = current.level_index.load(Ordering::Relaxed);
        if !current.pin_level.load(Ordering::Relaxed) && level < SCHED_LEVELS - 1 {
            current.level_index.store(level + 1, Ordering::Relaxed);
        }
    }

    // Killed threads are still scheduled: they observe the flag at
    // their own next decision point and exit, cleaning up any wait
    // registrations on their stack on the way.
    let mut next = None;
    'scan: for level in &sched.levels {
        let mut queue = level.queue.lock();
        for _ in 0..queue.len() {
            let Some(candidate) = queue.pop_front() else {
                break;
            };
            if candidate.status() == Status::Waiting {
                next = Some(candidate);
                break 'scan;
            }
            queue.push_back(candidate);
        }
    }

    let next = match next {
        Some(next) => next,
        None => {
            let killed = current.process.killed.load(Ordering::Relaxed);
            let exited = current.exited.load(Ordering::Relaxed);
            if !killed && !exited && current.status() == Status::Running {
                inner.prev = Some(current);
                return;
            }
            sched
                .idle
                .lock()
                .clone()
                .expect("idle thread exists once scheduling starts")
        }
    };

    inner.us_to_next_schedule =
        sched.levels[next.level_index.load(Ordering::Relaxed)].slice_us;
    inner.prev = inner.current.replace(next);
}

/// Switch to the thread picked by `update_schedule`, if different.
///
/// Must run with interrupts disabled on the owning CPU. Returns when
/// this thread is next scheduled (or immediately when no switch was
/// needed).
unsafe fn do_schedule(cpu: &'static Cpu) {
    let sched = &cpu.scheduler;
    let inner = unsafe { sched.inner() };

    let (Some(prev), Some(current)) = (inner.prev.take(), inner.current.clone()) else {
        return;
    };
    if Arc::ptr_eq(&prev, &current) {
        // No switch; a yield that found no successor keeps running.
        current.set_status(Status::Running);
        return;
    }

    if prev.exited.load(Ordering::Relaxed) || prev.process.killed.load(Ordering::Relaxed) {
        prev.publish_exit(prev.process.exit_status.load(Ordering::SeqCst));
        sched.destroy_queue.lock().push_back(prev.clone());
        sched.destroy_event.signal_one();
    } else {
        let is_idle = sched
            .idle
            .lock()
            .as_ref()
            .is_some_and(|idle| Arc::ptr_eq(idle, &prev));
        if !is_idle && prev.status() == Status::Running {
            prev.set_status(Status::Waiting);
            sched.queue(prev.clone());
        }
    }

    current.set_status(Status::Running);
    current.process.page_map.activate();
    unsafe {
        cpu.set_current_thread(Arc::as_ptr(&current) as *mut Thread);
    }

    // User-mode segment bases travel with the thread.
    use x86_64::registers::model_specific::{FsBase, GsBase};
    FsBase::write(x86_64::VirtAddr::new(current.fs_base.load(Ordering::Relaxed)));
    GsBase::write(x86_64::VirtAddr::new(current.gs_base.load(Ordering::Relaxed)));

    let prev_ctx = prev.context.get();
    let next_ctx = current.context.get();
    // Keep the Arcs alive across the switch: `prev` stays reachable via
    // the queues or the destroy list, `current` via `inner.current`.
    drop(prev);
    drop(current);
    unsafe {
        switch_context(prev_ctx, next_ctx);
    }
}

/// Fresh threads land here from the trampoline before running their
/// entry; nothing to clean up in the current design, but the hook is
/// where switch-tail work belongs if any appears.
pub(crate) fn finish_switch() {}

/// Block the calling thread until `unblock`. Boosts one level.
pub fn block() {
    let _irq = IrqGuard::new();
    let cpu = cpu::current_cpu();
    let current = cpu::current_thread();

    {
        let _move = current.move_lock.lock();
        if current.unblock_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        current.set_status(Status::Blocked);
    }

    boost_level(current);
    crate::apic::stop_timer();
    unsafe {
        update_schedule(cpu);
        enable_preemption(cpu);
        do_schedule(cpu);
    }
}

/// Give up the CPU but stay runnable. Boosts one level.
pub fn yield_now() {
    let _irq = IrqGuard::new();
    let cpu = cpu::current_cpu();
    let current = cpu::current_thread();

    if current.process.killed.load(Ordering::SeqCst) {
        exit_current_on_kill(current);
    }

    current.set_status(Status::Waiting);
    boost_level(current);
    // Queue ourselves so the scan can pick us back up when nothing
    // else is runnable.
    let current_arc = unsafe {
        Arc::increment_strong_count(current as *const Thread);
        Arc::from_raw(current as *const Thread)
    };
    cpu.scheduler.queue(current_arc);
    crate::apic::stop_timer();
    unsafe {
        update_schedule(cpu);
        enable_preemption(cpu);
        do_schedule(cpu);
    }
}

/// Sleep for `us` microseconds (or until an `unblock` with
/// `remove_sleeping` wakes us early). Returns true if the full
/// deadline elapsed.
pub fn sleep_us(us: u64) -> bool {
    let _irq = IrqGuard::new();
    let cpu = cpu::current_cpu();
    let current = cpu::current_thread();

    let deadline = crate::time::now_us() + us;
    current.sleep_end_us.store(deadline, Ordering::SeqCst);
    current.sleep_interrupted.store(false, Ordering::SeqCst);

    {
        let _move = current.move_lock.lock();
        if current.unblock_pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        let mut sleeping = cpu.scheduler.sleeping.lock();
        let mut at = core::ptr::null_mut();
        for thread in sleeping.iter() {
            if thread.sleep_end_us.load(Ordering::SeqCst) > deadline {
                at = thread as *const Thread as *mut Thread;
                break;
            }
        }
        let arc = unsafe {
            Arc::increment_strong_count(current as *const Thread);
            Arc::from_raw(current as *const Thread)
        };
        sleeping.insert_before(at, arc);
        current.set_status(Status::Sleeping);
    }

    boost_level(current);
    crate::apic::stop_timer();
    unsafe {
        update_schedule(cpu);
        enable_preemption(cpu);
        do_schedule(cpu);
    }

    current.sleep_interrupted.load(Ordering::SeqCst)
}

/// Make a blocked or sleeping thread runnable. With `remove_sleeping`,
/// a sleeper is pulled off its deadline list (an early wake); the timer
/// path passes false because it already removed the thread.
///
/// Racing against a thread that has not finished blocking yet is closed
/// by the move lock: the pending flag makes its block a no-op.
pub fn unblock(thread: &Arc<Thread>, remove_sleeping: bool) {
    let _irq = IrqGuard::new();
    let _move = thread.move_lock.lock();

    let status = thread.status();
    match status {
        Status::Blocked => {
            thread.set_status(Status::Waiting);
            thread.cpu.scheduler.queue(thread.clone());
        }
        Status::Sleeping => {
            if remove_sleeping {
                let mut sleeping = thread.cpu.scheduler.sleeping.lock();
                unsafe {
                    sleeping.remove(thread);
                }
            }
            thread.sleep_interrupted.store(false, Ordering::SeqCst);
            thread.set_status(Status::Waiting);
            thread.cpu.scheduler.queue(thread.clone());
        }
        Status::Running | Status::Waiting => {
            thread.unblock_pending.store(true, Ordering::SeqCst);
        }
    }
}

/// A thread noticing its process died mid-wait finishes the kill.
pub(crate) fn exit_current_on_kill(current: &Thread) -> ! {
    exit_thread(current.process.exit_status.load(Ordering::SeqCst));
}

fn boost_level(thread: &Thread) {
    let level = thread.level_index.load(Ordering::Relaxed);
    if level > 0 {
        thread.level_index.store(level - 1, Ordering::Relaxed);
    }
}

/// Wake due sleepers and arm the one-shot tick for
/// `min(current slice, time to next wake)`.
///
/// Must run with interrupts disabled on the owning CPU.
unsafe fn enable_preemption(cpu: &'static Cpu) {
    let sched = &cpu.scheduler;
    let now = crate::time::now_us();

    let mut first_sleep_end = u64::MAX;
    loop {
        let woken = {
            let mut sleeping = sched.sleeping.lock();
            let Some(head) = sleeping.iter().next() else {
                break;
            };
            let end = head.sleep_end_us.load(Ordering::SeqCst);
            if end > now {
                first_sleep_end = end;
                break;
            }
            let head = head as *const Thread;
            unsafe { sleeping.remove(&*head) }
        };
        if let Some(thread) = woken {
            thread.sleep_interrupted.store(true, Ordering::SeqCst);
            {
                let _move = thread.move_lock.lock();
                if thread.status() == Status::Sleeping {
                    thread.set_status(Status::Waiting);
                    sched.queue(thread.clone());
                }
            }
        }
    }

    let inner = unsafe { sched.inner() };
    let slice_us = match &inner.current {
        Some(current) => {
            sched.levels[current.level_index.load(Ordering::Relaxed)].slice_us
        }
        None => sched.levels[0].slice_us,
    };
    let until_wake = first_sleep_end.saturating_sub(now).max(100);
    let amount = slice_us.min(until_wake);
    inner.current_irq_period = amount;
    crate::apic::set_timer_oneshot_us(amount);
}

/// Terminate the calling thread. Never returns.
pub fn exit_thread(status: i32) -> ! {
    let current = cpu::current_thread();
    current.exited.store(true, Ordering::SeqCst);
    current.publish_exit(status);

    let _irq = IrqGuard::new();
    let cpu = cpu::current_cpu();
    current.set_status(Status::Blocked);
    crate::apic::stop_timer();
    unsafe {
        update_schedule(cpu);
        enable_preemption(cpu);
        do_schedule(cpu);
    }
    unreachable!("exited thread was rescheduled");
}

/// Terminate the calling process. Never returns.
pub fn exit_process(status: i32) -> ! {
    let current = cpu::current_thread();
    current.process.kill(status);
    wake_process_threads(&current.process);
    exit_thread(status);
}

/// Kill the calling process from a fault path with `signal`. Never
/// returns.
pub fn kill_current_process(signal: u32) -> ! {
    exit_process(128 + signal as i32);
}

/// Kill another process: mark it and kick all of its threads awake so
/// they observe the flag at their next scheduling decision.
pub fn kill_process(process: &Arc<Process>, status: i32) {
    process.kill(status);
    wake_process_threads(process);
}

fn wake_process_threads(process: &Arc<Process>) {
    let threads: alloc::vec::Vec<_> = process.threads.lock().clone();
    let self_ptr = cpu::try_current_thread().map(|t| t as *const Thread);
    for thread in threads {
        if Some(Arc::as_ptr(&thread)) == self_ptr {
            continue;
        }
        unblock(&thread, true);
    }
}

/// The timer tick: called from the naked entry with every GPR spilled.
///
/// Runs the scheduling decision inline (after EOI, interrupts stay
/// disabled) and delivers pending signals when the interrupted context
/// is user mode.
pub(crate) extern "sysv64" fn timer_interrupt_handler(
    gprs: *mut SavedGprs,
    frame: *mut TrapFrame,
) {
    let frame_ref = unsafe { &*frame };
    crate::random::add_irq_entropy(
        crate::apic::TIMER_VECTOR,
        frame_ref.rip,
        frame_ref.rsp,
    );
    crate::apic::eoi();

    let cpu = cpu::current_cpu();
    unsafe {
        update_schedule(cpu);
        enable_preemption(cpu);
        do_schedule(cpu);
    }

    // Back on this thread (possibly much later): deliver signals on the
    // way out to user mode.
    let frame = unsafe { &mut *frame };
    if frame.cs & 3 == 3 {
        signal::deliver_on_trap(unsafe { &mut *gprs }, frame);
    }
}
