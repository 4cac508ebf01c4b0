//! Per-CPU state.
//!
//! Each CPU owns a `Cpu` block (runqueues, deferred work, current
//! thread) looked up through its LAPIC ID, so neither interrupt
//! handlers nor the syscall entry depend on segment bases; the entry
//! asm finds the current kernel stack through `syscall::gdt`.
//!
//! The boot CPU is brought online here; the MADT adds a slot for every
//! other LAPIC so cross-CPU paths (IPIs, TLB shootdown, per-CPU
//! queues) stay real even when only one CPU runs.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use spinning_top::{RwSpinlock, Spinlock};
use x86_64::VirtAddr;

use crate::sched::Scheduler;
use crate::sched::thread::Thread;
use crate::small_fn::SmallFn;

/// IPI vector for remote TLB invalidation.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xfc;
/// IPI vector telling a CPU to halt (shutdown path).
pub const HALT_VECTOR: u8 = 0xfb;

const DEFERRED_CAPACITY: usize = 32;

/// Fixed-capacity queue of deferred work items, drained at the tail of
/// each IRQ dispatch before the EOI return. Capacity-bounded so IRQ
/// handlers never touch the heap.
pub struct DeferredQueue {
    items: [Option<SmallFn>; DEFERRED_CAPACITY],
    head: usize,
    len: usize,
}

impl DeferredQueue {
    const fn new() -> Self {
        Self {
            items: [const { None }; DEFERRED_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    /// Queue an item. Returns false when full; the work must be
    /// idempotent against a later retrigger.
    pub fn push(&mut self, item: SmallFn) -> bool {
        if self.len == DEFERRED_CAPACITY {
            return false;
        }
        let slot = (self.head + self.len) % DEFERRED_CAPACITY;
        self.items[slot] = Some(item);
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<SmallFn> {
        if self.len == 0 {
            return None;
        }
        let item = self.items[self.head].take();
        self.head = (self.head + 1) % DEFERRED_CAPACITY;
        self.len -= 1;
        item
    }
}

/// One CPU's kernel state.
pub struct Cpu {
    pub id: usize,
    pub apic_id: u32,
    pub online: AtomicBool,
    pub scheduler: Scheduler,
    pub deferred_work: Spinlock<DeferredQueue>,
    pub thread_count: AtomicUsize,
    current: AtomicPtr<Thread>,
}

impl Cpu {
    /// The thread currently running on this CPU, null before the
    /// scheduler starts.
    pub fn current_thread_ptr(&self) -> *mut Thread {
        self.current.load(Ordering::Relaxed)
    }

    /// Install `thread` as this CPU's current thread and publish its
    /// kernel stack top to the syscall entry path and the TSS.
    ///
    /// # Safety
    /// Must be called with interrupts disabled, from the scheduler only.
    pub unsafe fn set_current_thread(&self, thread: *mut Thread) {
        self.current.store(thread, Ordering::Relaxed);
        if !thread.is_null() {
            let top = unsafe { (*thread).kernel_stack_top() };
            crate::syscall::gdt::set_kernel_stack(top);
        }
    }
}

static CPUS: RwSpinlock<Vec<&'static Cpu>> = RwSpinlock::new(Vec::new());

/// Bring the boot CPU online.
pub fn init_bsp(apic_id: u32) {
    let cpu = register_cpu(apic_id);
    cpu.online.store(true, Ordering::SeqCst);
}

/// Record a CPU slot for a LAPIC listed in the MADT.
pub fn register_cpu(apic_id: u32) -> &'static Cpu {
    let mut cpus = CPUS.write();
    let cpu = Box::leak(Box::new(Cpu {
        id: cpus.len(),
        apic_id,
        online: AtomicBool::new(false),
        scheduler: Scheduler::new(),
        deferred_work: Spinlock::new(DeferredQueue::new()),
        thread_count: AtomicUsize::new(0),
        current: AtomicPtr::new(core::ptr::null_mut()),
    }));
    cpus.push(cpu);
    cpu
}

/// The CPU this code is running on, `None` before `init_bsp`.
pub fn try_current_cpu() -> Option<&'static Cpu> {
    let cpus = CPUS.read();
    if cpus.is_empty() {
        return None;
    }
    if cpus.len() == 1 || !crate::apic::is_ready() {
        return Some(cpus[0]);
    }
    let apic_id = crate::apic::current_lapic_id();
    Some(
        cpus.iter()
            .find(|cpu| cpu.apic_id == apic_id)
            .copied()
            .unwrap_or(cpus[0]),
    )
}

/// The CPU this code is running on.
///
/// # Panics
/// Panics before `init_bsp` has run.
pub fn current_cpu() -> &'static Cpu {
    try_current_cpu().expect("cpu::init_bsp has run")
}

/// The thread currently running on this CPU, if the scheduler has
/// started.
pub fn try_current_thread() -> Option<&'static Thread> {
    let ptr = current_cpu().current_thread_ptr();
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { &*ptr })
}

/// The thread currently running on this CPU.
///
/// # Panics
/// Panics before the scheduler has installed a current thread.
pub fn current_thread() -> &'static Thread {
    try_current_thread().expect("scheduler has installed a current thread")
}

/// All registered CPUs.
pub fn for_each_cpu(mut f: impl FnMut(&'static Cpu)) {
    for cpu in CPUS.read().iter() {
        f(cpu);
    }
}

/// Number of CPUs known (online or not).
pub fn cpu_count() -> usize {
    CPUS.read().len()
}

/// The least-loaded online CPU, used for placing new threads.
pub fn pick_cpu() -> &'static Cpu {
    let cpus = CPUS.read();
    cpus.iter()
        .filter(|cpu| cpu.online.load(Ordering::Relaxed))
        .min_by_key(|cpu| cpu.thread_count.load(Ordering::Relaxed))
        .copied()
        .expect("at least the boot CPU is online")
}

/// Invalidate `_virt` on every other online CPU.
///
/// Fire-and-forget: remote CPUs do a full flush on receipt, so no
/// acknowledgment round is needed and this is safe to call with any
/// lock held.
pub fn tlb_shootdown(_virt: VirtAddr) {
    if !crate::apic::is_ready() {
        return;
    }
    let cpus = CPUS.read();
    if cpus.len() < 2 {
        return;
    }
    let self_id = crate::apic::current_lapic_id();
    for cpu in cpus.iter() {
        if cpu.apic_id != self_id && cpu.online.load(Ordering::Relaxed) {
            crate::apic::send_ipi(cpu.apic_id, TLB_SHOOTDOWN_VECTOR);
        }
    }
}
