//! Kernel threads.
//!
//! A `Thread` owns its kernel stack and saved register state, belongs
//! to exactly one `Process`, and sits on at most one scheduler list at
//! a time (a run queue, the sleep list, or the destroy list), so one
//! pair of intrusive links suffices. List membership transfers the
//! reference count: a queue holds exactly one `Arc` per thread it
//! contains.
//!
//! Status transitions are guarded by the owning CPU's level-queue
//! locks, except `unblock`, which takes the thread's move lock so a
//! waker racing with the sleeping CPU cannot double-queue the thread.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spinning_top::Spinlock;
use x86_64::VirtAddr;

use super::context::Context;
use super::process::Process;
use crate::cpu::Cpu;
use crate::memory::page_map::MapFlags;
use crate::memory::{PAGE_SIZE, kernel_map, kernel_vmem, pmalloc};

/// Kernel stack size per thread.
const KERNEL_STACK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Running,
    Blocked,
    Sleeping,
}

/// What a fresh thread runs when first scheduled.
pub enum ThreadEntry {
    Kernel(Box<dyn FnOnce() + Send>),
    User {
        ip: VirtAddr,
        sp: VirtAddr,
        arg: u64,
    },
}

/// A mapped kernel stack with an unmapped guard page below it.
pub struct KernelStack {
    base: usize,
}

impl KernelStack {
    fn new() -> KernelStack {
        // One extra page of address space at the bottom stays unmapped.
        let reserve = KERNEL_STACK_SIZE + PAGE_SIZE;
        let base = kernel_vmem().xalloc(reserve, 0, 0);
        assert!(base != 0, "out of kernel address space for stacks");

        let map = kernel_map();
        for offset in (PAGE_SIZE..reserve).step_by(PAGE_SIZE) {
            let phys = pmalloc::pmalloc(1);
            assert!(phys != 0, "out of memory for kernel stacks");
            map.map(
                VirtAddr::new((base + offset) as u64),
                x86_64::PhysAddr::new(phys as u64),
                MapFlags::kernel_rw(),
            );
        }
        KernelStack { base }
    }

    pub fn top(&self) -> VirtAddr {
        VirtAddr::new((self.base + KERNEL_STACK_SIZE + PAGE_SIZE) as u64)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let reserve = KERNEL_STACK_SIZE + PAGE_SIZE;
        let map = kernel_map();
        for offset in (PAGE_SIZE..reserve).step_by(PAGE_SIZE) {
            if let Some(phys) = map.unmap(VirtAddr::new((self.base + offset) as u64)) {
                pmalloc::pfree(phys.as_u64() as usize, 1);
            }
        }
        drop(map);
        kernel_vmem().xfree(self.base, reserve);
    }
}

/// Intrusive list links; owned by whichever queue the thread is on.
pub(super) struct ThreadLink {
    pub prev: *mut Thread,
    pub next: *mut Thread,
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

pub struct Thread {
    pub name: String,
    pub id: u32,
    pub process: Arc<Process>,
    pub cpu: &'static Cpu,

    // Scheduling state.
    pub level_index: AtomicUsize,
    pub status: Spinlock<Status>,
    pub pin_level: AtomicBool,
    pub pin_cpu: AtomicBool,
    pub exited: AtomicBool,
    /// Absolute wake deadline in microseconds while Sleeping.
    pub sleep_end_us: AtomicU64,
    /// Set by a timeout wake so the waiter can tell timeout from signal.
    pub sleep_interrupted: AtomicBool,
    /// An unblock arrived before the thread finished blocking; the
    /// block call consumes it and returns immediately.
    pub unblock_pending: AtomicBool,
    /// Serializes unblock against the owning CPU's scheduling.
    pub move_lock: Spinlock<()>,

    // Saved register state; only the owning CPU touches it, during
    // context switch with interrupts disabled.
    pub(super) context: UnsafeCell<Context>,
    pub(super) entry: Spinlock<Option<ThreadEntry>>,
    kernel_stack: KernelStack,
    pub(super) link: UnsafeCell<ThreadLink>,

    // User-mode segment bases, restored on switch-in.
    pub fs_base: AtomicU64,
    pub gs_base: AtomicU64,

    // Signals.
    pub signal_mask: AtomicU64,
    pub pending_signals: AtomicU64,
    /// Saved interrupt context while a signal handler runs.
    pub signal_context: Spinlock<Option<super::signal::SavedUserContext>>,

    pub descriptors: Spinlock<alloc::vec::Vec<Arc<ThreadDescriptor>>>,
}

// Safety: the raw link/context cells are only touched under the
// scheduler's locks with interrupts disabled.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn new(name: &str, cpu: &'static Cpu, process: Arc<Process>, entry: ThreadEntry) -> Arc<Thread> {
        let kernel_stack = KernelStack::new();
        let context = Context::fresh(kernel_stack.top());
        let thread = Arc::new(Thread {
            name: String::from(name),
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            process: process.clone(),
            cpu,
            level_index: AtomicUsize::new(0),
            status: Spinlock::new(Status::Waiting),
            pin_level: AtomicBool::new(false),
            pin_cpu: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            sleep_end_us: AtomicU64::new(0),
            sleep_interrupted: AtomicBool::new(false),
            unblock_pending: AtomicBool::new(false),
            move_lock: Spinlock::new(()),
            context: UnsafeCell::new(context),
            entry: Spinlock::new(Some(entry)),
            kernel_stack,
            link: UnsafeCell::new(ThreadLink {
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
            }),
            fs_base: AtomicU64::new(0),
            gs_base: AtomicU64::new(0),
            signal_mask: AtomicU64::new(0),
            pending_signals: AtomicU64::new(0),
            signal_context: Spinlock::new(None),
            descriptors: Spinlock::new(alloc::vec::Vec::new()),
        });
        process.add_thread(&thread);
        thread
    }

    pub fn kernel_stack_top(&self) -> VirtAddr {
        self.kernel_stack.top()
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    pub fn add_descriptor(&self, descriptor: &Arc<ThreadDescriptor>) {
        self.descriptors.lock().push(descriptor.clone());
    }

    /// Publish `status` to every descriptor and clear their back
    /// references. Called exactly once, from the exit path.
    pub fn publish_exit(&self, status: i32) {
        let descriptors = core::mem::take(&mut *self.descriptors.lock());
        for descriptor in descriptors {
            descriptor.exit_status.store(status, Ordering::SeqCst);
            descriptor.exited.store(true, Ordering::SeqCst);
            *descriptor.thread.lock() = None;
            descriptor.exit_event.signal_all();
        }
    }
}

/// A reference-counted reaper token for a thread.
///
/// Holds the target alive until the target exits, at which point the
/// back reference is atomically cleared and the exit status published.
pub struct ThreadDescriptor {
    pub thread: Spinlock<Option<Arc<Thread>>>,
    pub exit_status: AtomicI32,
    pub exited: AtomicBool,
    pub exit_event: super::event::Event,
}

impl ThreadDescriptor {
    pub fn new(thread: &Arc<Thread>) -> Arc<ThreadDescriptor> {
        let descriptor = Arc::new(ThreadDescriptor {
            thread: Spinlock::new(Some(thread.clone())),
            exit_status: AtomicI32::new(0),
            exited: AtomicBool::new(false),
            exit_event: super::event::Event::new(),
        });
        thread.add_descriptor(&descriptor);
        descriptor
    }
}

/// An intrusive FIFO of threads. Each entry holds one `Arc` reference,
/// transferred in on push and out on pop. Callers provide locking.
pub struct ThreadQueue {
    head: *mut Thread,
    tail: *mut Thread,
    len: usize,
}

// Safety: queues are always wrapped in a Spinlock by their owners.
unsafe impl Send for ThreadQueue {}

impl ThreadQueue {
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push_back(&mut self, thread: Arc<Thread>) {
        let raw = Arc::into_raw(thread) as *mut Thread;
        unsafe {
            let link = &mut *(*raw).link.get();
            link.next = core::ptr::null_mut();
            link.prev = self.tail;
            if self.tail.is_null() {
                self.head = raw;
            } else {
                (*(*self.tail).link.get()).next = raw;
            }
            self.tail = raw;
        }
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<Arc<Thread>> {
        if self.head.is_null() {
            return None;
        }
        let raw = self.head;
        unsafe {
            let link = &mut *(*raw).link.get();
            self.head = link.next;
            if self.head.is_null() {
                self.tail = core::ptr::null_mut();
            } else {
                (*(*self.head).link.get()).prev = core::ptr::null_mut();
            }
            link.next = core::ptr::null_mut();
            link.prev = core::ptr::null_mut();
            self.len -= 1;
            Some(Arc::from_raw(raw))
        }
    }

    /// Unlink `thread` if it is on this queue, returning its reference.
    ///
    /// # Safety
    /// The caller must know the thread is on this queue (its status
    /// says so, and the queue's lock is held).
    pub unsafe fn remove(&mut self, thread: &Thread) -> Option<Arc<Thread>> {
        let raw = thread as *const Thread as *mut Thread;
        // Verify membership by walking from the head; the lists are
        // short and this is a slow path (timeout cancel).
        let mut cursor = self.head;
        while !cursor.is_null() && cursor != raw {
            cursor = unsafe { (*(*cursor).link.get()).next };
        }
        if cursor.is_null() {
            return None;
        }
        unsafe {
            let link = &mut *(*raw).link.get();
            if link.prev.is_null() {
                self.head = link.next;
            } else {
                (*(*link.prev).link.get()).next = link.next;
            }
            if link.next.is_null() {
                self.tail = link.prev;
            } else {
                (*(*link.next).link.get()).prev = link.prev;
            }
            link.prev = core::ptr::null_mut();
            link.next = core::ptr::null_mut();
            self.len -= 1;
            Some(Arc::from_raw(raw))
        }
    }

    /// Insert `thread` before `at` (or at the back when `at` is null),
    /// used by the deadline-ordered sleep list.
    pub fn insert_before(&mut self, at: *mut Thread, thread: Arc<Thread>) {
        if at.is_null() {
            self.push_back(thread);
            return;
        }
        let raw = Arc::into_raw(thread) as *mut Thread;
        unsafe {
            let at_link = &mut *(*at).link.get();
            let link = &mut *(*raw).link.get();
            link.next = at;
            link.prev = at_link.prev;
            if at_link.prev.is_null() {
                self.head = raw;
            } else {
                (*(*at_link.prev).link.get()).next = raw;
            }
            at_link.prev = raw;
        }
        self.len += 1;
    }

    /// Walk entries front to back without consuming them.
    pub fn iter(&self) -> ThreadQueueIter<'_> {
        ThreadQueueIter {
            cursor: self.head,
            _queue: self,
        }
    }
}

pub struct ThreadQueueIter<'a> {
    cursor: *mut Thread,
    _queue: &'a ThreadQueue,
}

impl<'a> Iterator for ThreadQueueIter<'a> {
    type Item = &'a Thread;

    fn next(&mut self) -> Option<&'a Thread> {
        if self.cursor.is_null() {
            return None;
        }
        let item = unsafe { &*self.cursor };
        self.cursor = unsafe { (*item.link.get()).next };
        Some(item)
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}
