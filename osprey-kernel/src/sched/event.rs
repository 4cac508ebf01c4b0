//! Blocking events.
//!
//! An `Event` pairs a signalled count with a waiter list. Waiter nodes
//! live on the blocking thread's kernel stack, so signalling from
//! interrupt context never allocates. `wait_any` registers one node per
//! event and blocks once.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use spinning_top::Spinlock;

use super::thread::Thread;
use crate::irq_guard::IrqGuard;

/// A waiter registration, stack-allocated by the blocked thread.
struct Waitable {
    thread: *const Thread,
    prev: *mut Waitable,
    next: *mut Waitable,
    /// Cleared by the signaller when it takes this waiter.
    in_list: bool,
}

struct WaitList {
    head: *mut Waitable,
    tail: *mut Waitable,
}

// Safety: nodes are only touched under the event lock.
unsafe impl Send for WaitList {}

impl WaitList {
    const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    unsafe fn push(&mut self, node: *mut Waitable) {
        unsafe {
            (*node).next = core::ptr::null_mut();
            (*node).prev = self.tail;
            (*node).in_list = true;
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
            self.tail = node;
        }
    }

    unsafe fn remove(&mut self, node: *mut Waitable) {
        unsafe {
            if !(*node).in_list {
                return;
            }
            if (*node).prev.is_null() {
                self.head = (*node).next;
            } else {
                (*(*node).prev).next = (*node).next;
            }
            if (*node).next.is_null() {
                self.tail = (*node).prev;
            } else {
                (*(*node).next).prev = (*node).prev;
            }
            (*node).in_list = false;
        }
    }

    unsafe fn pop(&mut self) -> Option<*mut Waitable> {
        if self.head.is_null() {
            return None;
        }
        let node = self.head;
        unsafe {
            self.remove(node);
        }
        Some(node)
    }
}

struct EventInner {
    waiters: WaitList,
    signaled: usize,
}

/// A multi-waiter event with a saturating signalled count.
pub struct Event {
    inner: Spinlock<EventInner>,
}

impl Event {
    pub const fn new() -> Event {
        Event {
            inner: Spinlock::new(EventInner {
                waiters: WaitList::new(),
                signaled: 0,
            }),
        }
    }

    /// Drop any pending signals.
    pub fn reset(&self) {
        let _irq = IrqGuard::new();
        self.inner.lock().signaled = 0;
    }

    pub fn is_pending(&self) -> bool {
        let _irq = IrqGuard::new();
        self.inner.lock().signaled > 0
    }

    pub fn is_being_waited(&self) -> bool {
        let _irq = IrqGuard::new();
        !self.inner.lock().waiters.is_empty()
    }

    /// Block until the event is signalled, consuming one signal. A
    /// thread whose process was killed while it waited exits here
    /// instead of re-blocking, with its registration removed.
    pub fn wait(&self) {
        let current = crate::cpu::current_thread();
        loop {
            let _irq = IrqGuard::new();
            let mut node = Waitable {
                thread: current,
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
                in_list: false,
            };
            {
                let mut inner = self.inner.lock();
                if inner.signaled > 0 {
                    inner.signaled -= 1;
                    return;
                }
                unsafe {
                    inner.waiters.push(&mut node);
                }
            }

            super::block();

            let mut inner = self.inner.lock();
            if node.in_list {
                unsafe {
                    inner.waiters.remove(&mut node);
                }
                drop(inner);
                if current.process.killed.load(Ordering::SeqCst)
                    || current.exited.load(Ordering::SeqCst)
                {
                    super::exit_current_on_kill(current);
                }
                // Spurious wake; retry.
                continue;
            }
            if inner.signaled > 0 {
                inner.signaled -= 1;
            }
            return;
        }
    }

    /// Block until signalled or `max_us` elapses. Returns false on
    /// timeout.
    pub fn wait_with_timeout(&self, max_us: u64) -> bool {
        let current = crate::cpu::current_thread();

        let _irq = IrqGuard::new();
        let mut node = Waitable {
            thread: current,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            in_list: false,
        };
        {
            let mut inner = self.inner.lock();
            if inner.signaled > 0 {
                inner.signaled -= 1;
                return true;
            }
            unsafe {
                inner.waiters.push(&mut node);
            }
        }

        super::sleep_us(max_us);

        let mut inner = self.inner.lock();
        let result = if node.in_list {
            unsafe {
                inner.waiters.remove(&mut node);
            }
            false
        } else {
            if inner.signaled > 0 {
                inner.signaled -= 1;
            }
            true
        };
        drop(inner);
        if current.process.killed.load(Ordering::SeqCst) {
            super::exit_current_on_kill(current);
        }
        result
    }

    /// Block on up to `events.len()` events at once. Returns the index
    /// of a signalled event, or `None` when `max_us` elapses first.
    /// `max_us == 0` waits forever.
    pub fn wait_any(events: &[&Event], max_us: u64) -> Option<usize> {
        const MAX_WAIT: usize = 16;
        assert!(events.len() <= MAX_WAIT, "too many events for wait_any");

        let current = crate::cpu::current_thread();
        let _irq = IrqGuard::new();

        let mut nodes: [Waitable; MAX_WAIT] = core::array::from_fn(|_| Waitable {
            thread: current,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            in_list: false,
        });

        // Register on each event, consuming a signal immediately if one
        // is already pending.
        let mut registered = 0;
        let mut ready = None;
        for (i, event) in events.iter().enumerate() {
            let mut inner = event.inner.lock();
            if inner.signaled > 0 {
                inner.signaled -= 1;
                ready = Some(i);
                break;
            }
            unsafe {
                inner.waiters.push(&mut nodes[i]);
            }
            registered = i + 1;
        }
        if let Some(i) = ready {
            for (j, event) in events.iter().enumerate().take(registered) {
                let mut inner = event.inner.lock();
                if nodes[j].in_list {
                    unsafe {
                        inner.waiters.remove(&mut nodes[j]);
                    }
                }
            }
            return Some(i);
        }

        if max_us == 0 {
            super::block();
        } else {
            super::sleep_us(max_us);
        }

        // Deregister everywhere and find who woke us.
        let mut woken = None;
        for (i, event) in events.iter().enumerate() {
            let mut inner = event.inner.lock();
            if nodes[i].in_list {
                unsafe {
                    inner.waiters.remove(&mut nodes[i]);
                }
            } else if woken.is_none() {
                if inner.signaled > 0 {
                    inner.signaled -= 1;
                }
                woken = Some(i);
            }
        }
        if current.process.killed.load(Ordering::SeqCst) {
            super::exit_current_on_kill(current);
        }
        woken
    }

    /// Record `count` signals and wake that many waiters.
    pub fn signal_count(&self, count: usize) {
        let _irq = IrqGuard::new();
        let mut inner = self.inner.lock();
        inner.signaled = inner.signaled.saturating_add(count);
        for _ in 0..count {
            let Some(node) = (unsafe { inner.waiters.pop() }) else {
                break;
            };
            wake_node(node);
        }
    }

    pub fn signal_one(&self) {
        self.signal_count(1);
    }

    /// Signal only if no signal is already pending; keeps edge-style
    /// producers from accumulating counts nobody will consume.
    pub fn signal_one_if_not_pending(&self) {
        let _irq = IrqGuard::new();
        let mut inner = self.inner.lock();
        if inner.signaled == 0 {
            inner.signaled += 1;
            if let Some(node) = unsafe { inner.waiters.pop() } {
                wake_node(node);
            }
        }
    }

    /// Wake every current waiter, leaving one pending signal behind.
    pub fn signal_all(&self) {
        let _irq = IrqGuard::new();
        let mut inner = self.inner.lock();
        inner.signaled = inner.signaled.saturating_add(1);
        while let Some(node) = unsafe { inner.waiters.pop() } {
            wake_node(node);
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

fn wake_node(node: *mut Waitable) {
    let thread = unsafe { (*node).thread };
    // The waiter is blocked (or about to block); its Arc is held by its
    // process's thread list, so reviving a counted reference is sound.
    let thread = unsafe {
        Arc::increment_strong_count(thread);
        Arc::from_raw(thread)
    };
    super::unblock(&thread, true);
}
