//! Processes.
//!
//! A process owns its page map, handle table, thread list, memory
//! mappings, signal dispositions, futex table and an optional IPC
//! listening endpoint. It is destroyed only by its own threads (the
//! last one to be reaped drops the final `Arc` from the thread side) or
//! by a reaper; descriptors keep the control block addressable until
//! the exit status is published.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use spinning_top::Spinlock;
use x86_64::VirtAddr;

use super::event::Event;
use super::futex::FutexTable;
use super::signal::SignalDispositions;
use super::thread::Thread;
use crate::handle::HandleTable;
use crate::memory::page_map::USER_BASE;
use crate::memory::{Mapping, PAGE_SIZE, PageMap, align_up};

/// Where anonymous `Map` allocations start; ELF images load below this.
const MMAP_BASE: u64 = USER_BASE + 0x40_0000_0000;

static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

pub struct Process {
    pub name: String,
    pub id: u32,
    pub page_map: PageMap,
    pub handles: HandleTable,
    pub threads: Spinlock<Vec<Arc<Thread>>>,
    pub mappings: Spinlock<Vec<Mapping>>,
    mmap_cursor: AtomicU64,
    pub killed: AtomicBool,
    pub exit_status: AtomicI32,
    pub signals: SignalDispositions,
    pub futexes: FutexTable,
    pub descriptors: Spinlock<Vec<Arc<ProcessDescriptor>>>,
    /// Listening IPC socket other processes connect to by descriptor.
    pub ipc_endpoint: Spinlock<Option<Arc<crate::socket::ipc::IpcSocket>>>,
}

impl Process {
    pub fn new(name: &str) -> Arc<Process> {
        Arc::new(Process {
            name: String::from(name),
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            page_map: PageMap::new_user(),
            handles: HandleTable::new(),
            threads: Spinlock::new(Vec::new()),
            mappings: Spinlock::new(Vec::new()),
            mmap_cursor: AtomicU64::new(MMAP_BASE),
            killed: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            signals: SignalDispositions::new(),
            futexes: FutexTable::new(),
            descriptors: Spinlock::new(Vec::new()),
            ipc_endpoint: Spinlock::new(None),
        })
    }

    pub fn add_thread(&self, thread: &Arc<Thread>) {
        self.threads.lock().push(thread.clone());
    }

    /// Drop `thread` from the thread list; returns true when it was the
    /// last one.
    pub fn remove_thread(&self, thread: &Thread) -> bool {
        let mut threads = self.threads.lock();
        threads.retain(|t| t.id != thread.id);
        threads.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Reserve address space for an anonymous mapping.
    pub fn alloc_user_range(&self, size: usize) -> VirtAddr {
        let bytes = align_up(size, PAGE_SIZE) as u64;
        // One guard page between allocations.
        let base = self
            .mmap_cursor
            .fetch_add(bytes + PAGE_SIZE as u64, Ordering::SeqCst);
        VirtAddr::new(base)
    }

    pub fn add_mapping(&self, mapping: Mapping) {
        self.mappings.lock().push(mapping);
    }

    /// Unmap and free the mapping starting at `base`.
    pub fn remove_mapping(&self, base: VirtAddr) -> bool {
        let mut mappings = self.mappings.lock();
        if let Some(index) = mappings.iter().position(|m| m.base() == base) {
            let mapping = mappings.swap_remove(index);
            drop(mappings);
            mapping.destroy(&self.page_map);
            true
        } else {
            false
        }
    }

    /// Mark the process killed; its threads observe this at their next
    /// scheduling decision and exit.
    pub fn kill(&self, status: i32) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit_status.store(status, Ordering::SeqCst);
    }

    /// Publish the exit status to every descriptor and clear their back
    /// references. Runs once, when the last thread is reaped.
    pub fn publish_exit(&self) {
        let status = self.exit_status.load(Ordering::SeqCst);
        let descriptors = core::mem::take(&mut *self.descriptors.lock());
        for descriptor in descriptors {
            descriptor.exit_status.store(status, Ordering::SeqCst);
            descriptor.exited.store(true, Ordering::SeqCst);
            *descriptor.process.lock() = None;
            descriptor.exit_event.signal_all();
        }
    }

    /// Release everything user-visible: mappings, handles. The address
    /// space itself goes when the `Arc` does.
    pub fn drain(&self) {
        let mappings = core::mem::take(&mut *self.mappings.lock());
        for mapping in mappings {
            mapping.destroy(&self.page_map);
        }
        self.handles.clear();
        *self.ipc_endpoint.lock() = None;
    }
}

/// A reference-counted reaper token for a process.
pub struct ProcessDescriptor {
    pub process: Spinlock<Option<Arc<Process>>>,
    pub exit_status: AtomicI32,
    pub exited: AtomicBool,
    pub exit_event: Event,
}

impl ProcessDescriptor {
    pub fn new(process: &Arc<Process>) -> Arc<ProcessDescriptor> {
        let descriptor = Arc::new(ProcessDescriptor {
            process: Spinlock::new(Some(process.clone())),
            exit_status: AtomicI32::new(0),
            exited: AtomicBool::new(false),
            exit_event: Event::new(),
        });
        process.descriptors.lock().push(descriptor.clone());
        descriptor
    }

    /// The live process behind this descriptor, if it has not exited.
    pub fn get(&self) -> Option<Arc<Process>> {
        self.process.lock().clone()
    }
}
