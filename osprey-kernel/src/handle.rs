//! Per-process handle tables.
//!
//! A handle is an index into a resizable vector of typed, shared
//! kernel objects. Freed slots carry the FREED bit (the top bit of the
//! stored marker, never visible to userspace) and go on a freelist for
//! reissue. `get` clones the object's shared reference; `remove` drops
//! the table's reference and the object dies with its last holder.

use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::{Handle, SysError, SysResult};
use spinning_top::Spinlock;

use crate::devices::DeviceHandle;
use crate::evm::{Evm, VirtualCpu};
use crate::memory::shared::SharedMemory;
use crate::sched::process::ProcessDescriptor;
use crate::sched::signal::SignalStack;
use crate::sched::thread::ThreadDescriptor;
use crate::socket::Socket;
use crate::vfs::OpenFile;

/// The kinds of objects a handle can name.
#[derive(Clone)]
pub enum Object {
    OpenFile(Arc<OpenFile>),
    Socket(Arc<dyn Socket>),
    SharedMemory(Arc<SharedMemory>),
    Device(Arc<DeviceHandle>),
    ProcessDescriptor(Arc<ProcessDescriptor>),
    ThreadDescriptor(Arc<ThreadDescriptor>),
    SignalStack(Arc<SignalStack>),
    Evm(Arc<Evm>),
    VirtualCpu(Arc<VirtualCpu>),
}

enum Slot {
    Used(Object),
    /// On the freelist; the marker keeps accidental reuse loud.
    Freed,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

pub struct HandleTable {
    inner: Spinlock<Inner>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            inner: Spinlock::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Insert an object, reusing a freed slot when one exists.
    pub fn insert(&self, object: Object) -> Handle {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            debug_assert!(
                matches!(inner.slots[index], Slot::Freed),
                "freelist entry not marked freed"
            );
            inner.slots[index] = Slot::Used(object);
            index
        } else {
            inner.slots.push(Slot::Used(object));
            inner.slots.len() - 1
        }
    }

    /// Clone the object behind `handle`.
    pub fn get(&self, handle: Handle) -> SysResult<Object> {
        let inner = self.inner.lock();
        match inner.slots.get(handle) {
            Some(Slot::Used(object)) => Ok(object.clone()),
            _ => Err(SysError::InvalidArgument),
        }
    }

    /// Drop the table's reference and recycle the slot.
    pub fn remove(&self, handle: Handle) -> SysResult<Object> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(handle) {
            Some(slot @ Slot::Used(_)) => {
                let Slot::Used(object) = core::mem::replace(slot, Slot::Freed) else {
                    unreachable!()
                };
                inner.free.push(handle);
                Ok(object)
            }
            _ => Err(SysError::InvalidArgument),
        }
    }

    /// Replace the object in `handle` (the standard-handle slots).
    pub fn replace(&self, handle: Handle, object: Object) -> SysResult<()> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(handle) {
            Some(slot @ Slot::Used(_)) => {
                *slot = Slot::Used(object);
                Ok(())
            }
            _ => Err(SysError::InvalidArgument),
        }
    }

    /// Drop every object; used when a process is drained.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.free.clear();
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

// Typed accessors, one per object kind the syscall layer needs.
impl HandleTable {
    pub fn get_open_file(&self, handle: Handle) -> SysResult<Arc<OpenFile>> {
        match self.get(handle)? {
            Object::OpenFile(file) => Ok(file),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_socket(&self, handle: Handle) -> SysResult<Arc<dyn Socket>> {
        match self.get(handle)? {
            Object::Socket(socket) => Ok(socket),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_shared_memory(&self, handle: Handle) -> SysResult<Arc<SharedMemory>> {
        match self.get(handle)? {
            Object::SharedMemory(mem) => Ok(mem),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_device(&self, handle: Handle) -> SysResult<Arc<DeviceHandle>> {
        match self.get(handle)? {
            Object::Device(device) => Ok(device),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_process_descriptor(&self, handle: Handle) -> SysResult<Arc<ProcessDescriptor>> {
        match self.get(handle)? {
            Object::ProcessDescriptor(descriptor) => Ok(descriptor),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_thread_descriptor(&self, handle: Handle) -> SysResult<Arc<ThreadDescriptor>> {
        match self.get(handle)? {
            Object::ThreadDescriptor(descriptor) => Ok(descriptor),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_evm(&self, handle: Handle) -> SysResult<Arc<Evm>> {
        match self.get(handle)? {
            Object::Evm(evm) => Ok(evm),
            _ => Err(SysError::InvalidArgument),
        }
    }

    pub fn get_vcpu(&self, handle: Handle) -> SysResult<Arc<VirtualCpu>> {
        match self.get(handle)? {
            Object::VirtualCpu(vcpu) => Ok(vcpu),
            _ => Err(SysError::InvalidArgument),
        }
    }
}
