//! The services registry.
//!
//! A process publishes itself as a service with a set of feature
//! strings; lookers-up name the features they need and receive a
//! descriptor of a process advertising all of them, which they can then
//! connect an IPC socket to.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;

use crate::sched::process::{Process, ProcessDescriptor};

struct Service {
    features: Vec<String>,
    process: Weak<Process>,
}

static SERVICES: Spinlock<Vec<Service>> = Spinlock::new(Vec::new());

/// Publish the calling process under `features`.
pub fn create(process: &Arc<Process>, features: Vec<String>) -> SysResult<()> {
    if features.is_empty() {
        return Err(SysError::InvalidArgument);
    }
    let mut services = SERVICES.lock();
    // Collect entries whose processes have exited while we are here.
    services.retain(|s| s.process.upgrade().is_some());
    if services
        .iter()
        .any(|s| core::ptr::eq(s.process.as_ptr(), Arc::as_ptr(process)))
    {
        return Err(SysError::AlreadyExists);
    }
    services.push(Service {
        features,
        process: Arc::downgrade(process),
    });
    Ok(())
}

/// Find a service advertising every needed feature; returns a fresh
/// descriptor of it.
pub fn get(needed: &[String]) -> SysResult<Arc<ProcessDescriptor>> {
    if needed.is_empty() {
        return Err(SysError::InvalidArgument);
    }
    let services = SERVICES.lock();
    for service in services.iter() {
        if needed
            .iter()
            .all(|need| service.features.iter().any(|f| f == need))
            && let Some(process) = service.process.upgrade()
        {
            return Ok(ProcessDescriptor::new(&process));
        }
    }
    Err(SysError::NotExists)
}
