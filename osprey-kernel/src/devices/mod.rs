//! User-visible devices.
//!
//! Every device kind (framebuffer, gpu, sound) has its own registry.
//! Userspace enumerates a kind with `DevLink GetDevices`, opens one by
//! name to get a `DeviceHandle`, and drives it with kind-specific
//! `Specific` requests. The devlink syscall glue parses the envelope;
//! devices only see their own op payloads.

pub mod framebuffer;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::devlink::DeviceKind;
use osprey_abi::{SysError, SysResult};
use spinning_top::RwSpinlock;

use crate::sched::process::Process;

/// Call context for a `Specific` request.
pub struct DevlinkContext<'a> {
    pub process: &'a Arc<Process>,
}

/// A device exposed to userspace through devlink.
pub trait UserDevice: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Service one kind-specific request. `payload` is the request
    /// minus the devlink header; the response bytes (including their
    /// size prefix) go into `response`.
    fn specific(
        &self,
        ctx: &DevlinkContext<'_>,
        payload: &[u8],
        response: &mut Vec<u8>,
    ) -> SysResult<()>;
}

/// An opened device, as held in a handle table.
pub struct DeviceHandle {
    pub device: Arc<dyn UserDevice>,
}

static REGISTRIES: [RwSpinlock<Vec<Arc<dyn UserDevice>>>; DeviceKind::COUNT] =
    [const { RwSpinlock::new(Vec::new()) }; DeviceKind::COUNT];

/// Register a device under its kind.
pub fn register(device: Arc<dyn UserDevice>) {
    REGISTRIES[device.kind() as usize].write().push(device);
}

/// All devices of one kind.
pub fn of_kind(kind: DeviceKind) -> Vec<Arc<dyn UserDevice>> {
    REGISTRIES[kind as usize].read().clone()
}

/// Open a device by kind and name.
pub fn open(kind: DeviceKind, name: &str) -> SysResult<Arc<DeviceHandle>> {
    let registry = REGISTRIES[kind as usize].read();
    let device = registry
        .iter()
        .find(|device| device.name() == name)
        .cloned()
        .ok_or(SysError::NotExists)?;
    Ok(Arc::new(DeviceHandle { device }))
}

/// Names of every device of `kind`, for enumeration.
pub fn names_of_kind(kind: DeviceKind) -> Vec<String> {
    REGISTRIES[kind as usize]
        .read()
        .iter()
        .map(|device| String::from(device.name()))
        .collect()
}
