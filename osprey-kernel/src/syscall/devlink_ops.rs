//! The `Devlink` syscall: parse the envelope, dispatch to the device
//! registries, and marshal the response with its size prefix.

use alloc::vec::Vec;

use osprey_abi::devlink::{DevLink, DevLinkRequestHeader, DeviceKind};
use osprey_abi::{Handle, SysError, SysResult};

use super::Args;
use super::user::UserAccessor;
use crate::devices::{self, DevlinkContext};
use crate::handle::Object;
use crate::sched;

/// Largest request a device can be handed.
const MAX_REQUEST: usize = 4096;

/// User-supplied enums arrive as raw integers; discriminants are
/// validated before anything typed sees them.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawHeader {
    ty: u32,
    size: usize,
    handle: Handle,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawGetDevices {
    header: RawHeader,
    kind: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawOpenDevice {
    header: RawHeader,
    kind: u32,
    name: usize,
    name_len: usize,
}

const REQUEST_GET_DEVICES: u32 = 0;
const REQUEST_OPEN_DEVICE: u32 = 1;
const REQUEST_SPECIFIC: u32 = 2;

pub fn devlink(args: Args) -> SysResult<usize> {
    let link: DevLink = UserAccessor::new(args[0]).load_value()?;
    let header: RawHeader = UserAccessor::new(link.request as usize).load_value()?;

    if header.size < size_of::<DevLinkRequestHeader>() || header.size > MAX_REQUEST {
        return Err(SysError::InvalidArgument);
    }

    let mut response = Vec::new();
    match header.ty {
        REQUEST_GET_DEVICES => {
            let request: RawGetDevices = UserAccessor::new(link.request as usize).load_value()?;
            let kind = DeviceKind::from_raw(request.kind).ok_or(SysError::InvalidArgument)?;
            get_devices(kind, &mut response)?;
        }
        REQUEST_OPEN_DEVICE => {
            let request: RawOpenDevice = UserAccessor::new(link.request as usize).load_value()?;
            open_device(&request, &mut response)?;
        }
        REQUEST_SPECIFIC => {
            let process = sched::current_process();
            let device = process.handles.get_device(header.handle)?;

            let mut payload = alloc::vec![0u8; header.size - size_of::<DevLinkRequestHeader>()];
            UserAccessor::new(link.request as usize + size_of::<DevLinkRequestHeader>())
                .load(&mut payload)?;

            let ctx = DevlinkContext { process: &process };
            device.device.specific(&ctx, &payload, &mut response)?;
        }
        _ => return Err(SysError::InvalidArgument),
    }

    // Too-small buffers learn the needed size through the prefix.
    if response.len() > link.response_buf_size {
        let needed = response.len();
        if link.response_buf_size >= size_of::<usize>() {
            UserAccessor::new(link.response as usize).store_value(&needed)?;
        }
        return Err(SysError::BufferTooSmall);
    }

    UserAccessor::new(link.response as usize).store(&response)?;
    Ok(0)
}

/// Build a `GetDevices` response: size prefix, count, then
/// (len, bytes) name records.
fn get_devices(kind: DeviceKind, response: &mut Vec<u8>) -> SysResult<()> {
    let names = devices::names_of_kind(kind);

    response.extend_from_slice(&0usize.to_ne_bytes()); // size, patched below
    response.extend_from_slice(&names.len().to_ne_bytes());
    for name in &names {
        response.extend_from_slice(&name.len().to_ne_bytes());
        response.extend_from_slice(name.as_bytes());
    }
    let total = response.len();
    response[..size_of::<usize>()].copy_from_slice(&total.to_ne_bytes());
    Ok(())
}

fn open_device(request: &RawOpenDevice, response: &mut Vec<u8>) -> SysResult<()> {
    const NAME_MAX: usize = 128;
    if request.name_len > NAME_MAX {
        return Err(SysError::InvalidArgument);
    }
    let kind = DeviceKind::from_raw(request.kind).ok_or(SysError::InvalidArgument)?;
    let name = UserAccessor::new(request.name).load_string(request.name_len)?;

    let device = devices::open(kind, &name)?;
    let handle = sched::current_process().handles.insert(Object::Device(device));

    let reply = osprey_abi::devlink::OpenDeviceResponse {
        size: size_of::<osprey_abi::devlink::OpenDeviceResponse>(),
        handle,
    };
    response.extend_from_slice(unsafe {
        core::slice::from_raw_parts(
            &reply as *const _ as *const u8,
            size_of::<osprey_abi::devlink::OpenDeviceResponse>(),
        )
    });
    Ok(())
}
