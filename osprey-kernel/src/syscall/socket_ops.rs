//! Socket syscalls and address marshalling.

use osprey_abi::socket::{AddressKind, IpcSocketAddress, Ipv4SocketAddress, SocketKind};
use osprey_abi::{Handle, SysError, SysResult};

use super::Args;
use super::user::UserAccessor;
use crate::handle::Object;
use crate::net::Ipv4Addr;
use crate::sched;
use crate::socket::{self, SocketAddr};

// Raw layouts for user-supplied addresses; the discriminant is
// validated before anything typed is built.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawIpcAddress {
    kind: u32,
    target: Handle,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawIpv4Address {
    kind: u32,
    addr: [u8; 4],
    port: u16,
}

/// Translate a user address union to the kernel form. IPC addresses
/// carry a handle that resolves in the caller's table.
fn load_address(ptr: usize) -> SysResult<SocketAddr> {
    let kind: u32 = UserAccessor::new(ptr).load_value()?;
    match kind {
        x if x == AddressKind::Ipc as u32 => {
            let raw: RawIpcAddress = UserAccessor::new(ptr).load_value()?;
            let descriptor = sched::current_process()
                .handles
                .get_process_descriptor(raw.target)?;
            Ok(SocketAddr::Ipc(descriptor))
        }
        x if x == AddressKind::Ipv4 as u32 => {
            let raw: RawIpv4Address = UserAccessor::new(ptr).load_value()?;
            Ok(SocketAddr::Ipv4(Ipv4Addr(raw.addr), raw.port))
        }
        x if x == AddressKind::Ipv6 as u32 => Err(SysError::Unsupported),
        _ => Err(SysError::InvalidArgument),
    }
}

/// Write a kernel address back to userspace. IPC peers materialize as
/// a fresh descriptor handle in the caller's table.
fn store_address(ptr: usize, address: SocketAddr) -> SysResult<()> {
    match address {
        SocketAddr::Ipc(descriptor) => {
            let handle = sched::current_process()
                .handles
                .insert(Object::ProcessDescriptor(descriptor));
            let out = IpcSocketAddress {
                kind: AddressKind::Ipc,
                target: handle,
            };
            UserAccessor::new(ptr).store_value(&out)
        }
        SocketAddr::Ipv4(ip, port) => {
            let out = Ipv4SocketAddress {
                kind: AddressKind::Ipv4,
                addr: ip.0,
                port,
            };
            UserAccessor::new(ptr).store_value(&out)
        }
    }
}

/// `SocketCreate(handle_out, kind, flags)`
pub fn create(args: Args) -> SysResult<usize> {
    let [handle_out, kind, flags, ..] = args;
    let kind = SocketKind::from_raw(kind).ok_or(SysError::InvalidArgument)?;
    let socket = socket::create(kind, flags as u32);
    let process = sched::current_process();
    let handle = process.handles.insert(Object::Socket(socket));
    if let Err(err) = UserAccessor::new(handle_out).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }
    Ok(0)
}

/// `SocketConnect(handle, address)`
pub fn connect(args: Args) -> SysResult<usize> {
    let [handle, address_ptr, ..] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    let address = load_address(address_ptr)?;
    socket.connect(address)?;
    Ok(0)
}

/// `SocketListen(handle, port)`
pub fn listen(args: Args) -> SysResult<usize> {
    let [handle, port, ..] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    socket.listen(port as u32)?;
    Ok(0)
}

/// `SocketAccept(handle, connection_out, connection_flags)`
pub fn accept(args: Args) -> SysResult<usize> {
    let [handle, connection_out, connection_flags, ..] = args;
    let process = sched::current_process();
    let socket = process.handles.get_socket(handle as Handle)?;
    let connection = socket.accept(connection_flags as u32)?;
    let new_handle = process.handles.insert(Object::Socket(connection));
    if let Err(err) = UserAccessor::new(connection_out).store_value(&new_handle) {
        process.handles.remove(new_handle).ok();
        return Err(err);
    }
    Ok(0)
}

const CHUNK: usize = 64 * 1024;

/// `SocketSend(handle, data, size, actual_out)`
pub fn send(args: Args) -> SysResult<usize> {
    let [handle, data, size, actual_out, _] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    let mut buf = alloc::vec![0u8; size.min(CHUNK)];
    UserAccessor::new(data).load(&mut buf)?;
    let n = socket.send(&buf)?;
    if actual_out != 0 {
        UserAccessor::new(actual_out).store_value(&n)?;
    }
    Ok(n)
}

/// `SocketReceive(handle, data, size, actual_out)`
pub fn receive(args: Args) -> SysResult<usize> {
    let [handle, data, size, actual_out, _] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    let mut buf = alloc::vec![0u8; size.min(CHUNK)];
    let n = socket.receive(&mut buf)?;
    UserAccessor::new(data).store(&buf[..n])?;
    if actual_out != 0 {
        UserAccessor::new(actual_out).store_value(&n)?;
    }
    Ok(n)
}

/// `SocketSendTo(handle, data, size, address)`
pub fn send_to(args: Args) -> SysResult<usize> {
    let [handle, data, size, address_ptr, _] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    let address = load_address(address_ptr)?;
    let mut buf = alloc::vec![0u8; size.min(CHUNK)];
    UserAccessor::new(data).load(&mut buf)?;
    let n = socket.send_to(&buf, address)?;
    Ok(n)
}

/// `SocketReceiveFrom(handle, data, size, actual_out, address_out)`
pub fn receive_from(args: Args) -> SysResult<usize> {
    let [handle, data, size, actual_out, address_out] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    let mut buf = alloc::vec![0u8; size.min(CHUNK)];
    let (n, from) = socket.receive_from(&mut buf)?;
    UserAccessor::new(data).store(&buf[..n])?;
    if actual_out != 0 {
        UserAccessor::new(actual_out).store_value(&n)?;
    }
    if address_out != 0 {
        store_address(address_out, from)?;
    }
    Ok(n)
}

/// `SocketGetPeerName(handle, address_out)`
pub fn get_peer_name(args: Args) -> SysResult<usize> {
    let [handle, address_out, ..] = args;
    let socket = sched::current_process().handles.get_socket(handle as Handle)?;
    let address = socket.get_peer_name()?;
    store_address(address_out, address)?;
    Ok(0)
}
