//! Sockets.
//!
//! One abstract `Socket` trait with three concrete kinds: IPC
//! (peer-to-peer on this host), UDP/4 and TCP/4. The syscall layer
//! holds `Arc<dyn Socket>` in handle tables and translates kernel
//! addresses to the ABI address union at the boundary.

pub mod ipc;
pub mod service;
pub mod tcp;
pub mod udp;

use alloc::sync::Arc;

use osprey_abi::{SysError, SysResult};

use crate::net::Ipv4Addr;
use crate::sched::process::ProcessDescriptor;

/// A socket address, kernel-side.
#[derive(Clone)]
pub enum SocketAddr {
    /// An IPC peer, named by a descriptor of the target process.
    Ipc(Arc<ProcessDescriptor>),
    Ipv4(Ipv4Addr, u16),
}

/// The operations every socket kind answers. Unsupported combinations
/// (e.g. `send_to` on TCP) return `ERR_UNSUPPORTED`.
pub trait Socket: Send + Sync {
    fn connect(&self, addr: SocketAddr) -> SysResult<()>;

    fn disconnect(&self) -> SysResult<()>;

    fn listen(&self, port: u32) -> SysResult<()>;

    fn accept(&self, connection_flags: u32) -> SysResult<Arc<dyn Socket>>;

    fn send(&self, data: &[u8]) -> SysResult<usize>;

    fn receive(&self, buf: &mut [u8]) -> SysResult<usize>;

    fn send_to(&self, _data: &[u8], _addr: SocketAddr) -> SysResult<usize> {
        Err(SysError::Unsupported)
    }

    fn receive_from(&self, _buf: &mut [u8]) -> SysResult<(usize, SocketAddr)> {
        Err(SysError::Unsupported)
    }

    fn get_peer_name(&self) -> SysResult<SocketAddr>;
}

/// Construct a socket of the requested kind.
pub fn create(kind: osprey_abi::socket::SocketKind, flags: u32) -> Arc<dyn Socket> {
    match kind {
        osprey_abi::socket::SocketKind::Ipc => ipc::IpcSocket::create(flags),
        osprey_abi::socket::SocketKind::Udp => Arc::new(udp::UdpSocket::new(flags)),
        osprey_abi::socket::SocketKind::Tcp => Arc::new(tcp::TcpSocket::new(flags)),
    }
}
