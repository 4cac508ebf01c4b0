//! Socket ABI types shared by the kernel socket layer and userspace.

use crate::Handle;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Ipc,
    Udp,
    Tcp,
}

impl SocketKind {
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Ipc),
            1 => Some(Self::Udp),
            2 => Some(Self::Tcp),
            _ => None,
        }
    }
}

pub const SOCK_NONE: u32 = 0;
/// Sends/receives fail with `TryAgain` instead of blocking.
pub const SOCK_NON_BLOCK: u32 = 1 << 0;

/// Address family discriminant, first field of every address struct.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ipc,
    Ipv4,
    Ipv6,
}

/// An IPC peer: the process descriptor handle of the target.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpcSocketAddress {
    pub kind: AddressKind,
    pub target: Handle,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ipv4SocketAddress {
    pub kind: AddressKind,
    /// Network byte order.
    pub addr: [u8; 4],
    pub port: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ipv6SocketAddress {
    pub kind: AddressKind,
    pub addr: [u16; 8],
    pub port: u16,
}

/// The largest address variant; buffers exchanged with the kernel are
/// sized to this.
#[repr(C)]
#[derive(Clone, Copy)]
pub union AnySocketAddress {
    pub kind: AddressKind,
    pub ipc: IpcSocketAddress,
    pub ipv4: Ipv4SocketAddress,
    pub ipv6: Ipv6SocketAddress,
}
