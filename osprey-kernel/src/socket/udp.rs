//! UDP sockets over the stack's per-port receive queues.

use alloc::sync::Arc;

use osprey_abi::socket::SOCK_NON_BLOCK;
use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;

use super::{Socket, SocketAddr};
use crate::net::{self, Ipv4Addr, udp};

struct Bound {
    port: u16,
    endpoint: Arc<udp::UdpEndpoint>,
}

pub struct UdpSocket {
    flags: u32,
    bound: Spinlock<Option<Bound>>,
    /// Default destination set by `connect`.
    peer: Spinlock<Option<(Ipv4Addr, u16)>>,
}

impl UdpSocket {
    pub fn new(flags: u32) -> UdpSocket {
        UdpSocket {
            flags,
            bound: Spinlock::new(None),
            peer: Spinlock::new(None),
        }
    }

    fn non_blocking(&self) -> bool {
        self.flags & SOCK_NON_BLOCK != 0
    }

    fn ensure_bound(&self) -> SysResult<Arc<udp::UdpEndpoint>> {
        let mut bound = self.bound.lock();
        if let Some(bound) = bound.as_ref() {
            return Ok(bound.endpoint.clone());
        }
        let (port, endpoint) = udp::bind_ephemeral();
        *bound = Some(Bound {
            port,
            endpoint: endpoint.clone(),
        });
        Ok(endpoint)
    }

    fn local_port(&self) -> SysResult<u16> {
        self.ensure_bound()?;
        Ok(self.bound.lock().as_ref().expect("just bound").port)
    }
}

impl Socket for UdpSocket {
    fn connect(&self, addr: SocketAddr) -> SysResult<()> {
        let SocketAddr::Ipv4(ip, port) = addr else {
            return Err(SysError::InvalidArgument);
        };
        *self.peer.lock() = Some((ip, port));
        Ok(())
    }

    fn disconnect(&self) -> SysResult<()> {
        *self.peer.lock() = None;
        Ok(())
    }

    /// Bind the given port.
    fn listen(&self, port: u32) -> SysResult<()> {
        let port = u16::try_from(port).map_err(|_| SysError::InvalidArgument)?;
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(SysError::AlreadyExists);
        }
        let endpoint = udp::bind(port).ok_or(SysError::AlreadyExists)?;
        *bound = Some(Bound { port, endpoint });
        Ok(())
    }

    fn accept(&self, _flags: u32) -> SysResult<Arc<dyn Socket>> {
        Err(SysError::Unsupported)
    }

    fn send(&self, data: &[u8]) -> SysResult<usize> {
        let peer = self.peer.lock().ok_or(SysError::InvalidArgument)?;
        self.send_to(data, SocketAddr::Ipv4(peer.0, peer.1))
    }

    fn receive(&self, buf: &mut [u8]) -> SysResult<usize> {
        self.receive_from(buf).map(|(n, _)| n)
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> SysResult<usize> {
        let SocketAddr::Ipv4(ip, port) = addr else {
            return Err(SysError::InvalidArgument);
        };
        let interface = net::default_interface().ok_or(SysError::NotExists)?;
        // Senders wait for DHCP; broadcasts (DHCP itself) go out bare.
        if ip != Ipv4Addr::BROADCAST {
            interface.wait_for_ip();
        }
        let local_port = self.local_port()?;
        if udp::send_to(&interface, local_port, ip, port, data) {
            Ok(data.len())
        } else {
            Err(SysError::TryAgain)
        }
    }

    fn receive_from(&self, buf: &mut [u8]) -> SysResult<(usize, SocketAddr)> {
        let endpoint = self.ensure_bound()?;
        loop {
            if let Some(datagram) = endpoint.queue.lock().pop_front() {
                let n = buf.len().min(datagram.data.len());
                buf[..n].copy_from_slice(&datagram.data[..n]);
                return Ok((n, SocketAddr::Ipv4(datagram.src_ip, datagram.src_port)));
            }
            if self.non_blocking() {
                return Err(SysError::TryAgain);
            }
            endpoint.event.wait();
        }
    }

    fn get_peer_name(&self) -> SysResult<SocketAddr> {
        let peer = self.peer.lock().ok_or(SysError::NotExists)?;
        Ok(SocketAddr::Ipv4(peer.0, peer.1))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.lock().take() {
            udp::unbind(bound.port);
        }
    }
}
