//! TCP sockets: a thin handle over the stack's connection engine.

use alloc::sync::Arc;

use osprey_abi::socket::SOCK_NON_BLOCK;
use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;

use super::{Socket, SocketAddr};
use crate::net::tcp::TcpConnection;

pub struct TcpSocket {
    flags: u32,
    conn: Spinlock<Option<Arc<TcpConnection>>>,
}

impl TcpSocket {
    pub fn new(flags: u32) -> TcpSocket {
        TcpSocket {
            flags,
            conn: Spinlock::new(None),
        }
    }

    fn wrap(flags: u32, conn: Arc<TcpConnection>) -> TcpSocket {
        TcpSocket {
            flags,
            conn: Spinlock::new(Some(conn)),
        }
    }

    fn non_blocking(&self) -> bool {
        self.flags & SOCK_NON_BLOCK != 0
    }

    fn connection(&self) -> SysResult<Arc<TcpConnection>> {
        self.conn.lock().clone().ok_or(SysError::InvalidArgument)
    }
}

impl Socket for TcpSocket {
    fn connect(&self, addr: SocketAddr) -> SysResult<()> {
        let SocketAddr::Ipv4(ip, port) = addr else {
            return Err(SysError::InvalidArgument);
        };
        let mut conn = self.conn.lock();
        if conn.is_some() {
            return Err(SysError::AlreadyExists);
        }
        let connection = TcpConnection::connect(ip, port).ok_or(SysError::ConnectionClosed)?;
        *conn = Some(connection);
        Ok(())
    }

    fn disconnect(&self) -> SysResult<()> {
        self.connection()?.disconnect();
        Ok(())
    }

    fn listen(&self, port: u32) -> SysResult<()> {
        let port = u16::try_from(port).map_err(|_| SysError::InvalidArgument)?;
        let mut conn = self.conn.lock();
        if conn.is_some() {
            return Err(SysError::AlreadyExists);
        }
        let listener = TcpConnection::listen(port).ok_or(SysError::AlreadyExists)?;
        *conn = Some(listener);
        Ok(())
    }

    fn accept(&self, connection_flags: u32) -> SysResult<Arc<dyn Socket>> {
        let listener = self.connection()?;
        let child = listener.accept(self.non_blocking())?;
        Ok(Arc::new(TcpSocket::wrap(connection_flags, child)))
    }

    fn send(&self, data: &[u8]) -> SysResult<usize> {
        self.connection()?.send(data, self.non_blocking())
    }

    fn receive(&self, buf: &mut [u8]) -> SysResult<usize> {
        self.connection()?.receive(buf, self.non_blocking())
    }

    fn get_peer_name(&self) -> SysResult<SocketAddr> {
        let (ip, port) = self
            .connection()?
            .remote()
            .ok_or(SysError::NotExists)?;
        Ok(SocketAddr::Ipv4(ip, port))
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.lock().take() {
            conn.disconnect();
        }
    }
}
