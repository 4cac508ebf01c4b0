//! Same-host peer-to-peer IPC sockets.
//!
//! Each endpoint owns a bounded receive ring; sending writes into the
//! peer's ring. A process exposes at most one listening endpoint (its
//! IPC endpoint in the process control block); connectors name it with
//! a process descriptor and land on its pending queue until `accept`.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use osprey_abi::socket::SOCK_NON_BLOCK;
use osprey_abi::{SysError, SysResult};
use ring_buffer::ByteRing;
use spinning_top::Spinlock;

use super::{Socket, SocketAddr};
use crate::sched::event::Event;
use crate::sched::process::{Process, ProcessDescriptor};

/// Receive buffer per endpoint.
const IPC_BUFFER_SIZE: usize = 16 * 1024;

pub struct IpcSocket {
    flags: u32,
    self_ref: Weak<IpcSocket>,
    /// The process that created this endpoint (for peer naming).
    owner: Spinlock<Weak<Process>>,
    /// Connected peer endpoint.
    target: Spinlock<Option<Arc<IpcSocket>>>,
    listening: AtomicBool,
    pending: Spinlock<VecDeque<Arc<IpcSocket>>>,
    pending_event: Event,
    closed: AtomicBool,

    ring: Spinlock<ByteRing>,
    data_event: Event,
    space_event: Event,
}

impl IpcSocket {
    pub fn create(flags: u32) -> Arc<IpcSocket> {
        let socket = Arc::new_cyclic(|self_ref| IpcSocket {
            flags,
            self_ref: self_ref.clone(),
            owner: Spinlock::new(Weak::new()),
            target: Spinlock::new(None),
            listening: AtomicBool::new(false),
            pending: Spinlock::new(VecDeque::new()),
            pending_event: Event::new(),
            closed: AtomicBool::new(false),
            ring: Spinlock::new(ByteRing::new(IPC_BUFFER_SIZE)),
            data_event: Event::new(),
            space_event: Event::new(),
        });
        if let Some(thread) = crate::cpu::try_current_thread() {
            *socket.owner.lock() = Arc::downgrade(&thread.process);
        }
        socket
    }

    fn non_blocking(&self) -> bool {
        self.flags & SOCK_NON_BLOCK != 0
    }

    fn owner_process(&self) -> Option<Arc<Process>> {
        self.owner.lock().upgrade()
    }
}

impl Socket for IpcSocket {
    /// Connect to the listening endpoint of the process named by the
    /// descriptor. Blocks until the listener accepts.
    fn connect(&self, addr: SocketAddr) -> SysResult<()> {
        let SocketAddr::Ipc(descriptor) = addr else {
            return Err(SysError::InvalidArgument);
        };
        let target_process = descriptor.get().ok_or(SysError::ConnectionClosed)?;
        let listener = target_process
            .ipc_endpoint
            .lock()
            .clone()
            .ok_or(SysError::NotExists)?;
        if !listener.listening.load(Ordering::SeqCst) {
            return Err(SysError::NotExists);
        }

        let me = self.self_ref.upgrade().expect("socket is alive");
        listener.pending.lock().push_back(me);
        listener.pending_event.signal_one();

        // Wait until the listener links us to an accepted endpoint.
        loop {
            if self.target.lock().is_some() {
                return Ok(());
            }
            if self.closed.load(Ordering::SeqCst) || listener.closed.load(Ordering::SeqCst) {
                return Err(SysError::ConnectionClosed);
            }
            self.data_event.wait();
        }
    }

    fn disconnect(&self) -> SysResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(peer) = self.target.lock().take() {
            peer.closed.store(true, Ordering::SeqCst);
            peer.data_event.signal_all();
            peer.space_event.signal_all();
        }
        self.data_event.signal_all();
        self.space_event.signal_all();
        self.pending_event.signal_all();
        Ok(())
    }

    /// Become the owning process's listening endpoint. The port is
    /// unused for IPC.
    fn listen(&self, _port: u32) -> SysResult<()> {
        let process = self.owner_process().ok_or(SysError::ConnectionClosed)?;
        let mut endpoint = process.ipc_endpoint.lock();
        if endpoint.is_some() {
            return Err(SysError::AlreadyExists);
        }
        self.listening.store(true, Ordering::SeqCst);
        *endpoint = Some(self.self_ref.upgrade().expect("socket is alive"));
        Ok(())
    }

    /// Pop the oldest connector (FIFO) and pair it with a fresh
    /// endpoint.
    fn accept(&self, connection_flags: u32) -> SysResult<Arc<dyn Socket>> {
        if !self.listening.load(Ordering::SeqCst) {
            return Err(SysError::InvalidArgument);
        }
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(SysError::ConnectionClosed);
            }
            let connector = self.pending.lock().pop_front();
            if let Some(connector) = connector {
                let endpoint = IpcSocket::create(connection_flags);
                *endpoint.owner.lock() = self.owner.lock().clone();
                *endpoint.target.lock() = Some(connector.clone());
                *connector.target.lock() = Some(endpoint.clone());
                // Wake the connector blocked in connect().
                connector.data_event.signal_all();
                return Ok(endpoint);
            }
            if self.non_blocking() {
                return Err(SysError::TryAgain);
            }
            self.pending_event.wait();
        }
    }

    fn send(&self, data: &[u8]) -> SysResult<usize> {
        let peer = self
            .target
            .lock()
            .clone()
            .ok_or(SysError::ConnectionClosed)?;
        let mut written = 0;
        loop {
            if peer.closed.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                return Err(SysError::ConnectionClosed);
            }
            let n = peer.ring.lock().write(&data[written..]);
            if n > 0 {
                written += n;
                peer.data_event.signal_one();
            }
            if written == data.len() {
                return Ok(written);
            }
            if self.non_blocking() {
                if written > 0 {
                    return Ok(written);
                }
                return Err(SysError::TryAgain);
            }
            peer.space_event.wait();
        }
    }

    fn receive(&self, buf: &mut [u8]) -> SysResult<usize> {
        loop {
            {
                let mut ring = self.ring.lock();
                if !ring.is_empty() {
                    let n = ring.read(buf);
                    drop(ring);
                    self.space_event.signal_one();
                    return Ok(n);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(SysError::ConnectionClosed);
            }
            if self.non_blocking() {
                return Err(SysError::TryAgain);
            }
            self.data_event.wait();
        }
    }

    /// Name the peer by a fresh descriptor of its owning process; the
    /// syscall layer turns it into a handle for the caller.
    fn get_peer_name(&self) -> SysResult<SocketAddr> {
        let peer = self
            .target
            .lock()
            .clone()
            .ok_or(SysError::ConnectionClosed)?;
        let process = peer.owner_process().ok_or(SysError::ConnectionClosed)?;
        Ok(SocketAddr::Ipc(ProcessDescriptor::new(&process)))
    }
}

impl Drop for IpcSocket {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
