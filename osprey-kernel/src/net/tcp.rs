//! TCP.
//!
//! One `TcpConnection` per endpoint, with a 64 KiB send ring, a 64 KiB
//! receive ring and cumulative ACKs only; out-of-order segments are
//! dropped and left to the peer's retransmission. Each connection owns
//! a kernel worker thread that pumps data out of the send ring and owns
//! retransmission of control segments (SYN/ACK/FIN): 200 ms initial
//! RTO, doubled per attempt, capped at 120 s, reset after 6 failures.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use ring_buffer::ByteRing;
use spinning_top::Spinlock;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::checksum::{finish, pseudo_header, sum_words};
use super::ipv4::PROTO_TCP;
use super::{Interface, Ipv4Addr};
use crate::sched::event::Event;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

/// Maximum segment size (Ethernet MTU minus IP and TCP headers).
pub const MSS: usize = 1460;
/// Send and receive ring capacity.
const WINDOW: usize = 64 * 1024 - 1;
/// Initial retransmission timeout.
const RTO_INITIAL_US: u64 = 200_000;
/// Retransmission timeout ceiling.
const RTO_MAX_US: u64 = 120_000_000;
/// Control-segment attempts before the connection resets.
const MAX_ATTEMPTS: u32 = 6;
/// Pending connections a listener will hold.
const MAX_BACKLOG: usize = 16;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct TcpHeader {
    src_port: U16,
    dst_port: U16,
    seq: U32,
    ack: U32,
    data_offset: u8,
    flags: u8,
    window: U16,
    checksum: U16,
    urgent: U16,
}

/// Connection states. `None` doubles as closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    None,
    Listening,
    SentSyn,
    SynAck,
    ReceivedSynAck,
    ReceivedFin,
    SentFin,
    Connected,
}

struct SendState {
    ring: ByteRing,
    /// Initial send sequence number.
    iss: u32,
    /// Oldest unacknowledged sequence number.
    una: u32,
    /// Next sequence number to transmit.
    nxt: u32,
    /// Peer's advertised window.
    wnd: u32,
    /// Deadline for go-back-N data retransmission.
    rexmit_deadline_us: u64,
}

struct RecvState {
    ring: ByteRing,
    /// Initial receive sequence number.
    irs: u32,
    /// Next expected sequence number.
    nxt: u32,
}

/// An in-flight control segment owned by the worker.
struct CtrlSegment {
    flags: u8,
    seq: u32,
    deadline_us: u64,
    rto_us: u64,
    attempts: u32,
}

pub struct TcpConnection {
    local_port: u16,
    remote: Spinlock<Option<(Ipv4Addr, u16)>>,
    interface: Spinlock<Option<Arc<Interface>>>,
    state: Spinlock<TcpState>,

    snd: Spinlock<SendState>,
    rcv: Spinlock<RecvState>,
    ctrl: Spinlock<Option<CtrlSegment>>,

    /// Connection reached Connected (or died trying).
    state_event: Event,
    recv_event: Event,
    space_event: Event,
    accept_event: Event,
    /// Kicks the worker thread.
    worker_event: Event,

    pending: Spinlock<VecDeque<Arc<TcpConnection>>>,
    /// Torn down; the worker exits and lookups stop matching.
    dead: AtomicBool,
}

static LISTENERS: Spinlock<BTreeMap<u16, Arc<TcpConnection>>> = Spinlock::new(BTreeMap::new());
#[allow(clippy::type_complexity)]
static CONNECTIONS: Spinlock<BTreeMap<(u16, u32, u16), Arc<TcpConnection>>> =
    Spinlock::new(BTreeMap::new());

fn seq_ge(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 >= 0
}

impl TcpConnection {
    fn new(local_port: u16) -> Arc<TcpConnection> {
        let iss = crate::random::random_u32();
        Arc::new(TcpConnection {
            local_port,
            remote: Spinlock::new(None),
            interface: Spinlock::new(None),
            state: Spinlock::new(TcpState::None),
            snd: Spinlock::new(SendState {
                ring: ByteRing::new(WINDOW),
                iss,
                una: iss,
                nxt: iss,
                wnd: WINDOW as u32,
                rexmit_deadline_us: 0,
            }),
            rcv: Spinlock::new(RecvState {
                ring: ByteRing::new(WINDOW),
                irs: 0,
                nxt: 0,
            }),
            ctrl: Spinlock::new(None),
            state_event: Event::new(),
            recv_event: Event::new(),
            space_event: Event::new(),
            accept_event: Event::new(),
            worker_event: Event::new(),
            pending: Spinlock::new(VecDeque::new()),
            dead: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> TcpState {
        *self.state.lock()
    }

    fn set_state(&self, state: TcpState) {
        *self.state.lock() = state;
        self.state_event.signal_all();
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> Option<(Ipv4Addr, u16)> {
        *self.remote.lock()
    }

    // ── client side ─────────────────────────────────────────────────

    /// Open a connection; blocks until established or reset.
    pub fn connect(dst: Ipv4Addr, dst_port: u16) -> Option<Arc<TcpConnection>> {
        let interface = super::default_interface()?;
        interface.wait_for_ip();

        let local_port = alloc_ephemeral_port();
        let conn = TcpConnection::new(local_port);
        *conn.remote.lock() = Some((dst, dst_port));
        *conn.interface.lock() = Some(interface);
        conn.set_state(TcpState::SentSyn);

        CONNECTIONS
            .lock()
            .insert((local_port, dst.to_u32(), dst_port), conn.clone());
        spawn_worker(conn.clone());

        conn.queue_ctrl(SYN);
        loop {
            match conn.state() {
                TcpState::Connected => return Some(conn),
                TcpState::None => {
                    conn.teardown();
                    return None;
                }
                _ => conn.state_event.wait(),
            }
        }
    }

    // ── server side ─────────────────────────────────────────────────

    pub fn listen(port: u16) -> Option<Arc<TcpConnection>> {
        let mut listeners = LISTENERS.lock();
        if listeners.contains_key(&port) {
            return None;
        }
        let conn = TcpConnection::new(port);
        conn.set_state(TcpState::Listening);
        listeners.insert(port, conn.clone());
        Some(conn)
    }

    /// Take the oldest pending connection, blocking until one completes
    /// its handshake. Waiters are served FIFO by the accept event.
    pub fn accept(&self, non_blocking: bool) -> Result<Arc<TcpConnection>, osprey_abi::SysError> {
        use osprey_abi::SysError;
        loop {
            if self.dead.load(Ordering::SeqCst) {
                return Err(SysError::ConnectionClosed);
            }
            let child = self.pending.lock().pop_front();
            if let Some(child) = child {
                // Wait out the tail of the handshake.
                loop {
                    match child.state() {
                        TcpState::Connected => return Ok(child),
                        TcpState::None => break,
                        _ => child.state_event.wait(),
                    }
                }
                continue;
            }
            if non_blocking {
                return Err(SysError::TryAgain);
            }
            self.accept_event.wait();
        }
    }

    // ── data path ───────────────────────────────────────────────────

    /// Queue bytes for transmission. Returns the number accepted.
    pub fn send(&self, data: &[u8], non_blocking: bool) -> Result<usize, osprey_abi::SysError> {
        use osprey_abi::SysError;
        loop {
            match self.state() {
                TcpState::Connected => {}
                _ => return Err(SysError::ConnectionClosed),
            }
            let written = self.snd.lock().ring.write(data);
            if written > 0 {
                self.worker_event.signal_one();
                return Ok(written);
            }
            if non_blocking {
                return Err(SysError::TryAgain);
            }
            self.space_event.wait();
        }
    }

    /// Take received bytes in order.
    pub fn receive(&self, buf: &mut [u8], non_blocking: bool) -> Result<usize, osprey_abi::SysError> {
        use osprey_abi::SysError;
        loop {
            {
                let mut rcv = self.rcv.lock();
                if !rcv.ring.is_empty() {
                    return Ok(rcv.ring.read(buf));
                }
            }
            match self.state() {
                TcpState::Connected | TcpState::SentFin => {}
                _ => return Err(SysError::ConnectionClosed),
            }
            if non_blocking {
                return Err(SysError::TryAgain);
            }
            self.recv_event.wait();
        }
    }

    /// Initiate a close: enter SentFin and let the worker carry the FIN
    /// until the peer acknowledges it.
    pub fn disconnect(&self) {
        match self.state() {
            TcpState::Connected => {
                let seq = {
                    let mut snd = self.snd.lock();
                    let seq = snd.nxt;
                    snd.nxt = snd.nxt.wrapping_add(1);
                    seq
                };
                *self.state.lock() = TcpState::SentFin;
                self.queue_ctrl_with_seq(FIN | ACK, seq);
            }
            TcpState::Listening => self.teardown(),
            TcpState::SentSyn | TcpState::SynAck => {
                self.send_segment(RST, self.snd.lock().nxt, &[]);
                self.teardown();
            }
            _ => {}
        }
    }

    /// Drop the connection from the tables and release its waiters.
    fn teardown(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(TcpState::None);
        self.recv_event.signal_all();
        self.space_event.signal_all();
        self.accept_event.signal_all();
        self.worker_event.signal_all();
        if let Some((ip, port)) = self.remote() {
            CONNECTIONS
                .lock()
                .remove(&(self.local_port, ip.to_u32(), port));
        }
        LISTENERS.lock().retain(|_, l| {
            !core::ptr::eq(Arc::as_ptr(l), self as *const TcpConnection)
        });
    }

    // ── segment transmission ────────────────────────────────────────

    fn queue_ctrl(&self, flags: u8) {
        let seq = {
            let mut snd = self.snd.lock();
            let seq = snd.nxt;
            snd.nxt = snd.nxt.wrapping_add(1);
            seq
        };
        self.queue_ctrl_with_seq(flags, seq);
    }

    fn queue_ctrl_with_seq(&self, flags: u8, seq: u32) {
        *self.ctrl.lock() = Some(CtrlSegment {
            flags,
            seq,
            // Send immediately on the next worker pass.
            deadline_us: 0,
            rto_us: RTO_INITIAL_US,
            attempts: 0,
        });
        self.worker_event.signal_one();
    }

    fn send_segment(&self, flags: u8, seq: u32, payload: &[u8]) {
        let Some((dst, dst_port)) = self.remote() else {
            return;
        };
        let Some(interface) = self.interface.lock().clone() else {
            return;
        };

        let window = {
            let rcv = self.rcv.lock();
            (rcv.ring.free_space() as u32).min(0xffff) as u16
        };
        let ack = self.rcv.lock().nxt;

        let mut header = TcpHeader {
            src_port: U16::new(self.local_port),
            dst_port: U16::new(dst_port),
            seq: U32::new(seq),
            ack: U32::new(if flags & ACK != 0 { ack } else { 0 }),
            data_offset: 5 << 4,
            flags,
            window: U16::new(window),
            checksum: U16::new(0),
            urgent: U16::new(0),
        };

        let src_ip = interface.ip().unwrap_or(Ipv4Addr::ZERO);
        let mut sum = pseudo_header(src_ip, dst, PROTO_TCP, (20 + payload.len()) as u16);
        sum = sum_words(sum, header.as_bytes());
        sum = sum_words(sum, payload);
        header.checksum = U16::new(finish(sum));

        let mut packet = Vec::with_capacity(20 + payload.len());
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(payload);
        super::ipv4::send_packet(&interface, dst, PROTO_TCP, &packet);
    }

    fn send_ack(&self) {
        let seq = self.snd.lock().nxt;
        self.send_segment(ACK, seq, &[]);
    }

    // ── the worker ──────────────────────────────────────────────────

    /// One pass of the per-connection worker: send fresh data, run
    /// control and data retransmission. Returns the next deadline.
    fn pump(&self) -> u64 {
        let now = crate::time::now_us();
        let mut next_deadline = u64::MAX;

        // Control segments first; they carry the state machine.
        {
            let mut ctrl = self.ctrl.lock();
            if let Some(seg) = ctrl.as_mut() {
                if now >= seg.deadline_us {
                    if seg.attempts >= MAX_ATTEMPTS {
                        debug!("tcp: port {} handshake timeout", self.local_port);
                        drop(ctrl);
                        self.send_segment(RST, self.snd.lock().nxt, &[]);
                        self.teardown();
                        return u64::MAX;
                    }
                    seg.attempts += 1;
                    let (flags, seq) = (seg.flags, seg.seq);
                    seg.deadline_us = now + seg.rto_us;
                    seg.rto_us = (seg.rto_us * 2).min(RTO_MAX_US);
                    next_deadline = next_deadline.min(seg.deadline_us);
                    drop(ctrl);
                    self.send_segment(flags, seq, &[]);
                } else {
                    next_deadline = next_deadline.min(seg.deadline_us);
                }
            }
        }

        if self.state() != TcpState::Connected && self.state() != TcpState::SentFin {
            return next_deadline;
        }

        // Fresh data: everything buffered beyond snd.nxt, bounded by
        // the peer's window.
        loop {
            let (seq, chunk) = {
                let snd = self.snd.lock();
                let sent = snd.nxt.wrapping_sub(snd.una) as usize;
                let buffered = snd.ring.len();
                if buffered <= sent {
                    break;
                }
                let in_flight = sent;
                let window = snd.wnd as usize;
                if in_flight >= window {
                    break;
                }
                let n = (buffered - sent).min(MSS).min(window - in_flight);
                let mut chunk = alloc::vec![0u8; n];
                let copied = snd.ring.peek_at(sent, &mut chunk);
                chunk.truncate(copied);
                (snd.nxt, chunk)
            };
            if chunk.is_empty() {
                break;
            }
            self.send_segment(ACK | PSH, seq, &chunk);
            let mut snd = self.snd.lock();
            snd.nxt = snd.nxt.wrapping_add(chunk.len() as u32);
            snd.rexmit_deadline_us = now + RTO_INITIAL_US;
        }

        // Go-back-N: resend from the oldest unacknowledged byte when
        // its deadline lapses.
        {
            let mut snd = self.snd.lock();
            if snd.una != snd.nxt {
                if now >= snd.rexmit_deadline_us {
                    let n = (snd.nxt.wrapping_sub(snd.una) as usize).min(MSS);
                    let mut chunk = alloc::vec![0u8; n];
                    let copied = snd.ring.peek_at(0, &mut chunk);
                    chunk.truncate(copied);
                    let seq = snd.una;
                    snd.rexmit_deadline_us = now + RTO_INITIAL_US;
                    next_deadline = next_deadline.min(snd.rexmit_deadline_us);
                    drop(snd);
                    if !chunk.is_empty() {
                        self.send_segment(ACK | PSH, seq, &chunk);
                    }
                } else {
                    next_deadline = next_deadline.min(snd.rexmit_deadline_us);
                }
            }
        }

        next_deadline
    }

    // ── input ───────────────────────────────────────────────────────

    fn on_segment(self: &Arc<Self>, header: &TcpHeader, payload: &[u8]) {
        let flags = header.flags;
        let seq = header.seq.get();
        let ack = header.ack.get();

        if flags & RST != 0 {
            self.teardown();
            return;
        }

        let state = self.state();
        match state {
            TcpState::SentSyn if flags & (SYN | ACK) == SYN | ACK => {
                {
                    let mut rcv = self.rcv.lock();
                    rcv.irs = seq;
                    rcv.nxt = seq.wrapping_add(1);
                }
                {
                    let mut snd = self.snd.lock();
                    snd.una = ack;
                    snd.wnd = header.window.get() as u32;
                }
                *self.ctrl.lock() = None;
                *self.state.lock() = TcpState::ReceivedSynAck;
                self.send_ack();
                self.set_state(TcpState::Connected);
            }
            TcpState::SynAck if flags & ACK != 0 => {
                let expected = self.snd.lock().iss.wrapping_add(1);
                if seq_ge(ack, expected) {
                    self.snd.lock().una = ack;
                    *self.ctrl.lock() = None;
                    self.set_state(TcpState::Connected);
                }
            }
            TcpState::Connected | TcpState::SentFin | TcpState::ReceivedFin => {
                if flags & ACK != 0 {
                    self.process_ack(ack, header.window.get());
                }
                if !payload.is_empty() {
                    self.process_data(seq, payload);
                }
                if flags & FIN != 0 {
                    self.process_fin(seq, payload.len());
                }
            }
            _ => {}
        }
    }

    fn process_ack(&self, ack: u32, window: u16) {
        let mut done = false;
        {
            let mut snd = self.snd.lock();
            snd.wnd = window as u32;
            if seq_ge(ack, snd.una) {
                let newly_acked = ack.wrapping_sub(snd.una) as usize;
                // Acks covering a FIN or SYN exceed the data in the ring.
                let from_ring = newly_acked.min(snd.ring.len());
                snd.ring.consume(from_ring);
                snd.una = ack;
                if from_ring > 0 {
                    self.space_event.signal_all();
                }
            }
            // Our FIN is acknowledged once everything sent is covered.
            if seq_ge(ack, snd.nxt) {
                done = true;
            }
        }

        if done {
            match self.state() {
                TcpState::SentFin | TcpState::ReceivedFin => {
                    self.teardown();
                }
                _ => {
                    let mut ctrl = self.ctrl.lock();
                    if ctrl.is_some() {
                        *ctrl = None;
                    }
                }
            }
        }
        self.worker_event.signal_one();
    }

    fn process_data(&self, seq: u32, payload: &[u8]) {
        {
            let mut rcv = self.rcv.lock();
            if seq != rcv.nxt {
                // Out of order: drop, the cumulative ACK below tells
                // the peer where we are.
                drop(rcv);
                self.send_ack();
                return;
            }
            let accepted = rcv.ring.write(payload);
            rcv.nxt = rcv.nxt.wrapping_add(accepted as u32);
        }
        self.send_ack();
        self.recv_event.signal_all();
    }

    fn process_fin(&self, seq: u32, payload_len: usize) {
        {
            let mut rcv = self.rcv.lock();
            let fin_seq = seq.wrapping_add(payload_len as u32);
            if fin_seq != rcv.nxt {
                return;
            }
            rcv.nxt = rcv.nxt.wrapping_add(1);
        }

        match self.state() {
            TcpState::Connected => {
                // Peer-initiated close: acknowledge and follow with our
                // own FIN in one segment.
                let seq = {
                    let mut snd = self.snd.lock();
                    let seq = snd.nxt;
                    snd.nxt = snd.nxt.wrapping_add(1);
                    seq
                };
                *self.state.lock() = TcpState::ReceivedFin;
                self.recv_event.signal_all();
                self.queue_ctrl_with_seq(FIN | ACK, seq);
            }
            TcpState::SentFin => {
                // Simultaneous/step two of our close: ack their FIN and
                // finish.
                self.send_ack();
                self.teardown();
            }
            _ => {}
        }
    }
}

fn alloc_ephemeral_port() -> u16 {
    let connections = CONNECTIONS.lock();
    loop {
        let port = 49152 + (crate::random::random_u32() % 16000) as u16;
        if !connections.keys().any(|(local, _, _)| *local == port) {
            return port;
        }
    }
}

fn spawn_worker(conn: Arc<TcpConnection>) {
    use crate::sched::thread::{Thread, ThreadEntry};
    let worker_conn = conn.clone();
    let thread = Thread::new(
        "tcp worker",
        crate::cpu::pick_cpu(),
        crate::sched::kernel_process(),
        ThreadEntry::Kernel(alloc::boxed::Box::new(move || {
            worker_loop(worker_conn);
        })),
    );
    crate::sched::spawn(&thread);
}

fn worker_loop(conn: Arc<TcpConnection>) {
    loop {
        if conn.dead.load(Ordering::SeqCst) {
            return;
        }
        let next_deadline = conn.pump();
        let now = crate::time::now_us();
        let timeout = next_deadline.saturating_sub(now).clamp(1_000, 1_000_000);
        conn.worker_event.wait_with_timeout(timeout);
    }
}

/// IPv4 hands every TCP segment here.
pub fn process_packet(interface: &Arc<Interface>, src: Ipv4Addr, body: &[u8]) {
    let Ok((header, rest)) = TcpHeader::ref_from_prefix(body) else {
        return;
    };
    let data_offset = ((header.data_offset >> 4) as usize) * 4;
    if data_offset < 20 || data_offset > body.len() {
        return;
    }
    let payload = &body[data_offset..];

    let key = (header.dst_port.get(), src.to_u32(), header.src_port.get());
    let existing = CONNECTIONS.lock().get(&key).cloned();
    if let Some(conn) = existing {
        conn.on_segment(header, payload);
        return;
    }

    // New connection attempt against a listener.
    if header.flags & SYN != 0 && header.flags & ACK == 0 {
        let listener = LISTENERS.lock().get(&header.dst_port.get()).cloned();
        if let Some(listener) = listener {
            accept_syn(&listener, interface, src, header);
        }
    }
}

fn accept_syn(
    listener: &Arc<TcpConnection>,
    interface: &Arc<Interface>,
    src: Ipv4Addr,
    header: &TcpHeader,
) {
    if listener.pending.lock().len() >= MAX_BACKLOG {
        return;
    }

    let child = TcpConnection::new(listener.local_port);
    *child.remote.lock() = Some((src, header.src_port.get()));
    *child.interface.lock() = Some(interface.clone());
    {
        let mut rcv = child.rcv.lock();
        rcv.irs = header.seq.get();
        rcv.nxt = header.seq.get().wrapping_add(1);
    }
    child.snd.lock().wnd = header.window.get() as u32;
    *child.state.lock() = TcpState::SynAck;

    CONNECTIONS.lock().insert(
        (listener.local_port, src.to_u32(), header.src_port.get()),
        child.clone(),
    );
    spawn_worker(child.clone());
    child.queue_ctrl(SYN | ACK);

    listener.pending.lock().push_back(child);
    listener.accept_event.signal_one();
}
