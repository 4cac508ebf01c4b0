//! UDP: per-port receive queues.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::Spinlock;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::checksum::{finish, pseudo_header, sum_words};
use super::ipv4::PROTO_UDP;
use super::{Interface, Ipv4Addr};
use crate::sched::event::Event;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct UdpHeader {
    pub src_port: U16,
    pub dst_port: U16,
    pub length: U16,
    pub checksum: U16,
}

/// A received datagram awaiting a socket.
pub struct Datagram {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub data: Vec<u8>,
}

/// Stack-side endpoint for one bound port.
pub struct UdpEndpoint {
    pub queue: Spinlock<VecDeque<Datagram>>,
    pub event: Event,
}

const MAX_QUEUED: usize = 64;

static PORTS: Spinlock<BTreeMap<u16, Arc<UdpEndpoint>>> = Spinlock::new(BTreeMap::new());

/// Bind `port`, creating its receive queue.
pub fn bind(port: u16) -> Option<Arc<UdpEndpoint>> {
    let mut ports = PORTS.lock();
    if ports.contains_key(&port) {
        return None;
    }
    let endpoint = Arc::new(UdpEndpoint {
        queue: Spinlock::new(VecDeque::new()),
        event: Event::new(),
    });
    ports.insert(port, endpoint.clone());
    Some(endpoint)
}

/// Pick a free ephemeral port and bind it.
pub fn bind_ephemeral() -> (u16, Arc<UdpEndpoint>) {
    for port in 49152..65535u16 {
        if let Some(endpoint) = bind(port) {
            return (port, endpoint);
        }
    }
    panic!("ephemeral UDP port space exhausted");
}

pub fn unbind(port: u16) {
    PORTS.lock().remove(&port);
}

pub fn process_packet(_interface: &Arc<Interface>, src: Ipv4Addr, _dst: Ipv4Addr, body: &[u8]) {
    let Ok((header, payload)) = UdpHeader::ref_from_prefix(body) else {
        return;
    };
    let len = header.length.get() as usize;
    if len < 8 || len > body.len() {
        return;
    }
    let payload = &payload[..len - 8];

    let endpoint = {
        let ports = PORTS.lock();
        match ports.get(&header.dst_port.get()) {
            Some(endpoint) => endpoint.clone(),
            None => return,
        }
    };

    {
        let mut queue = endpoint.queue.lock();
        if queue.len() >= MAX_QUEUED {
            queue.pop_front();
        }
        queue.push_back(Datagram {
            src_ip: src,
            src_port: header.src_port.get(),
            data: payload.to_vec(),
        });
    }
    endpoint.event.signal_one();
}

/// Send one datagram.
pub fn send_to(
    interface: &Arc<Interface>,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> bool {
    let mut header = UdpHeader {
        src_port: U16::new(src_port),
        dst_port: U16::new(dst_port),
        length: U16::new((8 + payload.len()) as u16),
        checksum: U16::new(0),
    };

    let src_ip = interface.ip().unwrap_or(Ipv4Addr::ZERO);
    let mut sum = pseudo_header(src_ip, dst, PROTO_UDP, (8 + payload.len()) as u16);
    sum = sum_words(sum, header.as_bytes());
    sum = sum_words(sum, payload);
    let checksum = finish(sum);
    // A computed zero is transmitted as all-ones.
    header.checksum = U16::new(if checksum == 0 { 0xffff } else { checksum });

    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    super::ipv4::send_packet(interface, dst, PROTO_UDP, &packet)
}
