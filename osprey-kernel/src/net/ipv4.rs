//! IPv4: encapsulation and upward dispatch. Fragmented packets are not
//! reassembled; they are dropped with a log line.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::checksum::internet_checksum;
use super::ethernet::{self, ETHERTYPE_IPV4};
use super::{Interface, Ipv4Addr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_len: U16,
    pub identification: U16,
    pub flags_fragment: U16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: U16,
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

pub fn process_packet(interface: &Arc<Interface>, payload: &[u8]) {
    let Ok((header, rest)) = Ipv4Header::ref_from_prefix(payload) else {
        return;
    };
    if header.version_ihl >> 4 != 4 {
        return;
    }

    // More-fragments set or a nonzero offset: no reassembly support.
    if header.flags_fragment.get() & 0x3fff != 0 {
        debug!("ipv4: dropping fragmented packet");
        return;
    }

    let ihl = ((header.version_ihl & 0xf) as usize) * 4;
    let total = header.total_len.get() as usize;
    if ihl < 20 || total < ihl || total > payload.len() {
        return;
    }
    let body = &rest[ihl - 20..total - 20];

    let src = Ipv4Addr(header.src);
    let dst = Ipv4Addr(header.dst);

    match header.protocol {
        PROTO_UDP => super::udp::process_packet(interface, src, dst, body),
        PROTO_TCP => super::tcp::process_packet(interface, src, body),
        _ => {}
    }
}

/// Wrap `payload` in an IPv4 header and route it out of `interface`.
///
/// Local destinations resolve directly; everything else goes through
/// the gateway. Returns false when resolution fails.
pub fn send_packet(interface: &Arc<Interface>, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> bool {
    let src = interface.ip().unwrap_or(Ipv4Addr::ZERO);

    let next_hop = if dst == Ipv4Addr::BROADCAST {
        dst
    } else {
        match *interface.config.lock() {
            Some(config) if !config.is_local(dst) => config.gateway,
            _ => dst,
        }
    };

    let Some(dst_mac) = super::arp::resolve(interface, next_hop) else {
        debug!("ipv4: no route to {dst}");
        return false;
    };

    let mut header = Ipv4Header {
        version_ihl: 0x45,
        dscp_ecn: 0,
        total_len: U16::new((20 + payload.len()) as u16),
        identification: U16::new(0),
        flags_fragment: U16::new(0x4000), // don't fragment
        ttl: 64,
        protocol,
        checksum: U16::new(0),
        src: src.0,
        dst: dst.0,
    };
    header.checksum = U16::new(internet_checksum(header.as_bytes()));

    let mut packet = Vec::with_capacity(20 + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    ethernet::send_frame(interface, dst_mac, ETHERTYPE_IPV4, &packet);
    true
}
