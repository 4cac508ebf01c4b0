//! ARP: IPv4 → MAC resolution with a local cache.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spinning_top::Spinlock;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::ethernet::{self, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use super::{Interface, Ipv4Addr, MacAddr};
use crate::sched::event::Event;

const ARP_HW_ETHERNET: u16 = 1;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ArpPacket {
    hw_type: U16,
    proto_type: U16,
    hw_len: u8,
    proto_len: u8,
    operation: U16,
    sender_mac: [u8; 6],
    sender_ip: [u8; 4],
    target_mac: [u8; 6],
    target_ip: [u8; 4],
}

static ARP_TABLE: Spinlock<BTreeMap<u32, MacAddr>> = Spinlock::new(BTreeMap::new());
/// Signalled whenever a reply lands, waking resolvers to re-check.
static ARP_EVENT: Event = Event::new();

pub fn lookup(ip: Ipv4Addr) -> Option<MacAddr> {
    ARP_TABLE.lock().get(&ip.to_u32()).copied()
}

fn insert(ip: Ipv4Addr, mac: MacAddr) {
    ARP_TABLE.lock().insert(ip.to_u32(), mac);
    ARP_EVENT.signal_all();
}

/// Handle an incoming ARP payload: learn the sender, answer requests
/// for our address.
pub fn process_packet(interface: &Arc<Interface>, payload: &[u8]) {
    let Ok((packet, _)) = ArpPacket::ref_from_prefix(payload) else {
        return;
    };
    if packet.hw_type.get() != ARP_HW_ETHERNET || packet.proto_type.get() != ETHERTYPE_IPV4 {
        return;
    }

    let sender_ip = Ipv4Addr(packet.sender_ip);
    let sender_mac = MacAddr(packet.sender_mac);
    if sender_ip != Ipv4Addr::ZERO {
        insert(sender_ip, sender_mac);
    }

    let our_ip = interface.ip();
    if packet.operation.get() == ARP_OP_REQUEST
        && our_ip == Some(Ipv4Addr(packet.target_ip))
    {
        send(
            interface,
            ARP_OP_REPLY,
            sender_mac,
            sender_ip,
            Ipv4Addr(packet.target_ip),
        );
    }
}

fn send(interface: &Interface, op: u16, target_mac: MacAddr, target_ip: Ipv4Addr, our_ip: Ipv4Addr) {
    let packet = ArpPacket {
        hw_type: U16::new(ARP_HW_ETHERNET),
        proto_type: U16::new(ETHERTYPE_IPV4),
        hw_len: 6,
        proto_len: 4,
        operation: U16::new(op),
        sender_mac: interface.mac().0,
        sender_ip: our_ip.0,
        target_mac: if op == ARP_OP_REQUEST {
            [0; 6]
        } else {
            target_mac.0
        },
        target_ip: target_ip.0,
    };
    let dst = if op == ARP_OP_REQUEST {
        MacAddr::BROADCAST
    } else {
        target_mac
    };
    ethernet::send_frame(interface, dst, ETHERTYPE_ARP, packet.as_bytes());
}

/// Resolve `ip` to a MAC, broadcasting requests and blocking (bounded)
/// until a reply arrives.
pub fn resolve(interface: &Interface, ip: Ipv4Addr) -> Option<MacAddr> {
    if ip == Ipv4Addr::BROADCAST {
        return Some(MacAddr::BROADCAST);
    }
    if let Some(mac) = lookup(ip) {
        return Some(mac);
    }

    let our_ip = interface.ip().unwrap_or(Ipv4Addr::ZERO);
    for _ in 0..4 {
        send(interface, ARP_OP_REQUEST, MacAddr::ZERO, ip, our_ip);
        // Replies signal the table event; re-check after each wake or
        // after 200 ms.
        ARP_EVENT.wait_with_timeout(200_000);
        if let Some(mac) = lookup(ip) {
            return Some(mac);
        }
    }
    None
}
