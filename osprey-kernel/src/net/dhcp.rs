//! DHCP client.
//!
//! One kernel thread per NIC runs the DISCOVER → OFFER → REQUEST → ACK
//! exchange at boot and publishes the lease on the interface; callers
//! needing an address block on `ip_available_event`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, warn};
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Interface, Ipv4Addr, Ipv4Config};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_MAGIC: u32 = 0x6382_5363;

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_LIST: u8 = 55;
const OPT_END: u8 = 255;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DhcpHeader {
    op: u8,
    htype: u8,
    hlen: u8,
    hops: u8,
    xid: U32,
    secs: U16,
    flags: U16,
    ciaddr: [u8; 4],
    yiaddr: [u8; 4],
    siaddr: [u8; 4],
    giaddr: [u8; 4],
    chaddr: [u8; 16],
    sname: [u8; 64],
    file: [u8; 128],
    magic: U32,
}

fn build_packet(interface: &Interface, xid: u32, msg: u8, requested: Option<Ipv4Addr>, server: Option<Ipv4Addr>) -> Vec<u8> {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&interface.mac().0);

    let header = DhcpHeader {
        op: OP_REQUEST,
        htype: 1,
        hlen: 6,
        hops: 0,
        xid: U32::new(xid),
        secs: U16::new(0),
        flags: U16::new(0x8000), // ask for broadcast replies
        ciaddr: [0; 4],
        yiaddr: [0; 4],
        siaddr: [0; 4],
        giaddr: [0; 4],
        chaddr,
        sname: [0; 64],
        file: [0; 128],
        magic: U32::new(DHCP_MAGIC),
    };

    let mut packet = Vec::with_capacity(300);
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, msg]);
    if let Some(ip) = requested {
        packet.extend_from_slice(&[OPT_REQUESTED_IP, 4]);
        packet.extend_from_slice(&ip.0);
    }
    if let Some(ip) = server {
        packet.extend_from_slice(&[OPT_SERVER_ID, 4]);
        packet.extend_from_slice(&ip.0);
    }
    packet.extend_from_slice(&[OPT_PARAM_LIST, 3, OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS]);
    packet.push(OPT_END);
    packet
}

struct Offer {
    ip: Ipv4Addr,
    server: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Ipv4Addr,
    dns: Ipv4Addr,
}

fn parse_reply(data: &[u8], xid: u32, expect: u8) -> Option<Offer> {
    let (header, options) = DhcpHeader::ref_from_prefix(data).ok()?;
    if header.op != OP_REPLY || header.xid.get() != xid || header.magic.get() != DHCP_MAGIC {
        return None;
    }

    let mut offer = Offer {
        ip: Ipv4Addr(header.yiaddr),
        server: Ipv4Addr::ZERO,
        mask: Ipv4Addr([255, 255, 255, 0]),
        gateway: Ipv4Addr::ZERO,
        dns: Ipv4Addr::ZERO,
    };

    let mut msg_type = 0;
    let mut i = 0;
    while i + 1 < options.len() {
        let opt = options[i];
        if opt == OPT_END {
            break;
        }
        let len = options[i + 1] as usize;
        let value = options.get(i + 2..i + 2 + len)?;
        match (opt, len) {
            (OPT_MESSAGE_TYPE, 1) => msg_type = value[0],
            (OPT_SUBNET_MASK, 4) => offer.mask = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            (OPT_ROUTER, 4) => offer.gateway = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            (OPT_DNS, 4) => offer.dns = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            (OPT_SERVER_ID, 4) => offer.server = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            _ => {}
        }
        i += 2 + len;
    }

    (msg_type == expect).then_some(offer)
}

/// Spawn the DHCP client thread for `interface`.
pub fn start_client(interface: Arc<Interface>) {
    use crate::sched::thread::{Thread, ThreadEntry};
    let thread = Thread::new(
        "dhcp client",
        crate::cpu::pick_cpu(),
        crate::sched::kernel_process(),
        ThreadEntry::Kernel(Box::new(move || client(interface))),
    );
    crate::sched::spawn(&thread);
}

fn client(interface: Arc<Interface>) {
    let Some(endpoint) = super::udp::bind(DHCP_CLIENT_PORT) else {
        warn!("dhcp: client port already bound");
        return;
    };

    let xid = crate::random::random_u32();

    'retry: for attempt in 0.. {
        if attempt > 0 {
            crate::sched::sleep_us(2_000_000 << attempt.min(4));
        }

        let discover = build_packet(&interface, xid, MSG_DISCOVER, None, None);
        super::udp::send_to(
            &interface,
            DHCP_CLIENT_PORT,
            Ipv4Addr::BROADCAST,
            DHCP_SERVER_PORT,
            &discover,
        );
        debug!("dhcp: sent DISCOVER on {}", interface.mac());

        let offer = loop {
            if !endpoint.event.wait_with_timeout(3_000_000) {
                continue 'retry;
            }
            let Some(datagram) = endpoint.queue.lock().pop_front() else {
                continue;
            };
            if let Some(offer) = parse_reply(&datagram.data, xid, MSG_OFFER) {
                break offer;
            }
        };

        let request = build_packet(&interface, xid, MSG_REQUEST, Some(offer.ip), Some(offer.server));
        super::udp::send_to(
            &interface,
            DHCP_CLIENT_PORT,
            Ipv4Addr::BROADCAST,
            DHCP_SERVER_PORT,
            &request,
        );

        let ack = loop {
            if !endpoint.event.wait_with_timeout(3_000_000) {
                continue 'retry;
            }
            let Some(datagram) = endpoint.queue.lock().pop_front() else {
                continue;
            };
            if let Some(ack) = parse_reply(&datagram.data, xid, MSG_ACK) {
                break ack;
            }
        };

        info!(
            "dhcp: {} leased {} (mask {}, gw {})",
            interface.mac(),
            ack.ip,
            ack.mask,
            ack.gateway
        );
        *interface.config.lock() = Some(Ipv4Config {
            ip: ack.ip,
            mask: ack.mask,
            gateway: ack.gateway,
            dns: ack.dns,
        });
        interface.ip_available_event.signal_all();
        return;
    }
}
