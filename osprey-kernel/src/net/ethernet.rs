//! Ethernet framing and dispatch.

use alloc::sync::Arc;
use alloc::vec::Vec;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Interface, MacAddr};

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Minimum frame length on the wire (without FCS).
const MIN_FRAME_LEN: usize = 60;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: U16,
}

/// Entry point for frames coming off a NIC.
pub fn process_packet(interface: &Arc<Interface>, frame: &[u8]) {
    let Ok((header, payload)) = EthernetHeader::ref_from_prefix(frame) else {
        return;
    };

    match header.ethertype.get() {
        ETHERTYPE_ARP => super::arp::process_packet(interface, payload),
        ETHERTYPE_IPV4 => super::ipv4::process_packet(interface, payload),
        _ => {}
    }
}

/// Build and transmit one frame out of `interface`.
pub fn send_frame(interface: &Interface, dst: MacAddr, ethertype: u16, payload: &[u8]) {
    let header = EthernetHeader {
        dst: dst.0,
        src: interface.mac().0,
        ethertype: U16::new(ethertype),
    };
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN.max(14 + payload.len()));
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame.resize(frame.len().max(MIN_FRAME_LEN), 0);
    interface.nic.send(&frame);
}
