#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::SysError;
use osprey_kernel::net::tcp::{self, TcpConnection, TcpState};
use osprey_kernel::net::{Interface, Ipv4Addr, Ipv4Config, MacAddr, Nic, ethernet};
use osprey_kernel::sched;
use osprey_kernel::sched::event::Event;
use spinning_top::Spinlock;

osprey_kernel::test_harness!(tcp_echo_end_to_end);

const OUR_IP: Ipv4Addr = Ipv4Addr([10, 0, 2, 15]);
const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 2, 99]);
const PEER_MAC: MacAddr = MacAddr([0x52, 0x54, 0, 0, 0, 0x63]);
const PEER_PORT: u16 = 40000;
const LISTEN_PORT: u16 = 9000;

/// A NIC that records every transmitted frame.
struct CaptureNic {
    frames: Arc<Spinlock<Vec<Vec<u8>>>>,
}

impl Nic for CaptureNic {
    fn mac(&self) -> MacAddr {
        MacAddr([0x52, 0x54, 0, 0, 0, 0x01])
    }

    fn send(&self, frame: &[u8]) {
        self.frames.lock().push(frame.to_vec());
    }
}

fn test_interface(frames: Arc<Spinlock<Vec<Vec<u8>>>>) -> Arc<Interface> {
    Arc::new(Interface {
        nic: Box::new(CaptureNic { frames }),
        config: Spinlock::new(Some(Ipv4Config {
            ip: OUR_IP,
            mask: Ipv4Addr([255, 255, 255, 0]),
            gateway: Ipv4Addr([10, 0, 2, 2]),
            dns: Ipv4Addr([10, 0, 2, 3]),
        })),
        ip_available_event: Event::new(),
    })
}

/// Feed a crafted peer ARP request so the stack learns the peer's MAC
/// without blocking on resolution.
fn seed_arp(interface: &Arc<Interface>) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&PEER_MAC.0);
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 1]);
    frame.extend_from_slice(&PEER_MAC.0);
    frame.extend_from_slice(&PEER_IP.0);
    frame.extend_from_slice(&[0; 6]);
    frame.extend_from_slice(&OUR_IP.0);
    ethernet::process_packet(interface, &frame);
}

/// Build the ethernet+IP+TCP frame a peer would send us.
#[allow(clippy::too_many_arguments)]
fn peer_segment(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    // Ethernet
    frame.extend_from_slice(&[0x52, 0x54, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&PEER_MAC.0);
    frame.extend_from_slice(&[0x08, 0x00]);
    // IPv4
    let total = 20 + 20 + payload.len();
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0x40, 0, 64, 6, 0, 0]);
    frame.extend_from_slice(&PEER_IP.0);
    frame.extend_from_slice(&OUR_IP.0);
    // TCP (checksums are not validated on input)
    frame.extend_from_slice(&PEER_PORT.to_be_bytes());
    frame.extend_from_slice(&LISTEN_PORT.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&ack.to_be_bytes());
    frame.push(5 << 4);
    frame.push(flags);
    frame.extend_from_slice(&0x4000u16.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Find the first captured TCP segment matching `want_flags`, returning
/// (seq, ack, payload).
fn captured_segment(
    frames: &Arc<Spinlock<Vec<Vec<u8>>>>,
    want_flags: u8,
) -> Option<(u32, u32, Vec<u8>)> {
    for frame in frames.lock().iter() {
        if frame.len() < 14 + 20 + 20 || frame[12..14] != [0x08, 0x00] || frame[23] != 6 {
            continue;
        }
        let tcp = &frame[34..];
        let flags = tcp[13];
        if flags & want_flags != want_flags {
            continue;
        }
        let seq = u32::from_be_bytes(tcp[4..8].try_into().unwrap());
        let ack = u32::from_be_bytes(tcp[8..12].try_into().unwrap());
        let data_offset = ((tcp[12] >> 4) as usize) * 4;
        let total = u16::from_be_bytes(frame[16..18].try_into().unwrap()) as usize;
        let payload = frame[34 + data_offset..14 + total].to_vec();
        return Some((seq, ack, payload));
    }
    None
}

fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        sched::sleep_us(10_000);
    }
    panic!("condition did not become true within 2s");
}

/// Spec scenario: listen on 9000, peer connects and sends "AB", we echo
/// it back, then close from our side and the peer acknowledges.
fn tcp_echo_end_to_end() {
    let frames = Arc::new(Spinlock::new(Vec::new()));
    let interface = test_interface(frames.clone());
    seed_arp(&interface);

    let listener = TcpConnection::listen(LISTEN_PORT).expect("port 9000 free");

    // Peer SYN; the child's worker answers with SYN|ACK.
    let peer_iss = 0x1000u32;
    ethernet::process_packet(&interface, &peer_segment(peer_iss, 0, tcp::SYN, &[]));
    wait_until(|| captured_segment(&frames, tcp::SYN | tcp::ACK).is_some());
    let (server_iss, synack_ack, _) = captured_segment(&frames, tcp::SYN | tcp::ACK).unwrap();
    assert_eq!(synack_ack, peer_iss.wrapping_add(1));

    // Complete the handshake.
    ethernet::process_packet(
        &interface,
        &peer_segment(
            peer_iss.wrapping_add(1),
            server_iss.wrapping_add(1),
            tcp::ACK,
            &[],
        ),
    );

    let connection = listener.accept(false).expect("handshake completed");
    assert_eq!(connection.state(), TcpState::Connected);

    // Peer sends "AB"; it must arrive in order.
    ethernet::process_packet(
        &interface,
        &peer_segment(
            peer_iss.wrapping_add(1),
            server_iss.wrapping_add(1),
            tcp::ACK | tcp::PSH,
            b"AB",
        ),
    );
    let mut buf = [0u8; 8];
    let n = connection.receive(&mut buf, false).unwrap();
    assert_eq!(&buf[..n], b"AB");

    // Echo it back and check the wire.
    frames.lock().clear();
    assert_eq!(connection.send(b"AB", false).unwrap(), 2);
    wait_until(|| {
        captured_segment(&frames, tcp::ACK)
            .map(|(_, _, payload)| payload == b"AB")
            .unwrap_or(false)
    });
    let (data_seq, _, _) = captured_segment(&frames, tcp::ACK).unwrap();
    assert_eq!(data_seq, server_iss.wrapping_add(1));

    // Peer acknowledges the data.
    ethernet::process_packet(
        &interface,
        &peer_segment(
            peer_iss.wrapping_add(3),
            server_iss.wrapping_add(3),
            tcp::ACK,
            &[],
        ),
    );

    // Our side closes: FIN goes out, the peer FIN-ACKs, and the
    // connection reports closed to further receives.
    frames.lock().clear();
    connection.disconnect();
    assert_eq!(connection.state(), TcpState::SentFin);
    wait_until(|| captured_segment(&frames, tcp::FIN).is_some());
    let (fin_seq, _, _) = captured_segment(&frames, tcp::FIN).unwrap();

    ethernet::process_packet(
        &interface,
        &peer_segment(
            peer_iss.wrapping_add(3),
            fin_seq.wrapping_add(1),
            tcp::ACK | tcp::FIN,
            &[],
        ),
    );
    wait_until(|| connection.state() == TcpState::None);
    assert_eq!(
        connection.receive(&mut buf, false),
        Err(SysError::ConnectionClosed)
    );
}
