//! The network stack.
//!
//! NICs push raw Ethernet frames into `ethernet::process_packet`; the
//! stack dispatches by EtherType to ARP or IPv4 and upward to UDP/TCP.
//! Each NIC carries its own IPv4 configuration, filled in by the DHCP
//! client thread started at boot; senders that need an address block on
//! the interface's `ip_available_event`.

pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod e1000;
pub mod ethernet;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::info;
use spinning_top::{RwSpinlock, Spinlock};

use crate::sched::event::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);
}

impl core::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const ZERO: Ipv4Addr = Ipv4Addr([0, 0, 0, 0]);
    pub const BROADCAST: Ipv4Addr = Ipv4Addr([255, 255, 255, 255]);

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_u32(val: u32) -> Self {
        Ipv4Addr(val.to_be_bytes())
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// An interface's IPv4 configuration, as learned from DHCP.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Config {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

impl Ipv4Config {
    /// Whether `target` sits on this interface's subnet.
    pub fn is_local(&self, target: Ipv4Addr) -> bool {
        let mask = self.mask.to_u32();
        self.ip.to_u32() & mask == target.to_u32() & mask
    }
}

/// A network interface driver.
pub trait Nic: Send + Sync {
    fn mac(&self) -> MacAddr;
    /// Transmit one Ethernet frame.
    fn send(&self, frame: &[u8]);
}

/// A registered interface: the driver plus stack-side state.
pub struct Interface {
    pub nic: Box<dyn Nic>,
    pub config: Spinlock<Option<Ipv4Config>>,
    /// Signalled once DHCP completes on this interface.
    pub ip_available_event: Event,
}

impl Interface {
    pub fn mac(&self) -> MacAddr {
        self.nic.mac()
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.config.lock().map(|c| c.ip)
    }

    /// Block until DHCP has configured this interface.
    pub fn wait_for_ip(&self) -> Ipv4Config {
        loop {
            if let Some(config) = *self.config.lock() {
                return config;
            }
            self.ip_available_event.wait();
        }
    }
}

static INTERFACES: RwSpinlock<Vec<Arc<Interface>>> = RwSpinlock::new(Vec::new());

/// Register a NIC with the stack and kick off its DHCP client.
pub fn register_nic(nic: Box<dyn Nic>) -> Arc<Interface> {
    let interface = Arc::new(Interface {
        nic,
        config: Spinlock::new(None),
        ip_available_event: Event::new(),
    });
    info!("net: registered interface {}", interface.mac());
    INTERFACES.write().push(interface.clone());
    dhcp::start_client(interface.clone());
    interface
}

/// The interface frames get routed out of (single-homed: the first).
pub fn default_interface() -> Option<Arc<Interface>> {
    INTERFACES.read().first().cloned()
}

pub fn interfaces() -> Vec<Arc<Interface>> {
    INTERFACES.read().clone()
}
