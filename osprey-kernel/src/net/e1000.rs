//! Intel 82540EM (e1000) NIC driver.
//!
//! Classic descriptor-ring device: 256 RX and 256 TX legacy
//! descriptors, 2 KiB receive buffers, CRC stripped by hardware.
//! Receive is interrupt-driven; frames are handed straight to
//! `ethernet::process_packet` from the IRQ chain.

use alloc::sync::Arc;

use log::{debug, info};
use spinning_top::Spinlock;
use x86_64::PhysAddr;

use super::MacAddr;
use crate::memory::{PAGE_SIZE, phys_window, pmalloc};
use crate::pci::PciDevice;

const REG_CTRL: u32 = 0x0000;
const REG_ICR: u32 = 0x00C0;
const REG_IMS: u32 = 0x00D0;
const REG_IMC: u32 = 0x00D8;
const REG_RCTL: u32 = 0x0100;
const REG_TCTL: u32 = 0x0400;
const REG_TIPG: u32 = 0x0410;
const REG_RDBAL: u32 = 0x2800;
const REG_RDBAH: u32 = 0x2804;
const REG_RDLEN: u32 = 0x2808;
const REG_RDH: u32 = 0x2810;
const REG_RDT: u32 = 0x2818;
const REG_TDBAL: u32 = 0x3800;
const REG_TDBAH: u32 = 0x3804;
const REG_TDLEN: u32 = 0x3808;
const REG_TDH: u32 = 0x3810;
const REG_TDT: u32 = 0x3818;
const REG_MTA: u32 = 0x5200;
const REG_RAL0: u32 = 0x5400;
const REG_RAH0: u32 = 0x5404;

const CTRL_SLU: u32 = 1 << 6;
const CTRL_RST: u32 = 1 << 26;

const RCTL_EN: u32 = 1 << 1;
const RCTL_BAM: u32 = 1 << 15;
const RCTL_SECRC: u32 = 1 << 26;

const TCTL_EN: u32 = 1 << 1;
const TCTL_PSP: u32 = 1 << 3;

const IMS_RXT0: u32 = 1 << 7;
const IMS_LSC: u32 = 1 << 2;

const TDESC_CMD_EOP: u8 = 1 << 0;
const TDESC_CMD_IFCS: u8 = 1 << 1;
const TDESC_CMD_RS: u8 = 1 << 3;
const TDESC_STA_DD: u8 = 1 << 0;

const RDESC_STA_DD: u8 = 1 << 0;
const RDESC_STA_EOP: u8 = 1 << 1;

const NUM_RX_DESC: usize = 256;
const NUM_TX_DESC: usize = 256;
const RX_BUFFER_SIZE: usize = 2048;

#[repr(C)]
#[derive(Clone, Copy)]
struct RxDescriptor {
    addr: u64,
    length: u16,
    checksum: u16,
    status: u8,
    errors: u8,
    special: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TxDescriptor {
    addr: u64,
    length: u16,
    cso: u8,
    cmd: u8,
    status: u8,
    css: u8,
    special: u16,
}

struct Rings {
    rx_descs: *mut RxDescriptor,
    tx_descs: *mut TxDescriptor,
    rx_buffers: [usize; NUM_RX_DESC],
    rx_tail: usize,
    tx_tail: usize,
}

// Safety: only touched under the device lock.
unsafe impl Send for Rings {}

pub struct E1000 {
    mmio_base: u64,
    mac: MacAddr,
    rings: Spinlock<Rings>,
}

impl E1000 {
    fn read(&self, reg: u32) -> u32 {
        unsafe { core::ptr::read_volatile((self.mmio_base + reg as u64) as *const u32) }
    }

    fn write(&self, reg: u32, value: u32) {
        unsafe { core::ptr::write_volatile((self.mmio_base + reg as u64) as *mut u32, value) }
    }
}

/// Allocate physically contiguous descriptor storage. The rings fit a
/// single frame each (256 descriptors * 16 bytes).
fn alloc_dma_page() -> (usize, *mut u8) {
    let phys = pmalloc::pmalloc(1);
    assert!(phys != 0, "out of memory for NIC rings");
    let virt = phys_window::to_virt_mut::<u8>(phys);
    unsafe {
        core::ptr::write_bytes(virt, 0, PAGE_SIZE);
    }
    (phys, virt)
}

/// PCI driver entry, matched on vendor 8086 device 100E.
pub fn init(pci: &PciDevice) {
    let Some(bar0) = pci.bar_mmio(0) else {
        debug!("e1000: BAR0 is not MMIO");
        return;
    };
    pci.enable_bus_master();

    let mmio_base = crate::memory::map_mmio(PhysAddr::new(bar0), 0x20000).as_u64();

    let (rx_phys, rx_virt) = alloc_dma_page();
    let (tx_phys, tx_virt) = alloc_dma_page();

    let mut rings = Rings {
        rx_descs: rx_virt as *mut RxDescriptor,
        tx_descs: tx_virt as *mut TxDescriptor,
        rx_buffers: [0; NUM_RX_DESC],
        rx_tail: 0,
        tx_tail: 0,
    };

    // Two descriptors share each 4 KiB receive page.
    for i in 0..NUM_RX_DESC {
        if i % 2 == 0 {
            let (phys, _) = alloc_dma_page();
            rings.rx_buffers[i] = phys;
            rings.rx_buffers[i + 1] = phys + RX_BUFFER_SIZE;
        }
        unsafe {
            (*rings.rx_descs.add(i)).addr = rings.rx_buffers[i] as u64;
        }
    }

    let regs = |reg: u32| unsafe {
        core::ptr::read_volatile((mmio_base + reg as u64) as *const u32)
    };
    let regs_write = |reg: u32, value: u32| unsafe {
        core::ptr::write_volatile((mmio_base + reg as u64) as *mut u32, value)
    };

    // Reset, then bring the link up.
    regs_write(REG_IMC, 0xFFFF_FFFF);
    regs_write(REG_CTRL, regs(REG_CTRL) | CTRL_RST);
    while regs(REG_CTRL) & CTRL_RST != 0 {
        core::hint::spin_loop();
    }
    regs_write(REG_IMC, 0xFFFF_FFFF);
    regs_write(REG_CTRL, regs(REG_CTRL) | CTRL_SLU);

    // QEMU programs the permanent MAC into RAL/RAH.
    let ral = regs(REG_RAL0);
    let rah = regs(REG_RAH0);
    let mac = MacAddr([
        ral as u8,
        (ral >> 8) as u8,
        (ral >> 16) as u8,
        (ral >> 24) as u8,
        rah as u8,
        (rah >> 8) as u8,
    ]);
    let device = Arc::new(E1000 {
        mmio_base,
        mac,
        rings: Spinlock::new(rings),
    });

    for i in 0..128 {
        device.write(REG_MTA + i * 4, 0);
    }

    device.write(REG_RDBAL, rx_phys as u32);
    device.write(REG_RDBAH, (rx_phys as u64 >> 32) as u32);
    device.write(REG_RDLEN, (NUM_RX_DESC * size_of::<RxDescriptor>()) as u32);
    device.write(REG_RDH, 0);
    device.write(REG_RDT, (NUM_RX_DESC - 1) as u32);
    device.write(REG_RCTL, RCTL_EN | RCTL_BAM | RCTL_SECRC);

    device.write(REG_TDBAL, tx_phys as u32);
    device.write(REG_TDBAH, (tx_phys as u64 >> 32) as u32);
    device.write(REG_TDLEN, (NUM_TX_DESC * size_of::<TxDescriptor>()) as u32);
    device.write(REG_TDH, 0);
    device.write(REG_TDT, 0);
    device.write(REG_TCTL, TCTL_EN | TCTL_PSP | (0x10 << 4) | (0x40 << 12));
    device.write(REG_TIPG, 10 | (8 << 10) | (6 << 20));

    // The IRQ handler only acknowledges the device; frames are drained
    // by a dedicated receive thread so the stack's locks never get
    // taken from interrupt context.
    let vector = crate::interrupts::alloc_vector(true).expect("free interrupt vector for NIC");
    let irq_device = device.clone();
    crate::interrupts::register_irq_handler(
        vector,
        alloc::boxed::Box::new(move |_frame| {
            // Reading ICR clears the asserted causes.
            let cause = irq_device.read(REG_ICR);
            if cause == 0 {
                return false;
            }
            RX_EVENT.signal_one();
            true
        }),
    );
    pci.route_interrupt(vector);

    let interface = super::register_nic(alloc::boxed::Box::new(E1000Nic {
        device: device.clone(),
    }));
    spawn_rx_thread(device.clone(), interface);

    device.write(REG_ICR, 0xFFFF_FFFF);
    device.write(REG_IMS, IMS_RXT0 | IMS_LSC);

    info!("e1000: {} up", mac);
}

static RX_EVENT: crate::sched::event::Event = crate::sched::event::Event::new();

fn spawn_rx_thread(device: Arc<E1000>, interface: Arc<super::Interface>) {
    use crate::sched::thread::{Thread, ThreadEntry};
    let thread = Thread::new(
        "e1000 rx",
        crate::cpu::pick_cpu(),
        crate::sched::kernel_process(),
        ThreadEntry::Kernel(alloc::boxed::Box::new(move || {
            loop {
                // The poll fallback covers edges lost while draining.
                RX_EVENT.wait_with_timeout(100_000);
                receive_all(&device, &interface);
            }
        })),
    );
    crate::sched::spawn(&thread);
}

/// Drain every completed receive descriptor into the stack.
fn receive_all(device: &E1000, interface: &Arc<super::Interface>) {
    loop {
        let frame = {
            let mut rings = device.rings.lock();
            let i = rings.rx_tail;
            let desc = unsafe { &mut *rings.rx_descs.add(i) };
            if desc.status & RDESC_STA_DD == 0 {
                break;
            }
            let mut frame = alloc::vec::Vec::new();
            if desc.status & RDESC_STA_EOP != 0 && desc.errors == 0 {
                let len = (desc.length as usize).min(RX_BUFFER_SIZE);
                let buf = phys_window::to_virt::<u8>(rings.rx_buffers[i]);
                frame.extend_from_slice(unsafe { core::slice::from_raw_parts(buf, len) });
            }
            desc.status = 0;
            rings.rx_tail = (i + 1) % NUM_RX_DESC;
            device.write(REG_RDT, i as u32);
            frame
        };
        if !frame.is_empty() {
            super::ethernet::process_packet(interface, &frame);
        }
    }
}

struct E1000Nic {
    device: Arc<E1000>,
}

impl super::Nic for E1000Nic {
    fn mac(&self) -> MacAddr {
        self.device.mac
    }

    fn send(&self, frame: &[u8]) {
        let device = &self.device;
        let mut rings = device.rings.lock();
        let i = rings.tx_tail;
        let desc = unsafe { &mut *rings.tx_descs.add(i) };

        // Frames are small; stage each one in its own DMA page and
        // reclaim it once the descriptor reports done.
        let (phys, virt) = alloc_dma_page();
        let len = frame.len().min(PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), virt, len);
        }

        desc.addr = phys as u64;
        desc.length = len as u16;
        desc.cmd = TDESC_CMD_EOP | TDESC_CMD_IFCS | TDESC_CMD_RS;
        desc.status = 0;

        rings.tx_tail = (i + 1) % NUM_TX_DESC;
        device.write(REG_TDT, rings.tx_tail as u32);

        // Synchronous completion keeps the buffer lifetime trivial.
        let mut spins = 0u32;
        while unsafe { (*rings.tx_descs.add(i)).status } & TDESC_STA_DD == 0 {
            core::hint::spin_loop();
            spins += 1;
            if spins > 10_000_000 {
                break;
            }
        }
        pmalloc::pfree(phys, 1);
    }
}
