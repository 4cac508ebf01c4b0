//! Virtual CPUs.
//!
//! Each `VirtualCpu` owns a VMCS and a guest-state page shared with the
//! owning process. `run` enters the guest and fills in the exit reason
//! and parameters; userspace services the exit, pushes any changed
//! fields back with a `STATE_BITS_*` mask, and re-enters. The pending
//! exit (an IO IN or MMIO read waiting for its value) is completed on
//! the next `run`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use osprey_abi::evm::{
    self as abi, EvmExitIoIn, EvmExitIoOut, EvmExitMmioRead, EvmExitMmioWrite, EvmExitReason,
    EvmGuestState, EvmIrqInfo, EvmIrqType, EvmSegmentRegister,
};
use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;

use super::vmx::{self, GuestRegs, field};
use super::Evm;
use crate::irq_guard::IrqGuard;
use crate::memory::page_map::MapFlags;
use crate::memory::{PAGE_SIZE, phys_window, pmalloc};
use crate::sched::process::Process;

/// Segment order in both the VMCS field layout and the state page.
const SEGMENT_COUNT: usize = 10; // es cs ss ds fs gs ldtr tr gdtr idtr

/// An exit waiting for userspace to provide a value.
enum PendingExit {
    IoIn { size: u8 },
    MmioRead { register: usize, size: u8 },
}

pub struct VirtualCpu {
    pub evm: Arc<Evm>,
    vmcs_phys: usize,
    state_page_phys: usize,
    user_state_addr: AtomicU64,
    launched: AtomicBool,
    regs: Spinlock<GuestRegs>,
    pending_exit: Spinlock<Option<PendingExit>>,
    pending_irq: Spinlock<Option<EvmIrqInfo>>,
}

impl VirtualCpu {
    /// Create a vCPU with its guest-state page mapped into `process`.
    /// Returns the vCPU and the user address of the state page.
    pub fn create(evm: &Arc<Evm>, process: &Arc<Process>) -> SysResult<(Arc<VirtualCpu>, u64)> {
        let vmcs_phys = vmx::alloc_vmcs()?;

        let state_page_phys = pmalloc::pmalloc(1);
        if state_page_phys == 0 {
            return Err(SysError::NoMem);
        }
        unsafe {
            core::ptr::write_bytes(
                phys_window::to_virt_mut::<u8>(state_page_phys),
                0,
                PAGE_SIZE,
            );
        }

        let user_addr = process.alloc_user_range(PAGE_SIZE);
        process.page_map.map(
            user_addr,
            x86_64::PhysAddr::new(state_page_phys as u64),
            MapFlags {
                user: true,
                writable: true,
                executable: false,
                uncached: false,
            },
        );

        let vcpu = Arc::new(VirtualCpu {
            evm: evm.clone(),
            vmcs_phys,
            state_page_phys,
            user_state_addr: AtomicU64::new(user_addr.as_u64()),
            launched: AtomicBool::new(false),
            regs: Spinlock::new(GuestRegs::default()),
            pending_exit: Spinlock::new(None),
            pending_irq: Spinlock::new(None),
        });

        {
            let _irq = IrqGuard::new();
            vmx::vmptrld(vmcs_phys);
            vmx::setup_controls(evm.ept_pointer());
            vcpu.init_guest_defaults();
        }

        // A fresh real-mode state page mirrors the defaults.
        let state = vcpu.state_page();
        state.rflags = 0x2;
        state.cr0 = vmx::vmread(field::GUEST_CR0);
        state.cr4 = vmx::vmread(field::GUEST_CR4);
        for i in 0..SEGMENT_COUNT {
            state_segment_mut(state, i).limit = 0xffff;
        }

        evm.vcpus.lock().push(vcpu.clone());
        Ok((vcpu, user_addr.as_u64()))
    }

    /// The shared state page, kernel view.
    #[allow(clippy::mut_from_ref)]
    fn state_page(&self) -> &mut EvmGuestState {
        unsafe { &mut *phys_window::to_virt_mut::<EvmGuestState>(self.state_page_phys) }
    }

    /// Program real-mode reset state for an unrestricted guest.
    fn init_guest_defaults(&self) {
        use x86_64::registers::model_specific::Msr;
        // CR0/CR4 fixed bits, with PE/PG left to the guest
        // (unrestricted guest allows both clear).
        let cr0_fixed0 = unsafe { Msr::new(0x486).read() } & !0x8000_0001;
        let cr4_fixed0 = unsafe { Msr::new(0x488).read() };
        vmx::vmwrite(field::GUEST_CR0, cr0_fixed0);
        vmx::vmwrite(field::GUEST_CR3, 0);
        vmx::vmwrite(field::GUEST_CR4, cr4_fixed0);
        vmx::vmwrite(field::GUEST_RIP, 0);
        vmx::vmwrite(field::GUEST_RSP, 0);
        vmx::vmwrite(field::GUEST_RFLAGS, 0x2);
        vmx::vmwrite(field::GUEST_ACTIVITY_STATE, 0);
        vmx::vmwrite(field::GUEST_GDTR_BASE, 0);
        vmx::vmwrite(field::GUEST_IDTR_BASE, 0);

        for i in 0..8 {
            let access = match i {
                1 => 0x9b,      // cs
                6 => 0x82,      // ldtr
                7 => 0x8b,      // tr
                _ => 0x93,      // data segments
            };
            vmx::vmwrite(field::GUEST_ES_SELECTOR + i * 2, 0);
            vmx::vmwrite(field::GUEST_ES_BASE + i * 2, 0);
            vmx::vmwrite(field::GUEST_ES_LIMIT + i * 2, 0xffff);
            vmx::vmwrite(field::GUEST_ES_ACCESS_RIGHTS + i * 2, access);
        }
    }

    /// Copy state-page fields into the VMCS/register file, per mask.
    pub fn write_state(&self, mask: u32) -> SysResult<()> {
        let _irq = IrqGuard::new();
        vmx::vmptrld(self.vmcs_phys);
        let state = self.state_page();

        if mask & abi::STATE_BITS_GP_REGS != 0 {
            let mut regs = self.regs.lock();
            regs.rax = state.rax;
            regs.rbx = state.rbx;
            regs.rcx = state.rcx;
            regs.rdx = state.rdx;
            regs.rdi = state.rdi;
            regs.rsi = state.rsi;
            regs.rbp = state.rbp;
            regs.r8 = state.r8;
            regs.r9 = state.r9;
            regs.r10 = state.r10;
            regs.r11 = state.r11;
            regs.r12 = state.r12;
            regs.r13 = state.r13;
            regs.r14 = state.r14;
            regs.r15 = state.r15;
        }
        if mask & abi::STATE_BITS_RIP != 0 {
            vmx::vmwrite(field::GUEST_RIP, state.rip);
        }
        if mask & abi::STATE_BITS_RSP != 0 {
            vmx::vmwrite(field::GUEST_RSP, state.rsp);
        }
        if mask & abi::STATE_BITS_RFLAGS != 0 {
            // Bit 1 is architecturally fixed.
            vmx::vmwrite(field::GUEST_RFLAGS, state.rflags | 0x2);
        }
        if mask & abi::STATE_BITS_SEG_REGS != 0 {
            for i in 0..8 {
                let seg = *state_segment_mut(state, i);
                vmx::vmwrite(field::GUEST_ES_SELECTOR + i as u32 * 2, seg.selector as u64);
                vmx::vmwrite(field::GUEST_ES_BASE + i as u32 * 2, seg.base);
                vmx::vmwrite(field::GUEST_ES_LIMIT + i as u32 * 2, seg.limit as u64);
            }
            vmx::vmwrite(field::GUEST_GDTR_BASE, state.gdtr.base);
            vmx::vmwrite(field::GUEST_IDTR_BASE, state.idtr.base);
        }
        if mask & abi::STATE_BITS_CONTROL_REGS != 0 {
            vmx::vmwrite(field::GUEST_CR0, state.cr0);
            vmx::vmwrite(field::GUEST_CR3, state.cr3);
            vmx::vmwrite(field::GUEST_CR4, state.cr4);
        }
        Ok(())
    }

    /// Copy VMCS/register state out to the state page, per mask.
    pub fn read_state(&self, mask: u32) -> SysResult<()> {
        let _irq = IrqGuard::new();
        vmx::vmptrld(self.vmcs_phys);
        let state = self.state_page();

        if mask & abi::STATE_BITS_GP_REGS != 0 {
            let regs = self.regs.lock();
            state.rax = regs.rax;
            state.rbx = regs.rbx;
            state.rcx = regs.rcx;
            state.rdx = regs.rdx;
            state.rdi = regs.rdi;
            state.rsi = regs.rsi;
            state.rbp = regs.rbp;
            state.r8 = regs.r8;
            state.r9 = regs.r9;
            state.r10 = regs.r10;
            state.r11 = regs.r11;
            state.r12 = regs.r12;
            state.r13 = regs.r13;
            state.r14 = regs.r14;
            state.r15 = regs.r15;
        }
        if mask & abi::STATE_BITS_RIP != 0 {
            state.rip = vmx::vmread(field::GUEST_RIP);
        }
        if mask & abi::STATE_BITS_RSP != 0 {
            state.rsp = vmx::vmread(field::GUEST_RSP);
        }
        if mask & abi::STATE_BITS_RFLAGS != 0 {
            state.rflags = vmx::vmread(field::GUEST_RFLAGS);
        }
        if mask & abi::STATE_BITS_SEG_REGS != 0 {
            for i in 0..8 {
                let seg = state_segment_mut(state, i);
                seg.selector = vmx::vmread(field::GUEST_ES_SELECTOR + i as u32 * 2) as u16;
                seg.base = vmx::vmread(field::GUEST_ES_BASE + i as u32 * 2);
                seg.limit = vmx::vmread(field::GUEST_ES_LIMIT + i as u32 * 2) as u16;
            }
            state.gdtr.base = vmx::vmread(field::GUEST_GDTR_BASE);
            state.idtr.base = vmx::vmread(field::GUEST_IDTR_BASE);
        }
        if mask & abi::STATE_BITS_CONTROL_REGS != 0 {
            state.cr0 = vmx::vmread(field::GUEST_CR0);
            state.cr3 = vmx::vmread(field::GUEST_CR3);
            state.cr4 = vmx::vmread(field::GUEST_CR4);
        }
        Ok(())
    }

    /// Queue an interrupt or exception for injection at the next entry.
    pub fn trigger_irq(&self, info: EvmIrqInfo) -> SysResult<()> {
        if info.irq > 255 {
            return Err(SysError::InvalidArgument);
        }
        *self.pending_irq.lock() = Some(info);
        Ok(())
    }

    /// Complete a pending exit with the values userspace filled in.
    fn complete_pending(&self) {
        let Some(pending) = self.pending_exit.lock().take() else {
            return;
        };
        let state = self.state_page();
        let mut regs = self.regs.lock();
        match pending {
            PendingExit::IoIn { size } => {
                let value = unsafe { state.exit_state.io_in.ret_value } as u64;
                regs.rax = merge_sized(regs.rax, value, size);
            }
            PendingExit::MmioRead { register, size } => {
                let value = unsafe { state.exit_state.mmio_read.ret_value };
                self.write_guest_reg(&mut regs, register, value, size);
            }
        }
    }

    /// Read guest register `index` (ModRM numbering). RSP is not in the
    /// spilled register file; it lives in the VMCS.
    fn read_guest_reg(&self, regs: &mut GuestRegs, index: usize) -> u64 {
        if index == 4 {
            let _irq = IrqGuard::new();
            vmx::vmptrld(self.vmcs_phys);
            return vmx::vmread(field::GUEST_RSP);
        }
        *reg_slot(regs, index)
    }

    /// Write the low `size` bytes of guest register `index`.
    fn write_guest_reg(&self, regs: &mut GuestRegs, index: usize, value: u64, size: u8) {
        if index == 4 {
            let _irq = IrqGuard::new();
            vmx::vmptrld(self.vmcs_phys);
            let old = vmx::vmread(field::GUEST_RSP);
            vmx::vmwrite(field::GUEST_RSP, merge_sized(old, value, size));
            return;
        }
        let slot = reg_slot(regs, index);
        *slot = merge_sized(*slot, value, size);
    }

    /// Enter the guest until a reportable exit, filling the state page.
    pub fn run(&self) -> SysResult<()> {
        self.complete_pending();

        loop {
            let reason = {
                let _irq = IrqGuard::new();
                vmx::vmptrld(self.vmcs_phys);
                vmx::setup_host_state();

                if let Some(info) = self.pending_irq.lock().take() {
                    let ty = match info.ty {
                        EvmIrqType::Irq => 0u64,
                        EvmIrqType::Exception => 3u64,
                    };
                    let mut word = (1 << 31) | (ty << 8) | info.irq as u64;
                    if info.ty == EvmIrqType::Exception && has_error_code(info.irq) {
                        word |= 1 << 11;
                        vmx::vmwrite(field::ENTRY_EXCEPTION_ERROR, info.error as u64);
                    }
                    vmx::vmwrite(field::ENTRY_INTERRUPTION_INFO, word);
                }

                let mut regs = self.regs.lock();
                let launched = self.launched.load(Ordering::Relaxed);
                let reason = unsafe { vmx::enter(&mut regs, launched) };
                if reason != u64::MAX {
                    self.launched.store(true, Ordering::Relaxed);
                }
                reason
            };
            // Interrupts are enabled again here, so host IRQs that
            // forced the exit get serviced before we loop.

            if reason == u64::MAX {
                self.publish_exit(EvmExitReason::VmEnterFailed);
                return Ok(());
            }

            match (reason & 0xffff) as u16 {
                vmx::EXIT_REASON_HLT => {
                    self.advance_rip();
                    self.publish_exit(EvmExitReason::Halt);
                    return Ok(());
                }
                vmx::EXIT_REASON_TRIPLE_FAULT => {
                    self.publish_exit(EvmExitReason::TripleFault);
                    return Ok(());
                }
                vmx::EXIT_REASON_CPUID => {
                    self.advance_rip();
                    self.publish_exit(EvmExitReason::Cpuid);
                    return Ok(());
                }
                vmx::EXIT_REASON_IO => {
                    self.handle_io_exit();
                    return Ok(());
                }
                vmx::EXIT_REASON_EPT_VIOLATION => {
                    if self.handle_mmio_exit() {
                        return Ok(());
                    }
                    // Unmapped access we could not decode; surface a
                    // triple fault rather than spin forever.
                    self.publish_exit(EvmExitReason::TripleFault);
                    return Ok(());
                }
                // External interrupts and anything else transparent:
                // re-enter.
                _ => continue,
            }
        }
    }

    fn advance_rip(&self) {
        let _irq = IrqGuard::new();
        vmx::vmptrld(self.vmcs_phys);
        let rip = vmx::vmread(field::GUEST_RIP);
        let len = vmx::vmread(field::EXIT_INSTRUCTION_LENGTH);
        vmx::vmwrite(field::GUEST_RIP, rip + len);
    }

    /// Publish the exit reason and a full state snapshot to the page.
    fn publish_exit(&self, reason: EvmExitReason) {
        let _ = self.read_state(abi::STATE_BITS_ALL);
        self.state_page().exit_reason = reason;
    }

    fn handle_io_exit(&self) {
        let qualification = {
            let _irq = IrqGuard::new();
            vmx::vmptrld(self.vmcs_phys);
            vmx::vmread(field::EXIT_QUALIFICATION)
        };
        let size = ((qualification & 0x7) + 1) as u8;
        let is_in = qualification & (1 << 3) != 0;
        let port = (qualification >> 16) as u16;

        self.advance_rip();
        let state = self.state_page();
        if is_in {
            *self.pending_exit.lock() = Some(PendingExit::IoIn { size });
            state.exit_state.io_in = EvmExitIoIn {
                port,
                size,
                ret_value: 0,
            };
            self.publish_exit(EvmExitReason::IoIn);
            // publish_exit snapshots over exit_state; restore it.
            self.state_page().exit_state.io_in = EvmExitIoIn {
                port,
                size,
                ret_value: 0,
            };
        } else {
            let value = (self.regs.lock().rax & size_mask(size)) as u32;
            state.exit_state.io_out = EvmExitIoOut { port, size, value };
            self.publish_exit(EvmExitReason::IoOut);
            self.state_page().exit_state.io_out = EvmExitIoOut { port, size, value };
        }
    }

    /// Decode the faulting access and surface it as an MMIO exit.
    /// Returns false when the instruction is not one we understand.
    fn handle_mmio_exit(&self) -> bool {
        let (qualification, guest_phys, rip, cs_base) = {
            let _irq = IrqGuard::new();
            vmx::vmptrld(self.vmcs_phys);
            (
                vmx::vmread(field::EXIT_QUALIFICATION),
                vmx::vmread(field::GUEST_PHYSICAL_ADDRESS),
                vmx::vmread(field::GUEST_RIP),
                vmx::vmread(field::GUEST_ES_BASE + 2), // cs base
            )
        };
        let is_write = qualification & 0x2 != 0;

        // Fetch the instruction from guest memory. Guests running with
        // paging enabled are expected to identity-map their code.
        let mut bytes = [0u8; 15];
        let fetch_addr = cs_base + rip;
        for (i, byte) in bytes.iter_mut().enumerate() {
            let Some(host) = self.evm.guest_to_host(fetch_addr + i as u64) else {
                return false;
            };
            *byte = unsafe { *phys_window::to_virt::<u8>(host) };
        }

        let Some(decoded) = decode_mov(&bytes) else {
            return false;
        };

        self.advance_rip();
        let state = self.state_page();
        if is_write {
            let value = self.read_guest_reg(&mut self.regs.lock(), decoded.register)
                & size_mask(decoded.size);
            state.exit_state.mmio_write = EvmExitMmioWrite {
                guest_phys_addr: guest_phys,
                value,
                size: decoded.size,
            };
            self.publish_exit(EvmExitReason::MmioWrite);
            self.state_page().exit_state.mmio_write = EvmExitMmioWrite {
                guest_phys_addr: guest_phys,
                value,
                size: decoded.size,
            };
        } else {
            *self.pending_exit.lock() = Some(PendingExit::MmioRead {
                register: decoded.register,
                size: decoded.size,
            });
            let read = EvmExitMmioRead {
                guest_phys_addr: guest_phys,
                ret_value: 0,
                size: decoded.size,
            };
            state.exit_state.mmio_read = read;
            self.publish_exit(EvmExitReason::MmioRead);
            self.state_page().exit_state.mmio_read = read;
        }
        true
    }
}

impl Drop for VirtualCpu {
    fn drop(&mut self) {
        vmx::vmclear(self.vmcs_phys);
        pmalloc::pfree(self.vmcs_phys, 1);
        pmalloc::pfree(self.state_page_phys, 1);
    }
}

/// View segment `index` (VMCS order) of the state page.
fn state_segment_mut(state: &mut EvmGuestState, index: usize) -> &mut EvmSegmentRegister {
    match index {
        0 => &mut state.es,
        1 => &mut state.cs,
        2 => &mut state.ss,
        3 => &mut state.ds,
        4 => &mut state.fs,
        5 => &mut state.gs,
        6 => &mut state.ldtr,
        7 => &mut state.tr,
        8 => &mut state.gdtr,
        _ => &mut state.idtr,
    }
}

/// Slot for a ModRM register index in the spilled register file.
/// RSP (4) is not spilled; `read_guest_reg`/`write_guest_reg` service
/// it from the VMCS and never call this with it.
fn reg_slot(regs: &mut GuestRegs, index: usize) -> &mut u64 {
    match index {
        0 => &mut regs.rax,
        1 => &mut regs.rcx,
        2 => &mut regs.rdx,
        3 => &mut regs.rbx,
        4 => unreachable!("rsp accesses are serviced from the VMCS"),
        5 => &mut regs.rbp,
        6 => &mut regs.rsi,
        7 => &mut regs.rdi,
        8 => &mut regs.r8,
        9 => &mut regs.r9,
        10 => &mut regs.r10,
        11 => &mut regs.r11,
        12 => &mut regs.r12,
        13 => &mut regs.r13,
        14 => &mut regs.r14,
        15 => &mut regs.r15,
        _ => unreachable!("register index is four bits"),
    }
}

/// Exceptions that push an error code.
fn has_error_code(vector: u32) -> bool {
    matches!(vector, 8 | 10..=14 | 17)
}

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn merge_sized(old: u64, value: u64, size: u8) -> u64 {
    (old & !size_mask(size)) | (value & size_mask(size))
}

struct DecodedMov {
    register: usize,
    size: u8,
}

/// Minimal decoder for the mov forms chipset emulation meets:
/// `88/89/8a/8b` register moves with an optional operand-size or REX
/// prefix.
fn decode_mov(bytes: &[u8]) -> Option<DecodedMov> {
    let mut i = 0;
    let mut operand_16 = false;
    let mut rex: u8 = 0;

    loop {
        match bytes[i] {
            0x66 => operand_16 = true,
            0x67 | 0x2e | 0x3e | 0x26 | 0x64 | 0x65 | 0x36 => {}
            0x40..=0x4f => rex = bytes[i],
            _ => break,
        }
        i += 1;
        if i >= bytes.len() {
            return None;
        }
    }

    let opcode = bytes[i];
    let modrm = *bytes.get(i + 1)?;
    let reg = ((modrm >> 3) & 0x7) as usize | (((rex >> 2) & 1) as usize) << 3;

    let size = match opcode {
        0x88 | 0x8a => 1,
        0x89 | 0x8b => {
            if rex & 0x8 != 0 {
                8
            } else if operand_16 {
                2
            } else {
                4
            }
        }
        _ => return None,
    };

    Some(DecodedMov {
        register: reg,
        size,
    })
}
