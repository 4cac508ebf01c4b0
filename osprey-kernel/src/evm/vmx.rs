//! VT-x plumbing: VMXON, VMCS accessors and the guest entry/exit path.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;
use x86_64::registers::control::{Cr0, Cr4, Cr4Flags};
use x86_64::registers::model_specific::Msr;

use crate::memory::{PAGE_SIZE, phys_window, pmalloc};

// VMX capability MSRs.
const IA32_FEATURE_CONTROL: u32 = 0x3a;
const IA32_VMX_BASIC: u32 = 0x480;
const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48b;
const IA32_VMX_EXIT_CTLS: u32 = 0x483;
const IA32_VMX_ENTRY_CTLS: u32 = 0x484;

// VMCS field encodings (SDM volume 3 appendix B).
pub mod field {
    pub const VPID: u32 = 0x0000;
    pub const GUEST_ES_SELECTOR: u32 = 0x0800;
    pub const HOST_ES_SELECTOR: u32 = 0x0c00;
    pub const HOST_CS_SELECTOR: u32 = 0x0c02;
    pub const HOST_SS_SELECTOR: u32 = 0x0c04;
    pub const HOST_DS_SELECTOR: u32 = 0x0c06;
    pub const HOST_FS_SELECTOR: u32 = 0x0c08;
    pub const HOST_GS_SELECTOR: u32 = 0x0c0a;
    pub const HOST_TR_SELECTOR: u32 = 0x0c0c;
    pub const EPT_POINTER: u32 = 0x201a;
    pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
    pub const VMCS_LINK_POINTER: u32 = 0x2800;
    pub const PIN_BASED_CONTROLS: u32 = 0x4000;
    pub const PROC_BASED_CONTROLS: u32 = 0x4002;
    pub const EXCEPTION_BITMAP: u32 = 0x4004;
    pub const EXIT_CONTROLS: u32 = 0x400c;
    pub const ENTRY_CONTROLS: u32 = 0x4012;
    pub const ENTRY_INTERRUPTION_INFO: u32 = 0x4016;
    pub const ENTRY_EXCEPTION_ERROR: u32 = 0x4018;
    pub const PROC_BASED_CONTROLS2: u32 = 0x401e;
    pub const VM_INSTRUCTION_ERROR: u32 = 0x4400;
    pub const EXIT_REASON: u32 = 0x4402;
    pub const EXIT_INSTRUCTION_LENGTH: u32 = 0x440c;
    pub const GUEST_ES_LIMIT: u32 = 0x4800;
    pub const GUEST_ES_ACCESS_RIGHTS: u32 = 0x4814;
    pub const GUEST_ACTIVITY_STATE: u32 = 0x4826;
    pub const EXIT_QUALIFICATION: u32 = 0x6400;
    pub const GUEST_CR0: u32 = 0x6800;
    pub const GUEST_CR3: u32 = 0x6802;
    pub const GUEST_CR4: u32 = 0x6804;
    pub const GUEST_ES_BASE: u32 = 0x6806;
    pub const GUEST_GDTR_BASE: u32 = 0x6816;
    pub const GUEST_IDTR_BASE: u32 = 0x6818;
    pub const GUEST_RSP: u32 = 0x681c;
    pub const GUEST_RIP: u32 = 0x681e;
    pub const GUEST_RFLAGS: u32 = 0x6820;
    pub const HOST_CR0: u32 = 0x6c00;
    pub const HOST_CR3: u32 = 0x6c02;
    pub const HOST_CR4: u32 = 0x6c04;
    pub const HOST_TR_BASE: u32 = 0x6c0a;
    pub const HOST_GDTR_BASE: u32 = 0x6c0c;
    pub const HOST_IDTR_BASE: u32 = 0x6c0e;
    pub const HOST_RSP: u32 = 0x6c14;
    pub const HOST_RIP: u32 = 0x6c16;
}

// Basic exit reasons this kernel decodes.
pub const EXIT_REASON_EXCEPTION: u16 = 0;
pub const EXIT_REASON_TRIPLE_FAULT: u16 = 2;
pub const EXIT_REASON_CPUID: u16 = 10;
pub const EXIT_REASON_HLT: u16 = 12;
pub const EXIT_REASON_IO: u16 = 30;
pub const EXIT_REASON_EPT_VIOLATION: u16 = 48;

static VMX_READY: AtomicBool = AtomicBool::new(false);
static VMXON_LOCK: Spinlock<()> = Spinlock::new(());

/// Whether the CPU advertises VMX.
pub fn is_supported() -> bool {
    let cpuid = unsafe { core::arch::x86_64::__cpuid(1) };
    cpuid.ecx & (1 << 5) != 0
}

/// The VMCS revision identifier from IA32_VMX_BASIC.
fn revision_id() -> u32 {
    (unsafe { Msr::new(IA32_VMX_BASIC).read() } as u32) & 0x7fff_ffff
}

/// Enter VMX root operation on this CPU (first use only).
pub fn ensure_vmxon() -> SysResult<()> {
    if VMX_READY.load(Ordering::SeqCst) {
        return Ok(());
    }
    let _lock = VMXON_LOCK.lock();
    if VMX_READY.load(Ordering::SeqCst) {
        return Ok(());
    }

    if !is_supported() {
        return Err(SysError::Unsupported);
    }

    // BIOS must have enabled VMXON outside SMX, or left the lock clear.
    let mut feature_control = Msr::new(IA32_FEATURE_CONTROL);
    let value = unsafe { feature_control.read() };
    if value & 1 == 0 {
        unsafe {
            feature_control.write(value | 0x5);
        }
    } else if value & 0x4 == 0 {
        return Err(SysError::Unsupported);
    }

    unsafe {
        Cr4::update(|cr4| cr4.insert(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
    }

    let vmxon_phys = pmalloc::pmalloc(1);
    if vmxon_phys == 0 {
        return Err(SysError::NoMem);
    }
    unsafe {
        core::ptr::write_bytes(phys_window::to_virt_mut::<u8>(vmxon_phys), 0, PAGE_SIZE);
        *phys_window::to_virt_mut::<u32>(vmxon_phys) = revision_id();
    }

    let flags: u64;
    unsafe {
        asm!(
            "vmxon [{region}]",
            "pushfq",
            "pop {flags}",
            region = in(reg) &(vmxon_phys as u64),
            flags = out(reg) flags,
        );
    }
    // CF or ZF set means the instruction failed.
    if flags & 0x41 != 0 {
        return Err(SysError::Unsupported);
    }

    VMX_READY.store(true, Ordering::SeqCst);
    log::info!("vmx: root operation enabled");
    Ok(())
}

/// Allocate a zeroed VMCS region with the revision stamped in.
pub fn alloc_vmcs() -> SysResult<usize> {
    let phys = pmalloc::pmalloc(1);
    if phys == 0 {
        return Err(SysError::NoMem);
    }
    unsafe {
        core::ptr::write_bytes(phys_window::to_virt_mut::<u8>(phys), 0, PAGE_SIZE);
        *phys_window::to_virt_mut::<u32>(phys) = revision_id();
    }
    vmclear(phys);
    Ok(phys)
}

pub fn vmclear(vmcs_phys: usize) {
    unsafe {
        asm!("vmclear [{addr}]", addr = in(reg) &(vmcs_phys as u64));
    }
}

pub fn vmptrld(vmcs_phys: usize) {
    unsafe {
        asm!("vmptrld [{addr}]", addr = in(reg) &(vmcs_phys as u64));
    }
}

pub fn vmread(field: u32) -> u64 {
    let value: u64;
    unsafe {
        asm!("vmread {value}, {field}", field = in(reg) field as u64, value = out(reg) value);
    }
    value
}

pub fn vmwrite(field: u32, value: u64) {
    unsafe {
        asm!("vmwrite {field}, {value}", field = in(reg) field as u64, value = in(reg) value);
    }
}

/// Reconcile a control MSR's allowed-0/allowed-1 bits with what we want.
fn adjust_controls(msr: u32, wanted: u32) -> u32 {
    let caps = unsafe { Msr::new(msr).read() };
    let allowed0 = caps as u32; // bits that must be 1
    let allowed1 = (caps >> 32) as u32; // bits that may be 1
    (wanted | allowed0) & allowed1
}

/// Program the control fields for an EPT-backed, unrestricted guest.
pub fn setup_controls(ept_pointer: u64) {
    // Pin: external interrupts cause exits so the host keeps ticking.
    vmwrite(
        field::PIN_BASED_CONTROLS,
        adjust_controls(IA32_VMX_PINBASED_CTLS, 1) as u64,
    );
    // Proc: HLT exiting (1<<7), unconditional IO exiting (1<<24),
    // secondary controls (1<<31).
    vmwrite(
        field::PROC_BASED_CONTROLS,
        adjust_controls(IA32_VMX_PROCBASED_CTLS, (1 << 7) | (1 << 24) | (1 << 31)) as u64,
    );
    // Secondary: enable EPT (1<<1), unrestricted guest (1<<7).
    vmwrite(
        field::PROC_BASED_CONTROLS2,
        adjust_controls(IA32_VMX_PROCBASED_CTLS2, (1 << 1) | (1 << 7)) as u64,
    );
    // Exit to 64-bit host (1<<9), acknowledge interrupts (1<<15).
    vmwrite(
        field::EXIT_CONTROLS,
        adjust_controls(IA32_VMX_EXIT_CTLS, (1 << 9) | (1 << 15)) as u64,
    );
    vmwrite(
        field::ENTRY_CONTROLS,
        adjust_controls(IA32_VMX_ENTRY_CTLS, 0) as u64,
    );

    // EPT pointer: 4-level (5), write-back (6).
    vmwrite(field::EPT_POINTER, ept_pointer | (3 << 3) | 6);
    vmwrite(field::VMCS_LINK_POINTER, u64::MAX);
    vmwrite(field::EXCEPTION_BITMAP, 0);
}

/// Program the host-state fields for the current CPU.
pub fn setup_host_state() {
    use x86_64::instructions::tables::{sgdt, sidt};

    vmwrite(field::HOST_CR0, Cr0::read_raw());
    vmwrite(
        field::HOST_CR3,
        x86_64::registers::control::Cr3::read().0.start_address().as_u64(),
    );
    vmwrite(field::HOST_CR4, Cr4::read_raw());

    let cs = crate::syscall::gdt::kernel_code_selector().0 as u64;
    let ds = crate::syscall::gdt::kernel_data_selector().0 as u64;
    vmwrite(field::HOST_CS_SELECTOR, cs);
    vmwrite(field::HOST_SS_SELECTOR, ds);
    vmwrite(field::HOST_DS_SELECTOR, ds);
    vmwrite(field::HOST_ES_SELECTOR, ds);
    vmwrite(field::HOST_FS_SELECTOR, ds);
    vmwrite(field::HOST_GS_SELECTOR, ds);
    // TR must be a valid non-zero selector; it follows CS+DS+TSS layout.
    vmwrite(field::HOST_TR_SELECTOR, (ds + 8) & !0x7);
    vmwrite(field::HOST_TR_BASE, 0);

    let gdt = sgdt();
    let idt = sidt();
    vmwrite(field::HOST_GDTR_BASE, gdt.base.as_u64());
    vmwrite(field::HOST_IDTR_BASE, idt.base.as_u64());
}

/// Guest general-purpose registers not held in the VMCS.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GuestRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Enter the guest, returning the raw exit reason. `launched` selects
/// vmlaunch vs vmresume.
///
/// # Safety
/// The current VMCS must be fully configured and loaded, and interrupts
/// must be disabled.
pub unsafe fn enter(regs: &mut GuestRegs, launched: bool) -> u64 {
    let failed: u64;
    unsafe {
        asm!(
            // Callee-saved registers are clobbered by the guest; save
            // them, plus the operand values the exit path needs (they
            // are fetched back from the stack because every GPR gets
            // loaded with guest state below).
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "push rdi",               // &GuestRegs
            "push rsi",               // launched flag

            "mov rax, 0x6c14",        // HOST_RSP
            "vmwrite rax, rsp",
            "lea rax, [rip + 2f]",
            "mov rcx, 0x6c16",        // HOST_RIP
            "vmwrite rcx, rax",

            // Load guest GPRs; rax last, pointer recovered from stack.
            "mov rax, [rsp + 8]",
            "mov rbx, [rax + 0x08]",
            "mov rcx, [rax + 0x10]",
            "mov rdx, [rax + 0x18]",
            "mov rbp, [rax + 0x30]",
            "mov r8,  [rax + 0x38]",
            "mov r9,  [rax + 0x40]",
            "mov r10, [rax + 0x48]",
            "mov r11, [rax + 0x50]",
            "mov r12, [rax + 0x58]",
            "mov r13, [rax + 0x60]",
            "mov r14, [rax + 0x68]",
            "mov r15, [rax + 0x70]",

            "cmp qword ptr [rsp], 0",
            "mov rsi, [rax + 0x20]",
            "mov rdi, [rax + 0x28]",
            "mov rax, [rax + 0x00]",
            "jnz 1f",
            "vmlaunch",
            "jmp 3f",
            "1:",
            "vmresume",
            "jmp 3f",

            // VM exit lands here with host state restored from the VMCS.
            "2:",
            "push rax",
            "mov rax, [rsp + 0x10]",  // saved &GuestRegs
            "mov [rax + 0x08], rbx",
            "mov [rax + 0x10], rcx",
            "mov [rax + 0x18], rdx",
            "mov [rax + 0x20], rsi",
            "mov [rax + 0x28], rdi",
            "mov [rax + 0x30], rbp",
            "mov [rax + 0x38], r8",
            "mov [rax + 0x40], r9",
            "mov [rax + 0x48], r10",
            "mov [rax + 0x50], r11",
            "mov [rax + 0x58], r12",
            "mov [rax + 0x60], r13",
            "mov [rax + 0x68], r14",
            "mov [rax + 0x70], r15",
            "pop rcx",                // guest rax
            "mov [rax + 0x00], rcx",
            "xor eax, eax",
            "jmp 4f",

            // vmlaunch/vmresume fell through: entry failure.
            "3:",
            "mov eax, 1",

            "4:",
            "add rsp, 16",            // drop launched + pointer slots
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            inout("rdi") regs as *mut GuestRegs => _,
            inout("rsi") launched as u64 => _,
            out("rax") failed,
            out("rcx") _, out("rdx") _,
            out("r8") _, out("r9") _, out("r10") _, out("r11") _,
        );
    }

    if failed != 0 {
        // Pull the diagnostic before anyone else touches the VMCS.
        let error = vmread(field::VM_INSTRUCTION_ERROR);
        log::warn!("vmx: vm entry failed, instruction error {error}");
        return u64::MAX;
    }
    vmread(field::EXIT_REASON)
}
