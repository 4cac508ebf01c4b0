//! EVM: the hardware virtualization ABI.
//!
//! A `VirtualCpu` publishes its state through an `EvmGuestState` page
//! mapped into the owning process. After `EvmVcpuRun` returns, the
//! kernel has filled `exit_reason` and `exit_state`; userspace services
//! the exit, updates the fields it changed, and calls
//! `EvmVcpuWriteState` with the matching `STATE_BITS_*` mask before
//! re-entering.

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvmExitReason {
    #[default]
    VmEnterFailed,
    Halt,
    IoIn,
    IoOut,
    MmioRead,
    MmioWrite,
    Cpuid,
    TripleFault,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union EvmExitState {
    pub io_in: EvmExitIoIn,
    pub io_out: EvmExitIoOut,
    pub mmio_read: EvmExitMmioRead,
    pub mmio_write: EvmExitMmioWrite,
}

impl Default for EvmExitState {
    fn default() -> Self {
        Self {
            io_in: EvmExitIoIn::default(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmExitIoIn {
    pub port: u16,
    pub size: u8,
    /// Written by userspace before re-entry.
    pub ret_value: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmExitIoOut {
    pub port: u16,
    pub size: u8,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmExitMmioRead {
    pub guest_phys_addr: u64,
    /// Written by userspace before re-entry.
    pub ret_value: u64,
    pub size: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmExitMmioWrite {
    pub guest_phys_addr: u64,
    pub value: u64,
    pub size: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmSegmentRegister {
    pub base: u64,
    pub selector: u16,
    pub limit: u16,
}

/// The guest-state page. One per VirtualCpu, mapped read/write into the
/// owning process.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct EvmGuestState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub es: EvmSegmentRegister,
    pub cs: EvmSegmentRegister,
    pub ss: EvmSegmentRegister,
    pub ds: EvmSegmentRegister,
    pub fs: EvmSegmentRegister,
    pub gs: EvmSegmentRegister,
    pub ldtr: EvmSegmentRegister,
    pub tr: EvmSegmentRegister,
    pub gdtr: EvmSegmentRegister,
    pub idtr: EvmSegmentRegister,

    pub exit_reason: EvmExitReason,
    pub exit_state: EvmExitState,
}

// Field-group mask for `EvmVcpuWriteState` / `EvmVcpuReadState`.
pub const STATE_BITS_GP_REGS: u32 = 1 << 0;
pub const STATE_BITS_RIP: u32 = 1 << 1;
pub const STATE_BITS_RSP: u32 = 1 << 2;
pub const STATE_BITS_RFLAGS: u32 = 1 << 3;
pub const STATE_BITS_SEG_REGS: u32 = 1 << 4;
pub const STATE_BITS_CONTROL_REGS: u32 = 1 << 5;
pub const STATE_BITS_ALL: u32 = STATE_BITS_GP_REGS
    | STATE_BITS_RIP
    | STATE_BITS_RSP
    | STATE_BITS_RFLAGS
    | STATE_BITS_SEG_REGS
    | STATE_BITS_CONTROL_REGS;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvmIrqType {
    /// An architectural exception (vector < 32, may carry an error code).
    Exception,
    /// An external interrupt.
    Irq,
}

/// Argument to `EvmVcpuTriggerIrq`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EvmIrqInfo {
    pub ty: EvmIrqType,
    pub irq: u32,
    pub error: u32,
}
