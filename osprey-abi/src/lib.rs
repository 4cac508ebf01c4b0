//! Shared ABI definitions between the Osprey kernel and userspace.
//!
//! This crate contains syscall numbers, error codes, and the plain-data
//! types that cross the syscall boundary. Both sides must agree on
//! everything in here, so every struct is `repr(C)` and every constant
//! is part of the stable ABI.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod devlink;
pub mod evm;
pub mod input;
pub mod io;
pub mod signal;
pub mod socket;
pub mod windower;

/// A process-scoped index into that process's handle table.
pub type Handle = usize;

/// The never-valid handle value.
pub const INVALID_HANDLE: Handle = usize::MAX;

// =============================================================================
// Syscall numbers
// =============================================================================

/// Syscall numbers. Passed in RDI on x86-64; arguments follow in
/// RSI, RDX, R10, R8, R9 and the return value comes back in RAX.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    ThreadCreate,
    ThreadExit,

    ProcessCreate,
    ProcessExit,

    Kill,
    GetStatus,
    GetThreadId,

    Sleep,
    GetTime,
    GetDateTime,

    Syslog,

    Map,
    Unmap,

    Devlink,
    CloseHandle,
    MoveHandle,
    PollEvent,
    Shutdown,

    Openat,
    Read,
    Write,
    Seek,
    Stat,
    ListDir,
    PipeCreate,
    ReplaceStdHandle,

    ServiceCreate,
    ServiceGet,

    SocketCreate,
    SocketConnect,
    SocketListen,
    SocketAccept,
    SocketSend,
    SocketReceive,
    SocketSendTo,
    SocketReceiveFrom,
    SocketGetPeerName,

    SharedMemAlloc,
    SharedMemMap,
    SharedMemShare,

    FutexWait,
    FutexWake,

    SetFsBase,
    SetGsBase,
    GetFsBase,
    GetGsBase,

    GetArchInfo,

    SignalAction,
    SignalReturn,

    EvmCreate,
    EvmCreateVcpu,
    EvmMap,
    EvmUnmap,
    EvmVcpuRun,
    EvmVcpuWriteState,
    EvmVcpuReadState,
    EvmVcpuTriggerIrq,
}

impl Syscall {
    /// Decode a raw syscall number.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        if raw <= Self::EvmVcpuTriggerIrq as usize {
            // Safety: Syscall is a dense repr(usize) enum starting at 0
            // and `raw` is within range.
            Some(unsafe { core::mem::transmute::<usize, Syscall>(raw) })
        } else {
            None
        }
    }
}

// =============================================================================
// Error codes
// =============================================================================

/// Errors returned by syscalls as negative values.
///
/// `TryAgain` is the only soft failure: the caller is expected to retry
/// or wait on the associated event. Everything else is final for the
/// issuing call, and the kernel guarantees its own state is unchanged.
#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    InvalidArgument = -1,
    Unsupported = -2,
    Fault = -3,
    NoMem = -4,
    BufferTooSmall = -5,
    TryAgain = -6,
    NotExists = -7,
    NoPermissions = -8,
    AlreadyExists = -9,
    ConnectionClosed = -10,
    Timeout = -11,
}

impl SysError {
    /// The raw negative value placed in the syscall return register.
    pub const fn as_isize(self) -> isize {
        self as isize
    }

    /// Decode a raw negative return value.
    pub const fn from_raw(raw: isize) -> Option<Self> {
        match raw {
            -1 => Some(Self::InvalidArgument),
            -2 => Some(Self::Unsupported),
            -3 => Some(Self::Fault),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::BufferTooSmall),
            -6 => Some(Self::TryAgain),
            -7 => Some(Self::NotExists),
            -8 => Some(Self::NoPermissions),
            -9 => Some(Self::AlreadyExists),
            -10 => Some(Self::ConnectionClosed),
            -11 => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Kernel-internal result alias; the `Err` side maps 1:1 onto the raw
/// syscall return.
pub type SysResult<T> = Result<T, SysError>;

// =============================================================================
// Memory protection and mapping
// =============================================================================

pub const PROT_READ: u32 = 1 << 0;
pub const PROT_WRITE: u32 = 1 << 1;
pub const PROT_EXEC: u32 = 1 << 2;

// =============================================================================
// Well-known handles
// =============================================================================

/// Standard handle slots pre-populated in every process's handle table.
pub const STDIN_HANDLE: Handle = 0;
pub const STDOUT_HANDLE: Handle = 1;
pub const STDERR_HANDLE: Handle = 2;

// =============================================================================
// Process creation
// =============================================================================

/// Extra information passed to `ProcessCreate`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessCreateInfo {
    /// Pointer to an array of `StringView` arguments.
    pub args: *const StringView,
    pub arg_count: usize,
    /// Standard handles to install in the child, or `INVALID_HANDLE`
    /// to inherit the kernel console.
    pub stdin: Handle,
    pub stdout: Handle,
    pub stderr: Handle,
}

/// A (pointer, length) view of caller-owned UTF-8 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StringView {
    pub str: *const u8,
    pub len: usize,
}

// =============================================================================
// Shutdown
// =============================================================================

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    PowerOff,
    Reboot,
}

// =============================================================================
// Time
// =============================================================================

/// Wall-clock date and time as reported by `GetDateTime`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

// =============================================================================
// Architecture info
// =============================================================================

/// Answer to `GetArchInfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchInfo {
    /// TSC (or generic counter) ticks per millisecond.
    pub ticks_per_ms: u64,
    /// Number of CPUs known to the kernel.
    pub cpu_count: u32,
    /// Whether hardware virtualization (EVM) is available.
    pub evm_supported: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for raw in 0..=Syscall::EvmVcpuTriggerIrq as usize {
            let sys = Syscall::from_raw(raw).expect("dense syscall numbering");
            assert_eq!(sys as usize, raw);
        }
        assert!(Syscall::from_raw(Syscall::EvmVcpuTriggerIrq as usize + 1).is_none());
    }

    #[test]
    fn error_codes_round_trip() {
        for raw in -11..=-1isize {
            let err = SysError::from_raw(raw).expect("dense error numbering");
            assert_eq!(err.as_isize(), raw);
        }
        assert!(SysError::from_raw(0).is_none());
        assert!(SysError::from_raw(-12).is_none());
    }
}
