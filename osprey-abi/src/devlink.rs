//! Devlink: the typed request/response envelope spoken to every
//! user-facing device.
//!
//! A `Devlink` syscall carries one request buffer and one response
//! buffer. The request starts with a `DevLinkRequestHeader`; the
//! response starts with its total size so a too-small caller buffer can
//! be reported precisely (`BufferTooSmall` plus the needed size in the
//! prefix).

use crate::Handle;

/// Kinds of user-visible devices.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Framebuffer,
    Gpu,
    Sound,
}

impl DeviceKind {
    pub const COUNT: usize = 3;

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Framebuffer),
            1 => Some(Self::Gpu),
            2 => Some(Self::Sound),
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevLinkRequestType {
    GetDevices,
    OpenDevice,
    Specific,
}

/// Common prefix of every devlink request.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DevLinkRequestHeader {
    pub ty: DevLinkRequestType,
    /// Total size of the request, including this header.
    pub size: usize,
    /// Device handle; only meaningful for `Specific`.
    pub handle: Handle,
}

/// Body of a `GetDevices` request.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GetDevicesRequest {
    pub header: DevLinkRequestHeader,
    pub kind: DeviceKind,
}

/// Body of an `OpenDevice` request.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpenDeviceRequest {
    pub header: DevLinkRequestHeader,
    pub kind: DeviceKind,
    pub name: *const u8,
    pub name_len: usize,
}

/// The devlink envelope passed to the `Devlink` syscall.
///
/// Request and response are separate buffers; `response_buf_size` is
/// the caller-owned capacity of `response`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DevLink {
    pub request: *const DevLinkRequestHeader,
    pub response: *mut u8,
    pub response_buf_size: usize,
}

/// Suggested response buffer capacity.
pub const DEVLINK_BUFFER_SIZE: usize = 1024;

/// Response to `GetDevices`: a size prefix, the device count, then
/// `count` names packed as (len: usize, bytes) records.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GetDevicesResponse {
    pub size: usize,
    pub device_count: usize,
}

/// Response to `OpenDevice`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpenDeviceResponse {
    pub size: usize,
    pub handle: Handle,
}

// =============================================================================
// Framebuffer subprotocol
// =============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbLinkOp {
    GetInfo,
    Map,
    Flip,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FbLink {
    pub header: DevLinkRequestHeader,
    pub op: FbLinkOp,
}

/// Set in `FbInfo::flags` when the device has a back buffer and
/// supports `Flip`.
pub const FB_LINK_DOUBLE_BUFFER: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbInfo {
    pub pitch: usize,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FbLinkResponse {
    pub size: usize,
    pub body: FbLinkResponseBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union FbLinkResponseBody {
    pub info: FbInfo,
    /// Userspace address of the mapped framebuffer.
    pub mapping: usize,
}

// =============================================================================
// Sound subprotocol
// =============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundLinkOp {
    GetInfo,
    GetOutputInfo,
    SetActiveOutput,
    SetOutputParams,
    QueueOutput,
    Play,
    WaitUntilConsumed,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoundFormat {
    #[default]
    None,
    PcmU8,
    PcmU16,
    PcmU20,
    PcmU24,
    PcmU32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SoundOutputParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub fmt: SoundFormat,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundDeviceType {
    Headphone,
    Speaker,
    LineOut,
    Unknown,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoundOutputInfo {
    pub name: [u8; 128],
    pub name_len: usize,
    pub buffer_size: usize,
    pub id: usize,
    pub ty: SoundDeviceType,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoundLink {
    pub header: DevLinkRequestHeader,
    pub op: SoundLinkOp,
    pub body: SoundLinkBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SoundLinkBody {
    pub get_output_info: SoundGetOutputInfo,
    pub set_active_output: SoundSetActiveOutput,
    pub set_output_params: SoundOutputParams,
    pub queue_output: SoundQueueOutput,
    pub play: u32,
    pub wait_until_consumed: SoundWaitUntilConsumed,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoundGetOutputInfo {
    pub index: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoundSetActiveOutput {
    pub id: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoundQueueOutput {
    pub buffer: *const u8,
    pub len: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoundWaitUntilConsumed {
    pub trip_size: usize,
}
