//! The boot framebuffer as a user device.
//!
//! Wraps the GOP-provided linear framebuffer. Single-buffered: `Flip`
//! is only valid for devices advertising `FB_LINK_DOUBLE_BUFFER`,
//! which this one does not.

use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::devlink::{
    DeviceKind, FbInfo, FbLinkOp, FbLinkResponse, FbLinkResponseBody,
};
use osprey_abi::{SysError, SysResult};
use x86_64::PhysAddr;

use super::{DevlinkContext, UserDevice};
use crate::memory::page_map::MapFlags;
use crate::memory::{Mapping, PAGE_SIZE, align_up};

/// Geometry of the boot framebuffer, captured from the GOP before
/// `exit_boot_services`.
#[derive(Clone, Copy, Debug)]
pub struct BootFramebuffer {
    pub phys_base: u64,
    pub pitch: usize,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

struct FramebufferDevice {
    info: BootFramebuffer,
}

/// Register the boot framebuffer with the device registry.
pub fn init(info: BootFramebuffer) {
    super::register(Arc::new(FramebufferDevice { info }));
}

impl FramebufferDevice {
    fn size_bytes(&self) -> usize {
        self.info.pitch * self.info.height as usize
    }

    /// Map the framebuffer into the calling process, write-through.
    fn map_into(&self, ctx: &DevlinkContext<'_>) -> SysResult<u64> {
        let process = ctx.process;
        let bytes = align_up(self.size_bytes(), PAGE_SIZE);
        let base = process.alloc_user_range(bytes);
        let flags = MapFlags {
            user: true,
            writable: true,
            executable: false,
            uncached: true,
        };
        for offset in (0..bytes).step_by(PAGE_SIZE) {
            process.page_map.map(
                base + offset as u64,
                PhysAddr::new(self.info.phys_base + offset as u64),
                flags,
            );
        }
        // The frames belong to hardware; record an empty mapping so the
        // region's base is tracked without owning any frames.
        let placeholder = Mapping::new_anonymous(&process.page_map, base, 0, flags)
            .expect("zero-page mapping allocates nothing");
        process.add_mapping(placeholder);
        Ok(base.as_u64())
    }
}

impl UserDevice for FramebufferDevice {
    fn name(&self) -> &str {
        "fb0"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Framebuffer
    }

    fn specific(
        &self,
        ctx: &DevlinkContext<'_>,
        payload: &[u8],
        response: &mut Vec<u8>,
    ) -> SysResult<()> {
        // Payload is the FbLink op word.
        if payload.len() < size_of::<u32>() {
            return Err(SysError::InvalidArgument);
        }
        let op = u32::from_ne_bytes(payload[..4].try_into().unwrap());

        let body = match op {
            x if x == FbLinkOp::GetInfo as u32 => FbLinkResponseBody {
                info: FbInfo {
                    pitch: self.info.pitch,
                    width: self.info.width,
                    height: self.info.height,
                    bpp: self.info.bpp,
                    flags: 0,
                },
            },
            x if x == FbLinkOp::Map as u32 => FbLinkResponseBody {
                mapping: self.map_into(ctx)? as usize,
            },
            x if x == FbLinkOp::Flip as u32 => {
                // Requires a back buffer this device does not have.
                return Err(SysError::Unsupported);
            }
            _ => return Err(SysError::InvalidArgument),
        };

        let reply = FbLinkResponse {
            size: size_of::<FbLinkResponse>(),
            body,
        };
        let bytes = unsafe {
            core::slice::from_raw_parts(
                &reply as *const FbLinkResponse as *const u8,
                size_of::<FbLinkResponse>(),
            )
        };
        response.extend_from_slice(bytes);
        Ok(())
    }
}
