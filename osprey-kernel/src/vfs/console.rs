//! The kernel console vnode, wired as the default standard handles.

use alloc::sync::Arc;

use osprey_abi::{SysError, SysResult};

use super::{FileStat, POLL_WRITABLE, VNode};

struct Console;

impl VNode for Console {
    fn read(&self, _offset: u64, _buf: &mut [u8], _flags: u32) -> SysResult<usize> {
        // Keyboard input goes through PollEvent, not the console.
        Err(SysError::TryAgain)
    }

    fn write(&self, _offset: u64, buf: &[u8], _flags: u32) -> SysResult<usize> {
        if let Ok(text) = core::str::from_utf8(buf) {
            crate::print!("{}", text);
        }
        Ok(buf.len())
    }

    fn stat(&self) -> SysResult<FileStat> {
        Ok(FileStat::default())
    }

    fn poll(&self) -> u32 {
        POLL_WRITABLE
    }
}

/// A shared console vnode.
pub fn console_vnode() -> Arc<dyn VNode> {
    Arc::new(Console)
}
