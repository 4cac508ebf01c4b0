//! Virtual filesystem.
//!
//! A `VNode` is any filesystem object: a file, a directory, a pipe end
//! or the kernel console. `OpenFile` pairs a vnode with a cursor and
//! open flags and is what handle tables actually hold. Filesystems hang
//! off a mount table keyed by path prefix; the initramfs mounts at `/`.

mod console;
mod pipe;
mod tarfs;

pub use console::console_vnode;
pub use pipe::create_pipe;
pub use tarfs::TarFs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::io::SeekWhence;
use osprey_abi::{SysError, SysResult};
use spinning_top::{RwSpinlock, Spinlock};

/// File metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

// Poll readiness bits.
pub const POLL_READABLE: u32 = 1 << 0;
pub const POLL_WRITABLE: u32 = 1 << 1;
pub const POLL_CLOSED: u32 = 1 << 2;

/// A filesystem object.
///
/// Offsets are explicit so vnodes stay stateless; `OpenFile` owns the
/// cursor. `flags` carries the open flags (non-blocking).
pub trait VNode: Send + Sync {
    /// Resolve a child by name (directories only).
    fn lookup(&self, _name: &str) -> SysResult<Arc<dyn VNode>> {
        Err(SysError::Unsupported)
    }

    fn read(&self, _offset: u64, _buf: &mut [u8], _flags: u32) -> SysResult<usize> {
        Err(SysError::Unsupported)
    }

    fn write(&self, _offset: u64, _buf: &[u8], _flags: u32) -> SysResult<usize> {
        Err(SysError::Unsupported)
    }

    fn stat(&self) -> SysResult<FileStat> {
        Err(SysError::Unsupported)
    }

    fn list_dir(&self) -> SysResult<Vec<DirEntry>> {
        Err(SysError::Unsupported)
    }

    /// Current readiness, a POLL_* bitmask.
    fn poll(&self) -> u32 {
        POLL_READABLE | POLL_WRITABLE
    }
}

/// A vnode plus a cursor and mode; the object behind file handles.
pub struct OpenFile {
    vnode: Arc<dyn VNode>,
    cursor: Spinlock<u64>,
    flags: u32,
}

impl OpenFile {
    pub fn new(vnode: Arc<dyn VNode>, flags: u32) -> OpenFile {
        OpenFile {
            vnode,
            cursor: Spinlock::new(0),
            flags,
        }
    }

    pub fn vnode(&self) -> &Arc<dyn VNode> {
        &self.vnode
    }

    pub fn read(&self, buf: &mut [u8]) -> SysResult<usize> {
        let mut cursor = self.cursor.lock();
        let n = self.vnode.read(*cursor, buf, self.flags)?;
        *cursor += n as u64;
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> SysResult<usize> {
        let mut cursor = self.cursor.lock();
        let n = self.vnode.write(*cursor, buf, self.flags)?;
        *cursor += n as u64;
        Ok(n)
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> SysResult<u64> {
        let mut cursor = self.cursor.lock();
        let base = match whence {
            SeekWhence::Start => 0,
            SeekWhence::Current => *cursor as i64,
            SeekWhence::End => self.vnode.stat()?.size as i64,
        };
        let target = base.checked_add(offset).ok_or(SysError::InvalidArgument)?;
        if target < 0 {
            return Err(SysError::InvalidArgument);
        }
        *cursor = target as u64;
        Ok(*cursor)
    }

    pub fn stat(&self) -> SysResult<FileStat> {
        self.vnode.stat()
    }

    pub fn list_dir(&self) -> SysResult<Vec<DirEntry>> {
        self.vnode.list_dir()
    }

    pub fn poll(&self) -> u32 {
        self.vnode.poll()
    }
}

struct Mount {
    path: String,
    root: Arc<dyn VNode>,
}

static MOUNTS: RwSpinlock<Vec<Mount>> = RwSpinlock::new(Vec::new());

/// Mount a filesystem root at `path` (`"/"` for the initramfs).
pub fn mount(path: &str, root: Arc<dyn VNode>) {
    MOUNTS.write().push(Mount {
        path: String::from(path),
        root,
    });
}

/// Resolve an absolute path to a vnode, walking component by
/// component from the longest matching mount.
pub fn resolve(path: &str) -> SysResult<Arc<dyn VNode>> {
    let mounts = MOUNTS.read();
    let mut best: Option<(&Mount, &str)> = None;
    for mount in mounts.iter() {
        if let Some(rest) = path.strip_prefix(mount.path.as_str())
            && best.is_none_or(|(b, _)| mount.path.len() > b.path.len())
        {
            best = Some((mount, rest));
        }
    }
    let (mount, rest) = best.ok_or(SysError::NotExists)?;

    let mut node = mount.root.clone();
    for component in rest.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        node = node.lookup(component)?;
    }
    Ok(node)
}

/// Resolve `path` relative to `base` (a directory vnode).
pub fn resolve_at(base: &Arc<dyn VNode>, path: &str) -> SysResult<Arc<dyn VNode>> {
    if path.starts_with('/') {
        return resolve(path);
    }
    let mut node = base.clone();
    for component in path.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        node = node.lookup(component)?;
    }
    Ok(node)
}
