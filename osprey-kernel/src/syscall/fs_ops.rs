//! Filesystem syscalls.

use alloc::sync::Arc;

use osprey_abi::io::{DIR_ENTRY_NAME_MAX, DirEntry as AbiDirEntry, FileStat, PipeHandles, SeekWhence};
use osprey_abi::{Handle, INVALID_HANDLE, STDERR_HANDLE, STDIN_HANDLE, STDOUT_HANDLE, SysError, SysResult};

use super::Args;
use super::user::UserAccessor;
use crate::handle::Object;
use crate::sched;
use crate::vfs::{self, OpenFile};

/// `Openat(handle_out, dir_handle, path, path_len, flags)`
pub fn openat(args: Args) -> SysResult<usize> {
    let [handle_out, dir_handle, path_ptr, path_len, flags] = args;
    let path = UserAccessor::new(path_ptr).load_string(path_len)?;
    let process = sched::current_process();

    let vnode = if dir_handle == INVALID_HANDLE || path.starts_with('/') {
        vfs::resolve(&path)?
    } else {
        let dir = process.handles.get_open_file(dir_handle as Handle)?;
        vfs::resolve_at(dir.vnode(), &path)?
    };

    let file = Arc::new(OpenFile::new(vnode, flags as u32));
    let handle = process.handles.insert(Object::OpenFile(file));
    if let Err(err) = UserAccessor::new(handle_out).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }
    Ok(0)
}

/// `Read(handle, data, size, actual_out)`
pub fn read(args: Args) -> SysResult<usize> {
    let [handle, data, size, actual_out, _] = args;
    let file = sched::current_process().handles.get_open_file(handle as Handle)?;

    const CHUNK: usize = 64 * 1024;
    let mut buf = alloc::vec![0u8; size.min(CHUNK)];
    let n = file.read(&mut buf)?;
    UserAccessor::new(data).store(&buf[..n])?;
    if actual_out != 0 {
        UserAccessor::new(actual_out).store_value(&n)?;
    }
    Ok(n)
}

/// `Write(handle, data, size, actual_out)`
pub fn write(args: Args) -> SysResult<usize> {
    let [handle, data, size, actual_out, _] = args;
    let file = sched::current_process().handles.get_open_file(handle as Handle)?;

    const CHUNK: usize = 64 * 1024;
    let mut buf = alloc::vec![0u8; size.min(CHUNK)];
    UserAccessor::new(data).load(&mut buf)?;
    let n = file.write(&buf)?;
    if actual_out != 0 {
        UserAccessor::new(actual_out).store_value(&n)?;
    }
    Ok(n)
}

/// `Seek(handle, offset, whence, value_out)`
pub fn seek(args: Args) -> SysResult<usize> {
    let [handle, offset, whence, value_out, _] = args;
    let whence = SeekWhence::from_raw(whence).ok_or(SysError::InvalidArgument)?;
    let file = sched::current_process().handles.get_open_file(handle as Handle)?;
    let position = file.seek(offset as i64, whence)?;
    if value_out != 0 {
        UserAccessor::new(value_out).store_value(&position)?;
    }
    Ok(0)
}

/// `Stat(handle, stat_out)`
pub fn stat(args: Args) -> SysResult<usize> {
    let [handle, stat_out, ..] = args;
    let file = sched::current_process().handles.get_open_file(handle as Handle)?;
    let stat = file.stat()?;
    let abi_stat = FileStat {
        size: stat.size,
        is_dir: stat.is_dir as u32,
        _reserved: 0,
    };
    UserAccessor::new(stat_out).store_value(&abi_stat)?;
    Ok(0)
}

/// `ListDir(handle, entries, count_inout, offset_inout)` — fills the
/// caller's buffer starting at the cursor in `offset_inout`; writes the
/// produced count back. `BufferTooSmall` reports the remaining total.
pub fn list_dir(args: Args) -> SysResult<usize> {
    let [handle, entries_ptr, count_ptr, offset_ptr, _] = args;
    let file = sched::current_process().handles.get_open_file(handle as Handle)?;
    let entries = file.list_dir()?;

    let capacity: usize = UserAccessor::new(count_ptr).load_value()?;
    let offset: usize = UserAccessor::new(offset_ptr).load_value()?;

    let remaining = entries.len().saturating_sub(offset);
    if capacity == 0 && remaining > 0 {
        UserAccessor::new(count_ptr).store_value(&remaining)?;
        return Err(SysError::BufferTooSmall);
    }

    let produced = remaining.min(capacity);
    for (i, entry) in entries[offset..offset + produced].iter().enumerate() {
        let mut abi_entry = AbiDirEntry::default();
        let name_len = entry.name.len().min(DIR_ENTRY_NAME_MAX);
        abi_entry.name[..name_len].copy_from_slice(&entry.name.as_bytes()[..name_len]);
        abi_entry.name_len = name_len;
        abi_entry.is_dir = entry.is_dir as u32;
        UserAccessor::new(entries_ptr + i * size_of::<AbiDirEntry>())
            .store_value(&abi_entry)?;
    }

    UserAccessor::new(count_ptr).store_value(&produced)?;
    let new_offset = offset + produced;
    UserAccessor::new(offset_ptr).store_value(&new_offset)?;
    Ok(0)
}

/// `PipeCreate(handles_out, max_size, read_flags, write_flags)`
pub fn pipe_create(args: Args) -> SysResult<usize> {
    let [handles_out, max_size, read_flags, write_flags, _] = args;
    let process = sched::current_process();

    let (read_end, write_end) = vfs::create_pipe(max_size);
    let read_file = Arc::new(OpenFile::new(read_end, read_flags as u32));
    let write_file = Arc::new(OpenFile::new(write_end, write_flags as u32));

    let handles = PipeHandles {
        read: process.handles.insert(Object::OpenFile(read_file)),
        write: process.handles.insert(Object::OpenFile(write_file)),
    };
    if let Err(err) = UserAccessor::new(handles_out).store_value(&handles) {
        process.handles.remove(handles.read).ok();
        process.handles.remove(handles.write).ok();
        return Err(err);
    }
    Ok(0)
}

/// `ReplaceStdHandle(std_handle, new_handle)`
pub fn replace_std_handle(args: Args) -> SysResult<usize> {
    let [std_handle, new_handle, ..] = args;
    if !matches!(std_handle, STDIN_HANDLE | STDOUT_HANDLE | STDERR_HANDLE) {
        return Err(SysError::InvalidArgument);
    }
    let process = sched::current_process();
    let object = process.handles.get(new_handle as Handle)?;
    process.handles.replace(std_handle, object)?;
    Ok(0)
}
