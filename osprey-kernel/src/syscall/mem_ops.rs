//! Memory-related syscalls: anonymous maps and shared memory.

use osprey_abi::{Handle, PROT_EXEC, PROT_WRITE, SysError, SysResult};
use x86_64::VirtAddr;

use super::Args;
use super::user::UserAccessor;
use crate::handle::Object;
use crate::memory::shared::SharedMemory;
use crate::memory::{MapFlags, Mapping, PAGE_SIZE, align_up};
use crate::sched;

/// `Map(addr_out, size, protection)`
pub fn map(args: Args) -> SysResult<usize> {
    let [addr_out, size, protection, ..] = args;
    if size == 0 {
        return Err(SysError::InvalidArgument);
    }

    let process = sched::current_process();
    let base = process.alloc_user_range(size);
    let mapping = Mapping::new_anonymous(
        &process.page_map,
        base,
        align_up(size, PAGE_SIZE),
        MapFlags {
            user: true,
            writable: protection as u32 & PROT_WRITE != 0,
            executable: protection as u32 & PROT_EXEC != 0,
            uncached: false,
        },
    )
    .ok_or(SysError::NoMem)?;

    let addr = base.as_u64();
    process.add_mapping(mapping);
    if let Err(err) = UserAccessor::new(addr_out).store_value(&addr) {
        process.remove_mapping(base);
        return Err(err);
    }
    Ok(0)
}

/// `Unmap(ptr, size)` — the size must cover the original mapping's
/// base; partial unmapping is not supported.
pub fn unmap(args: Args) -> SysResult<usize> {
    let [ptr, _size, ..] = args;
    let process = sched::current_process();
    if process.remove_mapping(VirtAddr::new(ptr as u64)) {
        Ok(0)
    } else {
        Err(SysError::NotExists)
    }
}

/// `SharedMemAlloc(handle_out, size)`
pub fn shared_mem_alloc(args: Args) -> SysResult<usize> {
    let [handle_out, size, ..] = args;
    let memory = SharedMemory::alloc(size)?;
    let process = sched::current_process();
    let handle = process.handles.insert(Object::SharedMemory(memory));
    if let Err(err) = UserAccessor::new(handle_out).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }
    Ok(0)
}

/// `SharedMemMap(handle, ptr_out)`
pub fn shared_mem_map(args: Args) -> SysResult<usize> {
    let [handle, ptr_out, ..] = args;
    let process = sched::current_process();
    let memory = process.handles.get_shared_memory(handle as Handle)?;

    let base = process.alloc_user_range(memory.size());
    let mapping = memory.map_into(&process.page_map, base);
    let addr = base.as_u64();
    process.add_mapping(mapping);

    if let Err(err) = UserAccessor::new(ptr_out).store_value(&addr) {
        process.remove_mapping(base);
        return Err(err);
    }
    Ok(0)
}

/// `SharedMemShare(handle, process_handle, result_handle_out)` — give
/// another process a handle to the same memory.
pub fn shared_mem_share(args: Args) -> SysResult<usize> {
    let [handle, process_handle, result_out, ..] = args;
    let caller = sched::current_process();
    let memory = caller.handles.get_shared_memory(handle as Handle)?;
    let descriptor = caller
        .handles
        .get_process_descriptor(process_handle as Handle)?;
    let target = descriptor.get().ok_or(SysError::ConnectionClosed)?;

    let new_handle = target.handles.insert(Object::SharedMemory(memory));
    if let Err(err) = UserAccessor::new(result_out).store_value(&new_handle) {
        target.handles.remove(new_handle).ok();
        return Err(err);
    }
    Ok(0)
}
