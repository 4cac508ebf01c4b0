//! Handle management, polling, services, shutdown and arch syscalls.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use osprey_abi::{Handle, ShutdownType, StringView, SysError, SysResult};

use super::Args;
use super::user::UserAccessor;
use crate::handle::Object;
use crate::sched;
use crate::socket::service;

/// `CloseHandle(handle)`
pub fn close_handle(args: Args) -> SysResult<usize> {
    let handle = args[0] as Handle;
    sched::current_process().handles.remove(handle)?;
    Ok(0)
}

/// `MoveHandle(handle_inout, process_handle)` — transfer an object to
/// another process's table; the new handle value is written back.
pub fn move_handle(args: Args) -> SysResult<usize> {
    let [handle_ptr, process_handle, ..] = args;
    let caller = sched::current_process();

    let handle: Handle = UserAccessor::new(handle_ptr).load_value()?;
    let descriptor = caller
        .handles
        .get_process_descriptor(process_handle as Handle)?;
    let target = descriptor.get().ok_or(SysError::ConnectionClosed)?;

    let object = caller.handles.remove(handle)?;
    let new_handle = target.handles.insert(object);
    if let Err(err) = UserAccessor::new(handle_ptr).store_value(&new_handle) {
        // The object has moved; surface the fault but leave it moved
        // (the caller's handle is gone either way).
        return Err(err);
    }
    Ok(0)
}

/// `PollEvent(event_out, timeout_ns)`
pub fn poll_event(args: Args) -> SysResult<usize> {
    let [event_out, timeout_ns, ..] = args;
    match crate::input::poll_event(timeout_ns as u64) {
        Some(event) => {
            UserAccessor::new(event_out).store_value(&event)?;
            Ok(0)
        }
        None => Err(SysError::Timeout),
    }
}

/// `Shutdown(type)`
pub fn shutdown(args: Args) -> SysResult<usize> {
    match args[0] {
        x if x == ShutdownType::PowerOff as usize => crate::acpi::power::power_off(),
        x if x == ShutdownType::Reboot as usize => crate::acpi::power::reboot(),
        _ => Err(SysError::InvalidArgument),
    }
}

const MAX_FEATURES: usize = 16;

fn load_features(ptr: usize, count: usize) -> SysResult<Vec<String>> {
    if count == 0 || count > MAX_FEATURES {
        return Err(SysError::InvalidArgument);
    }
    let mut features = Vec::with_capacity(count);
    for i in 0..count {
        let view: StringView =
            UserAccessor::new(ptr + i * size_of::<StringView>()).load_value()?;
        features.push(UserAccessor::new(view.str as usize).load_string(view.len)?);
    }
    Ok(features)
}

/// `ServiceCreate(features, feature_count)`
pub fn service_create(args: Args) -> SysResult<usize> {
    let [features_ptr, count, ..] = args;
    let features = load_features(features_ptr, count)?;
    service::create(&sched::current_process(), features)?;
    Ok(0)
}

/// `ServiceGet(handle_out, needed_features, feature_count)`
pub fn service_get(args: Args) -> SysResult<usize> {
    let [handle_out, features_ptr, count, ..] = args;
    let needed = load_features(features_ptr, count)?;
    let descriptor = service::get(&needed)?;
    let process = sched::current_process();
    let handle = process.handles.insert(Object::ProcessDescriptor(descriptor));
    if let Err(err) = UserAccessor::new(handle_out).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }
    Ok(0)
}

/// `SetFsBase(value)`
pub fn set_fs_base(args: Args) -> SysResult<usize> {
    let value = args[0] as u64;
    let thread = crate::cpu::current_thread();
    thread.fs_base.store(value, Ordering::SeqCst);
    x86_64::registers::model_specific::FsBase::write(x86_64::VirtAddr::new(value));
    Ok(0)
}

/// `SetGsBase(value)` — the user's GS base; the kernel never uses GS.
pub fn set_gs_base(args: Args) -> SysResult<usize> {
    let value = args[0] as u64;
    let thread = crate::cpu::current_thread();
    thread.gs_base.store(value, Ordering::SeqCst);
    x86_64::registers::model_specific::GsBase::write(x86_64::VirtAddr::new(value));
    Ok(0)
}

/// `GetFsBase(out)`
pub fn get_fs_base(args: Args) -> SysResult<usize> {
    let value = crate::cpu::current_thread().fs_base.load(Ordering::SeqCst);
    UserAccessor::new(args[0]).store_value(&value)?;
    Ok(0)
}

/// `GetGsBase(out)`
pub fn get_gs_base(args: Args) -> SysResult<usize> {
    let value = crate::cpu::current_thread().gs_base.load(Ordering::SeqCst);
    UserAccessor::new(args[0]).store_value(&value)?;
    Ok(0)
}

/// `GetArchInfo(out)`
pub fn get_arch_info(args: Args) -> SysResult<usize> {
    let info = osprey_abi::ArchInfo {
        ticks_per_ms: crate::time::ticks_per_ms(),
        cpu_count: crate::cpu::cpu_count() as u32,
        evm_supported: crate::evm::vmx::is_supported() as u32,
    };
    UserAccessor::new(args[0]).store_value(&info)?;
    Ok(0)
}
