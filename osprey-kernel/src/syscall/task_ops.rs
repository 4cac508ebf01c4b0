//! Thread, process, time and logging syscalls.

use alloc::string::String;
use core::sync::atomic::Ordering;

use osprey_abi::{Handle, ProcessCreateInfo, StringView, SysError, SysResult};
use x86_64::VirtAddr;

use super::Args;
use super::user::UserAccessor;
use crate::handle::Object;
use crate::memory::page_map::MapFlags;
use crate::memory::Mapping;
use crate::sched::{self, thread::{Thread, ThreadDescriptor, ThreadEntry}};

/// User stack size for threads created with `ThreadCreate`.
const THREAD_STACK_SIZE: usize = 256 * 1024;

/// `ThreadCreate(handle_out, name, name_len, entry, arg)`
pub fn thread_create(args: Args) -> SysResult<usize> {
    let [handle_out, name_ptr, name_len, entry, arg] = args;

    let name = UserAccessor::new(name_ptr).load_string(name_len)?;
    let process = sched::current_process();

    // The new thread gets its own stack; the entry function runs with
    // `arg` in the first argument register.
    let stack_base = process.alloc_user_range(THREAD_STACK_SIZE);
    let stack = Mapping::new_anonymous(
        &process.page_map,
        stack_base,
        THREAD_STACK_SIZE,
        MapFlags {
            user: true,
            writable: true,
            executable: false,
            uncached: false,
        },
    )
    .ok_or(SysError::NoMem)?;
    let stack_top = stack_base + THREAD_STACK_SIZE as u64 - 16u64;
    process.add_mapping(stack);

    let thread = Thread::new(
        &name,
        crate::cpu::current_thread().cpu,
        process.clone(),
        ThreadEntry::User {
            ip: VirtAddr::new(entry as u64),
            sp: VirtAddr::new(stack_top.as_u64() & !0xf),
            arg: arg as u64,
        },
    );

    let descriptor = ThreadDescriptor::new(&thread);
    let handle = process.handles.insert(Object::ThreadDescriptor(descriptor));

    if let Err(err) = UserAccessor::new(handle_out).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }

    log::debug!("create thread {name}");
    sched::spawn(&thread);
    Ok(0)
}

/// `ProcessCreate(handle_out, path, path_len, info)`
pub fn process_create(args: Args) -> SysResult<usize> {
    let [handle_out, path_ptr, path_len, info_ptr, _] = args;

    let path = UserAccessor::new(path_ptr).load_string(path_len)?;
    let info: ProcessCreateInfo = UserAccessor::new(info_ptr).load_value()?;

    const MAX_ARGS: usize = 64;
    if info.arg_count > MAX_ARGS {
        return Err(SysError::InvalidArgument);
    }
    let mut cmdline = alloc::vec![String::new(); 0];
    cmdline.push(path.clone());
    for i in 0..info.arg_count {
        let view: StringView =
            UserAccessor::new(info.args as usize + i * size_of::<StringView>()).load_value()?;
        cmdline.push(UserAccessor::new(view.str as usize).load_string(view.len)?);
    }

    // Standard handles: either duplicated from the caller's table or
    // defaulted to the console.
    let caller = sched::current_process();
    let mut std_handles: [Option<Object>; 3] = [const { None }; 3];
    for (slot, &handle) in [info.stdin, info.stdout, info.stderr].iter().enumerate() {
        if handle != osprey_abi::INVALID_HANDLE {
            std_handles[slot] = Some(caller.handles.get(handle)?);
        }
    }

    let process = crate::exec::spawn_process(&path, &cmdline, std_handles)?;
    let descriptor = crate::sched::process::ProcessDescriptor::new(&process);
    let handle = caller.handles.insert(Object::ProcessDescriptor(descriptor));

    if let Err(err) = UserAccessor::new(handle_out).store_value(&handle) {
        caller.handles.remove(handle).ok();
        return Err(err);
    }
    Ok(0)
}

/// `Kill(handle)` — terminate the process named by a descriptor.
pub fn kill(args: Args) -> SysResult<usize> {
    let handle = args[0] as Handle;
    let descriptor = sched::current_process()
        .handles
        .get_process_descriptor(handle)?;
    let process = descriptor.get().ok_or(SysError::InvalidArgument)?;
    sched::kill_process(&process, 128 + osprey_abi::signal::SIGKILL as i32);
    Ok(0)
}

/// `GetStatus(handle)` — the exit status of a process or thread
/// descriptor, or `TryAgain` while the target runs.
pub fn get_status(args: Args) -> SysResult<usize> {
    let handle = args[0] as Handle;
    let process = sched::current_process();
    match process.handles.get(handle)? {
        Object::ProcessDescriptor(descriptor) => {
            if !descriptor.exited.load(Ordering::SeqCst) {
                return Err(SysError::TryAgain);
            }
            Ok(descriptor.exit_status.load(Ordering::SeqCst) as usize)
        }
        Object::ThreadDescriptor(descriptor) => {
            if !descriptor.exited.load(Ordering::SeqCst) {
                return Err(SysError::TryAgain);
            }
            Ok(descriptor.exit_status.load(Ordering::SeqCst) as usize)
        }
        _ => Err(SysError::InvalidArgument),
    }
}

/// `Sleep(ns)`
pub fn sleep(args: Args) -> SysResult<usize> {
    let ns = args[0] as u64;
    sched::sleep_us(ns / 1_000);
    Ok(0)
}

/// `GetTime(out)` — monotonic nanoseconds.
pub fn get_time(args: Args) -> SysResult<usize> {
    let now = crate::time::now_ns();
    UserAccessor::new(args[0]).store_value(&now)?;
    Ok(0)
}

/// `GetDateTime(out)`
pub fn get_date_time(args: Args) -> SysResult<usize> {
    let now = crate::time::date_time();
    UserAccessor::new(args[0]).store_value(&now)?;
    Ok(0)
}

/// `Syslog(str, len)`
pub fn syslog(args: Args) -> SysResult<usize> {
    let [ptr, len, ..] = args;
    const SYSLOG_MAX: usize = 1024;
    let text = UserAccessor::new(ptr).load_string(len.min(SYSLOG_MAX))?;
    let process = sched::current_process();
    log::info!("[{}] {}", process.name, text.trim_end());
    Ok(0)
}
