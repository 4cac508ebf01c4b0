//! Futex and signal syscalls.

use osprey_abi::signal::SignalAction;
use osprey_abi::{SysError, SysResult};

use super::Args;
use super::user::UserAccessor;
use crate::sched;

/// `FutexWait(ptr, expected, timeout_ns)`
pub fn futex_wait(args: Args) -> SysResult<usize> {
    let [ptr, expected, timeout_ns, ..] = args;
    let process = sched::current_process();
    process
        .futexes
        .wait(ptr, expected as u32, timeout_ns as u64)?;
    Ok(0)
}

/// `FutexWake(ptr, count)`
pub fn futex_wake(args: Args) -> SysResult<usize> {
    let [ptr, count, ..] = args;
    let process = sched::current_process();
    Ok(process.futexes.wake(ptr, count))
}

/// `SignalAction(signal, new_action, old_action_out)` — either pointer
/// may be null to only query or only set.
pub fn signal_action(args: Args) -> SysResult<usize> {
    let [signal, new_ptr, old_ptr, ..] = args;
    let signal = signal as u32;
    let process = sched::current_process();

    if signal as usize >= osprey_abi::signal::SIGNAL_COUNT {
        return Err(SysError::InvalidArgument);
    }

    let old = process.signals.get(signal);
    if new_ptr != 0 {
        let action: SignalAction = UserAccessor::new(new_ptr).load_value()?;
        process
            .signals
            .set(signal, action)
            .map_err(|_| SysError::NoPermissions)?;
    }
    if old_ptr != 0 {
        UserAccessor::new(old_ptr).store_value(&old)?;
    }
    Ok(0)
}

/// `SignalReturn()` — restore the context interrupted by signal
/// delivery. The mask comes back here; the dispatcher tail consumes
/// the saved frame and rewrites the syscall return slots, so the call
/// "returns" to the original interruption point with the original RAX.
pub fn signal_return(_args: Args) -> SysResult<usize> {
    let thread = crate::cpu::current_thread();
    let saved_mask = {
        let context = thread.signal_context.lock();
        context.as_ref().map(|saved| saved.old_mask)
    }
    .ok_or(SysError::InvalidArgument)?;

    thread
        .signal_mask
        .store(saved_mask, core::sync::atomic::Ordering::SeqCst);
    Ok(0)
}
