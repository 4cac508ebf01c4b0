//! Signals.
//!
//! A 64-slot disposition table per process, a mask and pending set per
//! thread. Delivery happens on return-from-trap to user mode: the
//! lowest pending unblocked signal wins, the interrupted user context
//! is saved, and the trap frame is rewritten to enter the handler on
//! the user (or alternate) stack. `SignalReturn` restores the saved
//! context.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use osprey_abi::signal::{
    self as abi, DefaultAction, SIG_DFL, SIG_IGN, SIGNAL_COUNT, SignalAction,
};
use spinning_top::Spinlock;

use super::context::{SavedGprs, TrapFrame};
use super::process::Process;
use super::thread::Thread;

/// Per-process handler table.
pub struct SignalDispositions {
    actions: Spinlock<[SignalAction; SIGNAL_COUNT]>,
}

impl SignalDispositions {
    pub fn new() -> Self {
        Self {
            actions: Spinlock::new(
                [SignalAction {
                    handler: SIG_DFL,
                    trampoline: 0,
                    mask: 0,
                }; SIGNAL_COUNT],
            ),
        }
    }

    pub fn get(&self, signal: u32) -> SignalAction {
        self.actions.lock()[signal as usize]
    }

    /// Install a handler. `SIGKILL`/`SIGSTOP` cannot be overridden.
    pub fn set(&self, signal: u32, action: SignalAction) -> Result<SignalAction, ()> {
        if signal as usize >= SIGNAL_COUNT || abi::is_unblockable(signal) {
            return Err(());
        }
        let mut actions = self.actions.lock();
        let old = actions[signal as usize];
        actions[signal as usize] = action;
        Ok(old)
    }

    /// Reset everything to default; used on exec.
    pub fn reset(&self) {
        *self.actions.lock() = [SignalAction {
            handler: SIG_DFL,
            trampoline: 0,
            mask: 0,
        }; SIGNAL_COUNT];
    }
}

/// An alternate delivery stack registered by userspace. Held through a
/// handle so the region's lifetime is explicit.
pub struct SignalStack {
    pub base: u64,
    pub size: usize,
}

/// The interrupted user context saved while a handler runs, restored by
/// `SignalReturn`.
#[derive(Clone, Copy)]
pub struct SavedUserContext {
    pub gprs: SavedGprs,
    pub frame: TrapFrame,
    pub old_mask: u64,
}

/// Post `signal` to `process`: pick the first thread that does not mask
/// it (pending anywhere if all mask it) and kick the thread awake so
/// the next return to user mode delivers.
///
/// `SIGKILL` bypasses everything and terminates immediately.
pub fn send(process: &Arc<Process>, signal: u32) -> Result<(), ()> {
    if signal == 0 || signal as usize >= SIGNAL_COUNT {
        return Err(());
    }
    if signal == abi::SIGKILL {
        super::kill_process(process, 128 + signal as i32);
        return Ok(());
    }

    let threads = process.threads.lock().clone();
    if threads.is_empty() {
        return Err(());
    }
    let bit = 1u64 << signal;
    let target = threads
        .iter()
        .find(|t| t.signal_mask.load(Ordering::SeqCst) & bit == 0)
        .unwrap_or(&threads[0]);

    target.pending_signals.fetch_or(bit, Ordering::SeqCst);
    // A blocked target must wake to reach its delivery point.
    super::unblock(target, true);
    Ok(())
}

/// The lowest deliverable signal for `thread`, if any.
fn next_deliverable(thread: &Thread) -> Option<u32> {
    let pending = thread.pending_signals.load(Ordering::SeqCst);
    let deliverable = pending & !thread.signal_mask.load(Ordering::SeqCst);
    if deliverable == 0 {
        return None;
    }
    Some(deliverable.trailing_zeros())
}

/// Deliver pending signals on the way back to user mode. Rewrites
/// `gprs`/`frame` in place when a user handler is invoked.
pub fn deliver_on_trap(gprs: &mut SavedGprs, frame: &mut TrapFrame) {
    let Some(thread) = crate::cpu::try_current_thread() else {
        return;
    };

    while let Some(signal) = next_deliverable(thread) {
        let bit = 1u64 << signal;
        thread.pending_signals.fetch_and(!bit, Ordering::SeqCst);

        let action = thread.process.signals.get(signal);
        match action.handler {
            SIG_IGN => continue,
            SIG_DFL => match abi::default_action(signal) {
                DefaultAction::Ignore | DefaultAction::Continue => continue,
                DefaultAction::Stop => {
                    // Minimal job control: stop folds into terminate for
                    // processes with no handler installed.
                    super::kill_process(&thread.process, 128 + signal as i32);
                    super::exit_thread(128 + signal as i32);
                }
                DefaultAction::Terminate => {
                    super::kill_process(&thread.process, 128 + signal as i32);
                    super::exit_thread(128 + signal as i32);
                }
            },
            handler => {
                // Block the signal (and the action's mask) while the
                // handler runs; SignalReturn restores the old mask.
                let old_mask = thread.signal_mask.load(Ordering::SeqCst);
                let handler_mask = (old_mask | action.mask | bit)
                    & !((1 << abi::SIGKILL) | (1 << abi::SIGSTOP));
                thread.signal_mask.store(handler_mask, Ordering::SeqCst);

                *thread.signal_context.lock() = Some(SavedUserContext {
                    gprs: *gprs,
                    frame: *frame,
                    old_mask,
                });

                // Build the handler frame on the user stack: red zone
                // skipped, return address pointing at the trampoline.
                let mut sp = frame.rsp - 128;
                sp &= !0xf;
                sp -= 8;
                unsafe {
                    crate::syscall::user::write_user_u64(sp, action.trampoline as u64);
                }

                frame.rip = action.handler as u64;
                frame.rsp = sp;
                gprs.rdi = signal as u64;
                return;
            }
        }
    }
}

/// Whether the calling thread has a deliverable signal; used by the
/// syscall exit path to decide to detour through delivery.
pub fn has_deliverable(thread: &Thread) -> bool {
    next_deliverable(thread).is_some()
}
