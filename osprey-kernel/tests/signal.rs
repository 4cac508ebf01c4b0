#![no_std]
#![no_main]

extern crate alloc;

use osprey_abi::signal::{
    self, DefaultAction, SIG_DFL, SIG_IGN, SignalAction, default_action, is_unblockable,
};
use osprey_kernel::sched::signal::SignalDispositions;

osprey_kernel::test_harness!(
    default_table_follows_posix,
    kill_and_stop_are_fixed,
    dispositions_store_and_reset,
    handler_mask_is_returned_on_set,
);

fn default_table_follows_posix() {
    assert_eq!(default_action(signal::SIGKILL), DefaultAction::Terminate);
    assert_eq!(default_action(signal::SIGTERM), DefaultAction::Terminate);
    assert_eq!(default_action(signal::SIGSEGV), DefaultAction::Terminate);
    assert_eq!(default_action(signal::SIGCHLD), DefaultAction::Ignore);
    assert_eq!(default_action(signal::SIGURG), DefaultAction::Ignore);
    assert_eq!(default_action(signal::SIGWINCH), DefaultAction::Ignore);
    assert_eq!(default_action(signal::SIGCONT), DefaultAction::Continue);
    assert_eq!(default_action(signal::SIGSTOP), DefaultAction::Stop);
    assert_eq!(default_action(signal::SIGTSTP), DefaultAction::Stop);
}

fn kill_and_stop_are_fixed() {
    assert!(is_unblockable(signal::SIGKILL));
    assert!(is_unblockable(signal::SIGSTOP));
    assert!(!is_unblockable(signal::SIGTERM));

    let dispositions = SignalDispositions::new();
    let action = SignalAction {
        handler: 0x5000_0000_1000,
        trampoline: 0x5000_0000_2000,
        mask: 0,
    };
    // SIGKILL's disposition always terminates and cannot be overridden.
    assert!(dispositions.set(signal::SIGKILL, action).is_err());
    assert!(dispositions.set(signal::SIGSTOP, action).is_err());
    assert_eq!(dispositions.get(signal::SIGKILL).handler, SIG_DFL);
}

fn dispositions_store_and_reset() {
    let dispositions = SignalDispositions::new();
    let action = SignalAction {
        handler: 0x5000_0000_1000,
        trampoline: 0x5000_0000_2000,
        mask: 1 << signal::SIGUSR2,
    };
    dispositions.set(signal::SIGUSR1, action).unwrap();
    assert_eq!(dispositions.get(signal::SIGUSR1).handler, action.handler);

    let ignore = SignalAction {
        handler: SIG_IGN,
        trampoline: 0,
        mask: 0,
    };
    dispositions.set(signal::SIGPIPE, ignore).unwrap();
    assert_eq!(dispositions.get(signal::SIGPIPE).handler, SIG_IGN);

    // Exec resets everything to default.
    dispositions.reset();
    assert_eq!(dispositions.get(signal::SIGUSR1).handler, SIG_DFL);
    assert_eq!(dispositions.get(signal::SIGPIPE).handler, SIG_DFL);
}

fn handler_mask_is_returned_on_set() {
    let dispositions = SignalDispositions::new();
    let first = SignalAction {
        handler: 0x5000_0000_1000,
        trampoline: 0x5000_0000_2000,
        mask: 0xf0,
    };
    dispositions.set(signal::SIGUSR1, first).unwrap();
    let old = dispositions
        .set(
            signal::SIGUSR1,
            SignalAction {
                handler: SIG_DFL,
                trampoline: 0,
                mask: 0,
            },
        )
        .unwrap();
    assert_eq!(old.handler, first.handler);
    assert_eq!(old.mask, first.mask);
}
