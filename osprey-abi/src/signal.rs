//! Signal numbers, dispositions and the `SignalAction` ABI.

/// Number of signal slots per process.
pub const SIGNAL_COUNT: usize = 64;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGWINCH: u32 = 28;

/// What the kernel does when a signal with no user handler arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

/// The POSIX default disposition table. `SIGKILL` and `SIGSTOP` always
/// take their default action; `SignalAction` refuses to override them.
pub const fn default_action(signal: u32) -> DefaultAction {
    match signal {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGCONT => DefaultAction::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// Returns true for signals whose disposition and mask are fixed.
pub const fn is_unblockable(signal: u32) -> bool {
    matches!(signal, SIGKILL | SIGSTOP)
}

/// A userspace signal handler registration.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SignalAction {
    /// Handler entry point, or 0 for the default action, or 1 to ignore.
    pub handler: usize,
    /// Return trampoline the kernel points the frame's return address at.
    pub trampoline: usize,
    /// Signals blocked while the handler runs (in addition to the one
    /// being delivered).
    pub mask: u64,
}

pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;
