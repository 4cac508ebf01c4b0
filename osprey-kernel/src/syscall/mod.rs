//! Syscall dispatch.
//!
//! One entry point per trap; the dispatcher decodes the number, hands
//! off to the per-area handler modules, and folds their
//! `SysResult<usize>` into the signed return word. Every pointer
//! argument is copied through [`user::UserAccessor`]; a fault while
//! touching user memory becomes `ERR_FAULT`, never a panic.

pub mod entry;
pub mod gdt;
pub mod user;

mod devlink_ops;
mod evm_ops;
mod fs_ops;
mod mem_ops;
mod misc_ops;
mod socket_ops;
mod sync_ops;
mod task_ops;

use core::sync::atomic::Ordering;

use osprey_abi::Syscall;

use crate::sched;
use crate::sched::context::{SavedGprs, TrapFrame};

/// The syscall return slots saved by the entry asm. Signal delivery may
/// rewrite `rip`, `user_rsp` and `rdi` before `sysretq` consumes them.
#[repr(C)]
pub struct SyscallFrame {
    pub user_rsp: u64,
    pub rdi: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Initialize GDT/TSS and the syscall MSRs.
pub fn init() {
    gdt::init();
    entry::init();
}

pub(self) type Args = [usize; 5];

extern "sysv64" fn syscall_handler(
    num: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    frame: *mut SyscallFrame,
) -> isize {
    // SFMASK kept interrupts off through the stack switch; the handler
    // itself runs preemptible.
    x86_64::instructions::interrupts::enable();

    let args = [a0, a1, a2, a3, a4];
    let result = dispatch(num, args);

    #[cfg(feature = "verbose_log")]
    log::debug!("syscall {num}({args:x?}) -> {result:?}");

    let mut ret = match result {
        Ok(value) => value as isize,
        Err(err) => err.as_isize(),
    };

    x86_64::instructions::interrupts::disable();

    // A successful SignalReturn swaps the interrupted context back into
    // the return slots.
    if num == Syscall::SignalReturn as usize
        && ret == 0
        && let Some(thread) = crate::cpu::try_current_thread()
        && let Some(saved) = thread.signal_context.lock().take()
    {
        let frame = unsafe { &mut *frame };
        frame.rip = saved.frame.rip;
        frame.user_rsp = saved.frame.rsp;
        frame.rflags = saved.frame.rflags;
        frame.rdi = saved.gprs.rdi;
        ret = saved.gprs.rax as isize;
    }

    deliver_signals_on_return(unsafe { &mut *frame }, ret)
}

fn dispatch(num: usize, args: Args) -> osprey_abi::SysResult<usize> {
    use osprey_abi::SysError;

    let thread = crate::cpu::current_thread();
    if thread.process.killed.load(Ordering::SeqCst) {
        // The process is going down; finish the job instead of running
        // one more syscall on its behalf.
        sched::exit_thread(thread.process.exit_status.load(Ordering::SeqCst));
    }

    let Some(syscall) = Syscall::from_raw(num) else {
        return Err(SysError::InvalidArgument);
    };

    match syscall {
        Syscall::ThreadCreate => task_ops::thread_create(args),
        Syscall::ThreadExit => sched::exit_thread(args[0] as i32),
        Syscall::ProcessCreate => task_ops::process_create(args),
        Syscall::ProcessExit => sched::exit_process(args[0] as i32),
        Syscall::Kill => task_ops::kill(args),
        Syscall::GetStatus => task_ops::get_status(args),
        Syscall::GetThreadId => Ok(thread.id as usize),
        Syscall::Sleep => task_ops::sleep(args),
        Syscall::GetTime => task_ops::get_time(args),
        Syscall::GetDateTime => task_ops::get_date_time(args),
        Syscall::Syslog => task_ops::syslog(args),
        Syscall::Map => mem_ops::map(args),
        Syscall::Unmap => mem_ops::unmap(args),
        Syscall::Devlink => devlink_ops::devlink(args),
        Syscall::CloseHandle => misc_ops::close_handle(args),
        Syscall::MoveHandle => misc_ops::move_handle(args),
        Syscall::PollEvent => misc_ops::poll_event(args),
        Syscall::Shutdown => misc_ops::shutdown(args),
        Syscall::Openat => fs_ops::openat(args),
        Syscall::Read => fs_ops::read(args),
        Syscall::Write => fs_ops::write(args),
        Syscall::Seek => fs_ops::seek(args),
        Syscall::Stat => fs_ops::stat(args),
        Syscall::ListDir => fs_ops::list_dir(args),
        Syscall::PipeCreate => fs_ops::pipe_create(args),
        Syscall::ReplaceStdHandle => fs_ops::replace_std_handle(args),
        Syscall::ServiceCreate => misc_ops::service_create(args),
        Syscall::ServiceGet => misc_ops::service_get(args),
        Syscall::SocketCreate => socket_ops::create(args),
        Syscall::SocketConnect => socket_ops::connect(args),
        Syscall::SocketListen => socket_ops::listen(args),
        Syscall::SocketAccept => socket_ops::accept(args),
        Syscall::SocketSend => socket_ops::send(args),
        Syscall::SocketReceive => socket_ops::receive(args),
        Syscall::SocketSendTo => socket_ops::send_to(args),
        Syscall::SocketReceiveFrom => socket_ops::receive_from(args),
        Syscall::SocketGetPeerName => socket_ops::get_peer_name(args),
        Syscall::SharedMemAlloc => mem_ops::shared_mem_alloc(args),
        Syscall::SharedMemMap => mem_ops::shared_mem_map(args),
        Syscall::SharedMemShare => mem_ops::shared_mem_share(args),
        Syscall::FutexWait => sync_ops::futex_wait(args),
        Syscall::FutexWake => sync_ops::futex_wake(args),
        Syscall::SetFsBase => misc_ops::set_fs_base(args),
        Syscall::SetGsBase => misc_ops::set_gs_base(args),
        Syscall::GetFsBase => misc_ops::get_fs_base(args),
        Syscall::GetGsBase => misc_ops::get_gs_base(args),
        Syscall::GetArchInfo => misc_ops::get_arch_info(args),
        Syscall::SignalAction => sync_ops::signal_action(args),
        Syscall::SignalReturn => sync_ops::signal_return(args),
        Syscall::EvmCreate => evm_ops::create(args),
        Syscall::EvmCreateVcpu => evm_ops::create_vcpu(args),
        Syscall::EvmMap => evm_ops::map(args),
        Syscall::EvmUnmap => evm_ops::unmap(args),
        Syscall::EvmVcpuRun => evm_ops::vcpu_run(args),
        Syscall::EvmVcpuWriteState => evm_ops::vcpu_write_state(args),
        Syscall::EvmVcpuReadState => evm_ops::vcpu_read_state(args),
        Syscall::EvmVcpuTriggerIrq => evm_ops::vcpu_trigger_irq(args),
    }
}

/// Run signal delivery against the syscall return slots. The saved
/// caller-saved registers are dead across a syscall by ABI, so the
/// reconstructed trap frame only carries the live ones.
fn deliver_signals_on_return(frame: &mut SyscallFrame, ret: isize) -> isize {
    let Some(thread) = crate::cpu::try_current_thread() else {
        return ret;
    };
    if !sched::signal::has_deliverable(thread) {
        return ret;
    }

    let mut gprs = SavedGprs {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rbp: 0,
        rdi: frame.rdi,
        rsi: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: ret as u64,
    };
    let mut trap = TrapFrame {
        rip: frame.rip,
        cs: gdt::user_code_selector() as u64,
        rflags: frame.rflags,
        rsp: frame.user_rsp,
        ss: gdt::user_data_selector() as u64,
    };

    sched::signal::deliver_on_trap(&mut gprs, &mut trap);

    frame.rip = trap.rip;
    frame.rflags = trap.rflags;
    frame.user_rsp = trap.rsp;
    frame.rdi = gprs.rdi;
    gprs.rax as isize
}
