//! Context switching and the preemption entry point.
//!
//! Threads switch by swapping kernel stacks: `switch_context` saves the
//! callee-saved registers on the outgoing thread's stack and resumes
//! the incoming one wherever it last called `switch_context` (or at its
//! fresh-thread trampoline). The timer interrupt uses a naked entry
//! that spills every GPR first, so a preempted thread can be resumed
//! exactly and signals can be delivered by rewriting the trap frame on
//! the way back to user mode.

use core::arch::naked_asm;

use x86_64::VirtAddr;

/// Saved callee context; `rsp` points into the thread's kernel stack.
#[repr(C)]
pub struct Context {
    pub rsp: u64,
}

/// GPRs spilled by the preemption entry, in push order (top of the
/// struct is the last push).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedGprs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// The hardware interrupt frame.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Context {
    /// Craft the initial stack so the first `switch_context` into this
    /// thread "returns" into `thread_trampoline`.
    pub fn fresh(stack_top: VirtAddr) -> Context {
        const FRAME_WORDS: usize = 7; // 6 callee-saved + return address
        let rsp = stack_top.as_u64() - (FRAME_WORDS * 8) as u64;
        unsafe {
            let frame = rsp as *mut u64;
            for i in 0..6 {
                frame.add(i).write(0);
            }
            frame.add(6).write(thread_trampoline as usize as u64);
        }
        Context { rsp }
    }
}

/// Swap kernel stacks between two threads.
///
/// # Safety
/// Interrupts must be disabled. `prev` must be the running thread's
/// context cell and `next` a context previously produced by
/// `Context::fresh` or an earlier switch.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(prev: *mut Context, next: *const Context) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// First code a fresh thread runs, with its stack at the very top.
#[unsafe(naked)]
extern "C" fn thread_trampoline() {
    naked_asm!(
        "xor ebp, ebp",
        "call {entry}",
        "ud2",
        entry = sym thread_entry,
    )
}

extern "C" fn thread_entry() -> ! {
    // We arrive here from do_schedule with interrupts still disabled.
    super::finish_switch();

    let thread = crate::cpu::current_thread();
    let entry = thread
        .entry
        .lock()
        .take()
        .expect("fresh thread has an entry");

    match entry {
        super::thread::ThreadEntry::Kernel(f) => {
            x86_64::instructions::interrupts::enable();
            f();
            super::exit_thread(0);
        }
        super::thread::ThreadEntry::User { ip, sp, arg } => {
            let user_cs = crate::syscall::gdt::user_code_selector() as u64;
            let user_ss = crate::syscall::gdt::user_data_selector() as u64;
            unsafe { enter_user(ip.as_u64(), sp.as_u64(), arg, user_cs, user_ss) }
        }
    }
}

/// Drop to ring 3 via `iretq`. Interrupts come back on in user mode
/// through the pushed RFLAGS.
///
/// # Safety
/// `ip`/`sp` must point into mappings of the active user page map.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user(ip: u64, sp: u64, arg: u64, user_cs: u64, user_ss: u64) -> ! {
    naked_asm!(
        "push r8",        // ss
        "push rsi",       // user rsp
        "push 0x202",     // rflags: IF set
        "push rcx",       // cs
        "push rdi",       // rip
        "mov rdi, rdx",   // sole argument
        "xor esi, esi",
        "xor edx, edx",
        "xor ecx, ecx",
        "xor r8d, r8d",
        "xor r9d, r9d",
        "xor r10d, r10d",
        "xor r11d, r11d",
        "xor ebx, ebx",
        "xor ebp, ebp",
        "xor r12d, r12d",
        "xor r13d, r13d",
        "xor r14d, r14d",
        "xor r15d, r15d",
        "iretq",
    )
}

/// Naked preemption entry installed on the timer vector. Spills all
/// GPRs, hands the handler pointers to them and to the hardware frame,
/// and restores everything on resume.
#[unsafe(naked)]
pub extern "C" fn timer_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "lea rsi, [rsp + 120]",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym super::timer_interrupt_handler,
    )
}
