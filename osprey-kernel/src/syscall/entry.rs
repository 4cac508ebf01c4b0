//! Syscall entry point and MSR configuration.
//!
//! ABI: `syscall` with the call number in RDI and arguments in RSI,
//! RDX, R10, R8, R9; the signed result comes back in RAX. Caller-saved
//! registers are clobbered; callee-saved registers survive.

use core::arch::naked_asm;

use x86_64::{
    VirtAddr,
    registers::{
        control::{Efer, EferFlags},
        model_specific::{LStar, SFMask, Star},
        rflags::RFlags,
    },
};

use super::{SyscallFrame, gdt, syscall_handler};

/// Initialize syscall MSRs and the entry point.
pub fn init() {
    let kernel_cs = gdt::kernel_code_selector();
    let kernel_ds = gdt::kernel_data_selector();
    let user_cs = gdt::user_cs_selector();
    let user_ds = x86_64::structures::gdt::SegmentSelector(gdt::user_data_selector());

    Star::write(user_cs, user_ds, kernel_cs, kernel_ds).expect("STAR selector layout");

    LStar::write(VirtAddr::new(syscall_entry as usize as u64));

    // Interrupts stay masked from entry until the handler is on the
    // kernel stack.
    SFMask::write(RFlags::INTERRUPT_FLAG);

    unsafe {
        Efer::update(|efer| {
            efer.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
    }
}

/// Naked syscall entry.
///
/// On entry from userspace: rcx = return RIP, r11 = RFLAGS, rdi =
/// syscall number, rsi/rdx/r10/r8/r9 = arguments, IF masked by SFMASK.
///
/// Switches to the current thread's kernel stack, saves the callee
/// context plus a [`SyscallFrame`] (user RSP, RDI, RIP, RFLAGS — the
/// slots signal delivery may rewrite), and calls `syscall_handler`.
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    naked_asm!(
        "mov [rip + {scratch}], rsp",
        "mov rsp, [rip + {stack_top}]",

        // Callee-saved registers.
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push rbp",
        "push rbx",

        // SyscallFrame, top-down: rflags, rip, rdi, user rsp.
        "push r11",
        "push rcx",
        "push rdi",
        "push qword ptr [rip + {scratch}]",

        // sysv64 argument shuffle: handler(num, a0..a4, frame).
        // rdi=num rsi=a0 rdx=a1 r10=a2 r8=a3 r9=a4 already; a2 moves
        // into rcx (4th sysv arg), frame pointer goes on the stack.
        "mov rcx, r10",
        "mov rax, rsp",
        "sub rsp, 8",
        "push rax",
        "call {handler}",
        "add rsp, 16",

        // Unwind the SyscallFrame (possibly rewritten by signal
        // delivery): user rsp into r10, rdi, rip, rflags.
        "pop r10",
        "pop rdi",
        "pop rcx",
        "pop r11",

        "pop rbx",
        "pop rbp",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",

        "mov rsp, r10",
        "sysretq",
        handler = sym syscall_handler,
        stack_top = sym gdt::KERNEL_STACK_TOP,
        scratch = sym gdt::USER_RSP_SCRATCH,
    )
}
