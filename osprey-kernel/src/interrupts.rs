//! Interrupt descriptor table, vector allocation and IRQ dispatch.
//!
//! Vectors 0x00-0x1F are CPU exceptions. Everything above is handed out
//! by the vector allocator (shared or exclusive). Registered handlers
//! chain; the first one returning `true` stops propagation. After the
//! chain runs, EOI is sent and this CPU's deferred-work queue is
//! drained, so deferred items (including the scheduler's context
//! switch) run with the interrupt acknowledged.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::warn;
use spinning_top::{RwSpinlock, Spinlock};
use x86_64::registers::control::Cr2;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::idt::{
    InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
};
use x86_64::PrivilegeLevel;

use crate::cpu;

/// A chained IRQ handler: returns true to stop propagation.
pub type IrqHandler = Box<dyn Fn(&InterruptStackFrame) -> bool + Send + Sync>;

const VECTOR_BASE: usize = 32;
const VECTOR_COUNT: usize = 256 - VECTOR_BASE;

#[derive(Clone, Copy, PartialEq, Eq)]
enum VectorState {
    Free,
    Exclusive,
    Shared,
}

struct VectorSlot {
    state: VectorState,
    handlers: Vec<IrqHandler>,
}

static DESCRIPTOR_TABLE: RwSpinlock<InterruptDescriptorTable> =
    RwSpinlock::new(InterruptDescriptorTable::new());

static VECTORS: Spinlock<[VectorSlot; VECTOR_COUNT]> = Spinlock::new(
    [const {
        VectorSlot {
            state: VectorState::Free,
            handlers: Vec::new(),
        }
    }; VECTOR_COUNT],
);

/// Vectors with fixed roles, never handed out by the allocator.
fn is_reserved(vector: u8) -> bool {
    matches!(
        vector,
        crate::apic::TIMER_VECTOR
            | crate::apic::SPURIOUS_VECTOR
            | cpu::TLB_SHOOTDOWN_VECTOR
            | cpu::HALT_VECTOR
    )
}

/// Allocate an interrupt vector in 32..=255.
///
/// A shared vector may be handed out again to other shared users; an
/// exclusive one never is.
pub fn alloc_vector(shared: bool) -> Option<u8> {
    let _irq = crate::irq_guard::IrqGuard::new();
    let mut vectors = VECTORS.lock();
    for i in 0..VECTOR_COUNT {
        let vector = (VECTOR_BASE + i) as u8;
        if is_reserved(vector) {
            continue;
        }
        let slot = &mut vectors[i];
        match slot.state {
            VectorState::Free => {
                slot.state = if shared {
                    VectorState::Shared
                } else {
                    VectorState::Exclusive
                };
                return Some(vector);
            }
            VectorState::Shared if shared => return Some(vector),
            _ => {}
        }
    }
    None
}

/// Return an exclusive vector to the allocator. The handler chain is
/// dropped.
pub fn dealloc_vector(vector: u8) {
    let _irq = crate::irq_guard::IrqGuard::new();
    let mut vectors = VECTORS.lock();
    let slot = &mut vectors[vector as usize - VECTOR_BASE];
    slot.state = VectorState::Free;
    slot.handlers.clear();
}

/// Append a handler to a vector's chain.
pub fn register_irq_handler(vector: u8, handler: IrqHandler) {
    let _irq = crate::irq_guard::IrqGuard::new();
    let mut vectors = VECTORS.lock();
    vectors[vector as usize - VECTOR_BASE].handlers.push(handler);
}

/// Point a vector straight at a naked entry, bypassing the chain
/// dispatch (the scheduler's preemption entry needs the full frame).
pub fn set_raw_handler(vector: u8, entry: u64) {
    let mut descriptor_table = DESCRIPTOR_TABLE.write();
    let kernel_cs = SegmentSelector::new(1, PrivilegeLevel::Ring0);
    unsafe {
        descriptor_table[vector]
            .set_handler_addr(x86_64::VirtAddr::new(entry))
            .set_code_selector(kernel_cs);
    }
}

/// Common dispatch for every allocatable vector.
fn dispatch_irq(vector: u8, frame: &InterruptStackFrame) {
    crate::random::add_irq_entropy(
        vector,
        frame.instruction_pointer.as_u64(),
        frame.stack_pointer.as_u64(),
    );

    match vector {
        v if v == cpu::TLB_SHOOTDOWN_VECTOR => {
            x86_64::instructions::tlb::flush_all();
            crate::apic::eoi();
            return;
        }
        v if v == cpu::HALT_VECTOR => {
            crate::apic::eoi();
            loop {
                x86_64::instructions::hlt();
            }
        }
        v if v == crate::apic::SPURIOUS_VECTOR => {
            // No EOI for spurious interrupts.
            return;
        }
        v if v == crate::apic::TIMER_VECTOR => {
            // The scheduler replaces this stub with its own full-frame
            // entry; a tick landing before that is acknowledged only.
        }
        _ => {
            let handled = {
                let vectors = VECTORS.lock();
                let slot = &vectors[vector as usize - VECTOR_BASE];
                slot.handlers.iter().any(|handler| handler(frame))
            };
            if !handled {
                warn!("no handler claimed irq {vector}");
            }
        }
    }

    crate::apic::eoi();

    // Deferred work runs with the interrupt acknowledged but IF still
    // clear; the scheduler's context switch lives here.
    if let Some(current) = cpu::try_current_cpu() {
        loop {
            let item = current.deferred_work.lock().pop();
            match item {
                Some(mut work) => work.call(),
                None => break,
            }
        }
    }
}

macro_rules! irq_stubs {
    ($idt:expr, $kernel_cs:expr, $($vector:literal),* $(,)?) => {
        $(
            {
                extern "x86-interrupt" fn stub(frame: InterruptStackFrame) {
                    dispatch_irq($vector, &frame);
                }
                unsafe {
                    $idt[$vector as u8]
                        .set_handler_fn(stub)
                        .set_code_selector($kernel_cs);
                }
            }
        )*
    };
}

pub fn init() {
    let mut descriptor_table = DESCRIPTOR_TABLE.write();
    let kernel_cs = SegmentSelector::new(1, PrivilegeLevel::Ring0);

    unsafe {
        descriptor_table
            .divide_error
            .set_handler_fn(divide_error_handler)
            .set_code_selector(kernel_cs);

        descriptor_table
            .breakpoint
            .set_handler_fn(breakpoint_handler)
            .set_privilege_level(PrivilegeLevel::Ring3)
            .set_code_selector(kernel_cs);

        descriptor_table
            .invalid_opcode
            .set_handler_fn(invalid_opcode_handler)
            .set_code_selector(kernel_cs);

        descriptor_table
            .double_fault
            .set_handler_fn(double_fault_handler)
            .set_code_selector(kernel_cs)
            .set_stack_index(1);

        descriptor_table
            .general_protection_fault
            .set_handler_fn(gpf_handler)
            .set_code_selector(kernel_cs);

        descriptor_table
            .page_fault
            .set_handler_fn(page_fault_handler)
            .set_code_selector(kernel_cs);
    }

    irq_stubs!(
        descriptor_table,
        kernel_cs,
        32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43,
        44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55,
        56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67,
        68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79,
        80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91,
        92, 93, 94, 95, 96, 97, 98, 99, 100, 101, 102, 103,
        104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115,
        116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127,
        128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139,
        140, 141, 142, 143, 144, 145, 146, 147, 148, 149, 150, 151,
        152, 153, 154, 155, 156, 157, 158, 159, 160, 161, 162, 163,
        164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175,
        176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187,
        188, 189, 190, 191, 192, 193, 194, 195, 196, 197, 198, 199,
        200, 201, 202, 203, 204, 205, 206, 207, 208, 209, 210, 211,
        212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222, 223,
        224, 225, 226, 227, 228, 229, 230, 231, 232, 233, 234, 235,
        236, 237, 238, 239, 240, 241, 242, 243, 244, 245, 246, 247,
        248, 249, 250, 251, 252, 253, 254, 255,
    );

    drop(descriptor_table);

    unsafe {
        (*DESCRIPTOR_TABLE.data_ptr()).load();
    }
}

/// Whether the faulting frame came from ring 3.
fn from_user(frame: &InterruptStackFrame) -> bool {
    frame.code_segment.rpl() == PrivilegeLevel::Ring3
}

/// Kill the faulting user process with `signal`, or panic for kernel
/// faults.
fn fatal_fault(frame: &InterruptStackFrame, what: &str, signal: u32) -> ! {
    if from_user(frame) {
        warn!(
            "{what} in user mode at {:#x}, killing process",
            frame.instruction_pointer.as_u64()
        );
        crate::sched::kill_current_process(signal);
    }
    panic!("{what} in kernel mode at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    fatal_fault(&frame, "divide error", osprey_abi::signal::SIGFPE);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::debug!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fatal_fault(&frame, "invalid opcode", osprey_abi::signal::SIGILL);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error: u64) -> ! {
    panic!("double fault (error {error:#x}) at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn gpf_handler(frame: InterruptStackFrame, error: u64) {
    if from_user(&frame) {
        warn!(
            "general protection fault (error {error:#x}) in user mode at {:#x}",
            frame.instruction_pointer.as_u64()
        );
        crate::sched::kill_current_process(osprey_abi::signal::SIGSEGV);
    }
    panic!(
        "general protection fault (error {error:#x}) at {:#x}",
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn page_fault_handler(
    mut frame: InterruptStackFrame,
    error: PageFaultErrorCode,
) {
    let addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);

    // Faults taken while the syscall layer is copying user memory are
    // redirected to its fixup path instead of killing anything.
    if crate::syscall::user::handle_copy_fault(&mut frame) {
        return;
    }

    if from_user(&frame) {
        warn!(
            "page fault at {addr:#x} ({error:?}) rip={:#x}, killing process",
            frame.instruction_pointer.as_u64()
        );
        crate::sched::kill_current_process(osprey_abi::signal::SIGSEGV);
    }
    panic!(
        "kernel page fault at {addr:#x} ({error:?}) rip={:#x}",
        frame.instruction_pointer.as_u64()
    );
}
