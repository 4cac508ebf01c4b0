//! GDT, TSS, and segment selector management.

use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use spinning_top::Spinlock;
use x86_64::{
    VirtAddr,
    instructions::tables::load_tss,
    registers::segmentation::{CS, DS, SS, Segment},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

static GDT: Spinlock<GlobalDescriptorTable> = Spinlock::new(GlobalDescriptorTable::new());
static TSS: Spinlock<TaskStateSegment> = Spinlock::new(TaskStateSegment::new());

/// Segment selectors set during GDT initialization.
static KERNEL_CS_SELECTOR: AtomicU16 = AtomicU16::new(0);
static KERNEL_DS_SELECTOR: AtomicU16 = AtomicU16::new(0);
static USER_CS_SELECTOR: AtomicU16 = AtomicU16::new(0);
static USER_DS_SELECTOR: AtomicU16 = AtomicU16::new(0);

pub fn kernel_code_selector() -> SegmentSelector {
    SegmentSelector(KERNEL_CS_SELECTOR.load(Ordering::Relaxed))
}

pub fn kernel_data_selector() -> SegmentSelector {
    SegmentSelector(KERNEL_DS_SELECTOR.load(Ordering::Relaxed))
}

/// The user code selector with RPL 3, as pushed in trap frames.
pub fn user_code_selector() -> u16 {
    USER_CS_SELECTOR.load(Ordering::Relaxed) | 3
}

pub fn user_cs_selector() -> SegmentSelector {
    SegmentSelector(USER_CS_SELECTOR.load(Ordering::Relaxed))
}

/// The user data selector with RPL 3.
pub fn user_data_selector() -> u16 {
    USER_DS_SELECTOR.load(Ordering::Relaxed) | 3
}

/// The current thread's kernel stack top. Read by the syscall entry asm
/// (RIP-relative) when switching off the user stack; kept in sync with
/// the TSS RSP0 slot by the scheduler.
pub static KERNEL_STACK_TOP: AtomicU64 = AtomicU64::new(0);

/// Scratch slot holding the user RSP for the few instructions between
/// syscall entry and its push onto the kernel stack. Interrupts are
/// masked by SFMASK for that window.
pub static USER_RSP_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Publish `top` as the kernel stack for ring transitions and syscalls.
pub fn set_kernel_stack(top: VirtAddr) {
    KERNEL_STACK_TOP.store(top.as_u64(), Ordering::Relaxed);
    let mut tss = TSS.lock();
    tss.privilege_stack_table[0] = top;
}

#[repr(align(0x1000))]
struct BootStack {
    inner: [u8; 0x8000],
}

/// Stack used between GDT setup and the first thread switch, and as the
/// ring-transition stack until the scheduler installs a thread stack.
static BOOT_STACK: BootStack = BootStack { inner: [0; 0x8000] };

const INTERRUPT_STACK_SIZE: usize = 8192;

/// IST stack for the double-fault handler.
static INTERRUPT_STACK_1: [u8; INTERRUPT_STACK_SIZE] = [0; INTERRUPT_STACK_SIZE];

/// Initialize the GDT, TSS, and segment selectors.
pub fn init() {
    let boot_stack_top = BOOT_STACK.inner.as_ptr() as u64 + BOOT_STACK.inner.len() as u64;
    KERNEL_STACK_TOP.store(boot_stack_top, Ordering::Relaxed);

    let mut tss = TSS.lock();
    tss.privilege_stack_table[0] = VirtAddr::new(boot_stack_top);
    let ist1_top = INTERRUPT_STACK_1.as_ptr() as u64 + INTERRUPT_STACK_SIZE as u64;
    tss.interrupt_stack_table[0] = VirtAddr::new(ist1_top);
    drop(tss);

    let mut gdt = GDT.lock();
    let kernel_cs = gdt.append(Descriptor::kernel_code_segment());
    let kernel_ds = gdt.append(Descriptor::kernel_data_segment());
    let tss_sel = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.data_ptr() }));
    let user_ds = gdt.append(Descriptor::user_data_segment());
    let user_cs = gdt.append(Descriptor::user_code_segment());
    drop(gdt);

    KERNEL_CS_SELECTOR.store(kernel_cs.0, Ordering::Relaxed);
    KERNEL_DS_SELECTOR.store(kernel_ds.0, Ordering::Relaxed);
    USER_CS_SELECTOR.store(user_cs.0, Ordering::Relaxed);
    USER_DS_SELECTOR.store(user_ds.0, Ordering::Relaxed);

    unsafe {
        (*GDT.data_ptr()).load();
        CS::set_reg(kernel_cs);
        DS::set_reg(kernel_ds);
        SS::set_reg(kernel_ds);
        load_tss(tss_sel);
    }
}
