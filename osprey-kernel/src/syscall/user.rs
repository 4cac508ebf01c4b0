//! Bounded, fault-safe access to user memory.
//!
//! Every user pointer entering a syscall goes through `UserAccessor`,
//! which range-checks the address and copies through small asm routines
//! with known fault landing pads. A page fault inside one of them is
//! redirected by the page-fault handler to the routine's fault exit,
//! which reports failure instead of panicking; the syscall then returns
//! `ERR_FAULT`.

use core::arch::global_asm;

use osprey_abi::{SysError, SysResult};
use x86_64::structures::idt::InterruptStackFrame;

use crate::memory::page_map::{USER_BASE, USER_TOP};

global_asm!(
    r#"
.global __user_copy
.global __user_copy_fault
.global __user_copy_end
__user_copy:
    mov rcx, rdx
    xor eax, eax
    rep movsb
    ret
__user_copy_fault:
    mov eax, 1
    ret
__user_copy_end:

.global __user_load32
.global __user_load32_fault
.global __user_load32_end
__user_load32:
    mov eax, [rdi]
    mov [rsi], eax
    xor eax, eax
    ret
__user_load32_fault:
    mov eax, 1
    ret
__user_load32_end:

.global __user_store64
.global __user_store64_fault
.global __user_store64_end
__user_store64:
    mov [rdi], rsi
    xor eax, eax
    ret
__user_store64_fault:
    mov eax, 1
    ret
__user_store64_end:
"#
);

unsafe extern "C" {
    fn __user_copy(dst: *mut u8, src: *const u8, len: usize) -> usize;
    fn __user_copy_fault();
    fn __user_copy_end();
    fn __user_load32(src: *const u32, out: *mut u32) -> usize;
    fn __user_load32_fault();
    fn __user_load32_end();
    fn __user_store64(dst: *mut u64, value: u64) -> usize;
    fn __user_store64_fault();
    fn __user_store64_end();
}

/// Redirect a page fault inside one of the guarded copy routines to its
/// fault exit. Returns true when the fault was absorbed.
pub fn handle_copy_fault(frame: &mut InterruptStackFrame) -> bool {
    let rip = frame.instruction_pointer.as_u64();
    let ranges: [(u64, u64, u64); 3] = [
        (
            __user_copy as usize as u64,
            __user_copy_fault as usize as u64,
            __user_copy_end as usize as u64,
        ),
        (
            __user_load32 as usize as u64,
            __user_load32_fault as usize as u64,
            __user_load32_end as usize as u64,
        ),
        (
            __user_store64 as usize as u64,
            __user_store64_fault as usize as u64,
            __user_store64_end as usize as u64,
        ),
    ];
    for (start, fault, _end) in ranges {
        if rip >= start && rip < fault {
            // The instruction pointer is the first field of the
            // (repr(C)) hardware frame; rewrite it in place.
            unsafe {
                let rip_slot = frame as *mut InterruptStackFrame as *mut u64;
                rip_slot.write_volatile(fault);
            }
            return true;
        }
    }
    false
}

fn validate(addr: usize, len: usize) -> SysResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(SysError::Fault)?;
    if (addr as u64) < USER_BASE || end as u64 > USER_TOP {
        return Err(SysError::Fault);
    }
    Ok(())
}

/// A user virtual address being accessed by the current syscall.
///
/// The accessor never dereferences the address directly; all traffic
/// goes through the guarded copy routines above, so a bad pointer
/// surfaces as `ERR_FAULT`.
#[derive(Clone, Copy)]
pub struct UserAccessor {
    addr: usize,
}

impl UserAccessor {
    pub fn new(addr: usize) -> UserAccessor {
        UserAccessor { addr }
    }

    /// Copy `buf.len()` bytes from user memory into `buf`.
    pub fn load(&self, buf: &mut [u8]) -> SysResult<()> {
        validate(self.addr, buf.len())?;
        let failed =
            unsafe { __user_copy(buf.as_mut_ptr(), self.addr as *const u8, buf.len()) };
        if failed != 0 {
            return Err(SysError::Fault);
        }
        Ok(())
    }

    /// Copy `buf` into user memory.
    pub fn store(&self, buf: &[u8]) -> SysResult<()> {
        validate(self.addr, buf.len())?;
        let failed = unsafe { __user_copy(self.addr as *mut u8, buf.as_ptr(), buf.len()) };
        if failed != 0 {
            return Err(SysError::Fault);
        }
        Ok(())
    }

    /// Read one `Copy` value from user memory.
    pub fn load_value<T: Copy>(&self) -> SysResult<T> {
        let mut value = core::mem::MaybeUninit::<T>::uninit();
        validate(self.addr, size_of::<T>())?;
        let failed = unsafe {
            __user_copy(
                value.as_mut_ptr() as *mut u8,
                self.addr as *const u8,
                size_of::<T>(),
            )
        };
        if failed != 0 {
            return Err(SysError::Fault);
        }
        Ok(unsafe { value.assume_init() })
    }

    /// Write one `Copy` value to user memory.
    pub fn store_value<T: Copy>(&self, value: &T) -> SysResult<()> {
        validate(self.addr, size_of::<T>())?;
        let failed = unsafe {
            __user_copy(
                self.addr as *mut u8,
                value as *const T as *const u8,
                size_of::<T>(),
            )
        };
        if failed != 0 {
            return Err(SysError::Fault);
        }
        Ok(())
    }

    /// Read a UTF-8 string of `len` bytes from user memory.
    pub fn load_string(&self, len: usize) -> SysResult<alloc::string::String> {
        const NAME_MAX: usize = 4096;
        if len > NAME_MAX {
            return Err(SysError::InvalidArgument);
        }
        let mut buf = alloc::vec![0u8; len];
        self.load(&mut buf)?;
        alloc::string::String::from_utf8(buf).map_err(|_| SysError::InvalidArgument)
    }
}

/// Atomically read a naturally aligned u32 from user memory (futex
/// compare step).
pub fn read_user_u32(addr: usize) -> SysResult<u32> {
    if addr % 4 != 0 {
        return Err(SysError::InvalidArgument);
    }
    validate(addr, 4)?;
    let mut out = 0u32;
    let failed = unsafe { __user_load32(addr as *const u32, &mut out) };
    if failed != 0 {
        return Err(SysError::Fault);
    }
    Ok(out)
}

/// Write a u64 to user memory, tolerating faults (signal frame build).
///
/// # Safety
/// The caller must be on the target process's page map.
pub unsafe fn write_user_u64(addr: u64, value: u64) {
    if validate(addr as usize, 8).is_err() {
        return;
    }
    unsafe {
        let _ = __user_store64(addr as *mut u64, value);
    }
}
