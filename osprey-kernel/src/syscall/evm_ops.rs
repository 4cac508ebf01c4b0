//! EVM syscalls.

use osprey_abi::evm::{EvmIrqInfo, EvmIrqType};
use osprey_abi::{Handle, SysError, SysResult};

use super::Args;
use super::user::UserAccessor;
use crate::evm::{Evm, VirtualCpu};
use crate::handle::Object;
use crate::sched;

/// `EvmCreate(handle_out)`
pub fn create(args: Args) -> SysResult<usize> {
    let evm = Evm::create()?;
    let process = sched::current_process();
    let handle = process.handles.insert(Object::Evm(evm));
    if let Err(err) = UserAccessor::new(args[0]).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }
    Ok(0)
}

/// `EvmCreateVcpu(evm_handle, vcpu_handle_out, state_page_out)`
pub fn create_vcpu(args: Args) -> SysResult<usize> {
    let [evm_handle, vcpu_out, state_out, ..] = args;
    let process = sched::current_process();
    let evm = process.handles.get_evm(evm_handle as Handle)?;

    let (vcpu, state_addr) = VirtualCpu::create(&evm, &process)?;
    let handle = process.handles.insert(Object::VirtualCpu(vcpu));

    if let Err(err) = UserAccessor::new(vcpu_out).store_value(&handle) {
        process.handles.remove(handle).ok();
        return Err(err);
    }
    UserAccessor::new(state_out).store_value(&state_addr)?;
    Ok(0)
}

/// `EvmMap(evm_handle, guest_phys, host_virt, size)`
pub fn map(args: Args) -> SysResult<usize> {
    let [evm_handle, guest, host, size, _] = args;
    let process = sched::current_process();
    let evm = process.handles.get_evm(evm_handle as Handle)?;
    evm.map(&process, guest as u64, host as u64, size)?;
    Ok(0)
}

/// `EvmUnmap(evm_handle, guest_phys, size)`
pub fn unmap(args: Args) -> SysResult<usize> {
    let [evm_handle, guest, size, ..] = args;
    let process = sched::current_process();
    let evm = process.handles.get_evm(evm_handle as Handle)?;
    evm.unmap(guest as u64, size)?;
    Ok(0)
}

/// `EvmVcpuRun(vcpu_handle)`
pub fn vcpu_run(args: Args) -> SysResult<usize> {
    let vcpu = sched::current_process().handles.get_vcpu(args[0] as Handle)?;
    vcpu.run()?;
    Ok(0)
}

/// `EvmVcpuWriteState(vcpu_handle, changed_mask)`
pub fn vcpu_write_state(args: Args) -> SysResult<usize> {
    let [handle, mask, ..] = args;
    let vcpu = sched::current_process().handles.get_vcpu(handle as Handle)?;
    vcpu.write_state(mask as u32)?;
    Ok(0)
}

/// `EvmVcpuReadState(vcpu_handle, wanted_mask)`
pub fn vcpu_read_state(args: Args) -> SysResult<usize> {
    let [handle, mask, ..] = args;
    let vcpu = sched::current_process().handles.get_vcpu(handle as Handle)?;
    vcpu.read_state(mask as u32)?;
    Ok(0)
}

/// `EvmVcpuTriggerIrq(vcpu_handle, info)`
pub fn vcpu_trigger_irq(args: Args) -> SysResult<usize> {
    let [handle, info_ptr, ..] = args;
    let vcpu = sched::current_process().handles.get_vcpu(handle as Handle)?;

    // The type discriminant comes from userspace; decode it raw.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct RawIrqInfo {
        ty: u32,
        irq: u32,
        error: u32,
    }
    let raw: RawIrqInfo = UserAccessor::new(info_ptr).load_value()?;
    let ty = match raw.ty {
        x if x == EvmIrqType::Exception as u32 => EvmIrqType::Exception,
        x if x == EvmIrqType::Irq as u32 => EvmIrqType::Irq,
        _ => return Err(SysError::InvalidArgument),
    };
    vcpu.trigger_irq(EvmIrqInfo {
        ty,
        irq: raw.irq,
        error: raw.error,
    })?;
    Ok(0)
}
