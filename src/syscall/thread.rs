// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread, TLS and last-error calls

use log::trace;

use super::{ApiArgs, ApiOutcome, FALSE, TRUE};
use crate::error::{KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::object::Handle;
use crate::process::lifecycle::ThreadCreationFlags;
use crate::process::tls::TLS_OUT_OF_INDEXES;

/// ============================================================================
/// Creation and exit
/// ============================================================================

/// `CreateThread(lpAttributes, dwStackSize, lpStart, lpParameter, flags, lpThreadId)`
pub(super) fn create_thread(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let flags = ThreadCreationFlags::from_bits(args.arg_u32(4)).ok_or(Win32Error::InvalidFlags)?;
    let start = args.arg_required_ptr(2)?;

    let size = args.arg_u32(1);
    let (commit, reserve) = if flags.contains(ThreadCreationFlags::STACK_SIZE_PARAM_IS_A_RESERVATION) {
        (0, size)
    } else {
        (size, size)
    };

    let thread = kernel.create_thread(ctx.process, start, args.arg_u32(3), commit, reserve, flags)?;
    if let Some(id) = args.arg_ptr(5) {
        kernel.memory.write_u32(id, thread.raw())?;
    }
    Ok(ApiOutcome::Return(thread.raw()))
}

pub(super) fn exit_thread(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    kernel.finalize_thread(ctx.thread, args.arg_u32(0))?;
    Ok(ApiOutcome::Exited)
}

pub(super) fn terminate_thread(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let target = kernel.resolve_pseudo(args.arg_handle(0))?;
    if kernel.objects.thread(target)?.is_terminated() {
        return Err(Win32Error::AccessDenied.into());
    }
    kernel.finalize_thread(target, args.arg_u32(1))?;
    if target == ctx.thread {
        return Ok(ApiOutcome::Exited);
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Identity and state
/// ============================================================================

pub(super) fn get_current_thread(_kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(Handle::CURRENT_THREAD.raw()))
}

pub(super) fn get_current_thread_id(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(kernel.current_context()?.thread.raw()))
}

pub(super) fn get_exit_code_thread(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let target = kernel.resolve_pseudo(args.arg_handle(0))?;
    let out = args.arg_required_ptr(1)?;
    let code = kernel.objects.thread(target)?.exit_code;
    kernel.memory.write_u32(out, code)?;
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn suspend_thread(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let target = kernel.resolve_pseudo(args.arg_handle(0))?;
    Ok(ApiOutcome::Return(kernel.suspend_thread(target)?))
}

pub(super) fn resume_thread(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let target = kernel.resolve_pseudo(args.arg_handle(0))?;
    Ok(ApiOutcome::Return(kernel.resume_thread(target)?))
}

pub(super) fn sleep(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(kernel.sleep(args.arg_u32(0))?.into())
}

/// `SwitchToThread`: TRUE if another thread was ready to run
pub(super) fn switch_to_thread(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.current_context()?;
    if kernel.scheduler.ready_count() == 0 {
        return Ok(ApiOutcome::Return(FALSE));
    }
    kernel.scheduler.yield_current(&mut kernel.objects);
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Thread local storage
/// ============================================================================

pub(super) fn tls_alloc(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let slot = kernel.objects.process_mut(ctx.process)?.tls.alloc().ok_or(Win32Error::NotEnoughMemory)?;
    trace!("process {} allocated TLS slot {}", ctx.process, slot);
    Ok(ApiOutcome::Return(slot))
}

/// `TlsFree`: the slot reads as zero in every thread of the process afterwards
pub(super) fn tls_free(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let slot = args.arg_u32(0);
    let process = kernel.objects.process_mut(ctx.process)?;
    if !process.tls.free(slot) {
        return Err(Win32Error::InvalidParameter.into());
    }
    for thread in process.threads.clone() {
        kernel.objects.thread_mut(thread)?.tls.remove(&slot);
    }
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn tls_get_value(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let slot = tls_slot(kernel, args.arg_u32(0))?;
    let value = kernel.objects.thread(ctx.thread)?.tls_value(slot);
    kernel.set_last_error(Win32Error::Success);
    Ok(ApiOutcome::Return(value))
}

pub(super) fn tls_set_value(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let slot = tls_slot(kernel, args.arg_u32(0))?;
    kernel.objects.thread_mut(ctx.thread)?.set_tls_value(slot, args.arg_u32(1));
    Ok(ApiOutcome::Return(TRUE))
}

/// Check a slot index against the process's allocation bitmap
fn tls_slot(kernel: &Kernel, slot: u32) -> KernelResult<u32> {
    let ctx = kernel.current_context()?;
    let tls = &kernel.objects.process(ctx.process)?.tls;
    if slot == TLS_OUT_OF_INDEXES || !tls.is_allocated(slot) {
        return Err(Win32Error::InvalidParameter.into());
    }
    Ok(slot)
}

/// ============================================================================
/// Last error
/// ============================================================================

pub(super) fn get_last_error(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(kernel.last_error()))
}

pub(super) fn set_last_error(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.set_last_error_code(args.arg_u32(0));
    Ok(ApiOutcome::Return(0))
}
