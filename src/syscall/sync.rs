// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization calls
//!
//! Thin adapters over [`crate::sync`]: they decode arguments, apply the
//! named-object rules and signal waiters after every state change that can
//! satisfy a wait.

use super::args::read_string;
use super::{ApiArgs, ApiOutcome, FALSE, TRUE};
use crate::error::{KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::object::{Disposition, KernelObject};
use crate::sync::{WaitKind, WaitObject};

/// ============================================================================
/// Critical sections
/// ============================================================================

pub(super) fn initialize_critical_section(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.initialize_critical_section(args.arg_required_ptr(0)?, 0)?;
    Ok(ApiOutcome::Return(0))
}

pub(super) fn initialize_critical_section_and_spin_count(
    kernel: &mut Kernel,
    args: &ApiArgs,
) -> KernelResult<ApiOutcome> {
    kernel.initialize_critical_section(args.arg_required_ptr(0)?, args.arg_u32(1))?;
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn enter_critical_section(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(kernel.enter_critical_section(args.arg_required_ptr(0)?)?.into())
}

pub(super) fn try_enter_critical_section(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let entered = kernel.try_enter_critical_section(args.arg_required_ptr(0)?)?;
    Ok(ApiOutcome::Return(if entered { TRUE } else { FALSE }))
}

pub(super) fn leave_critical_section(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.leave_critical_section(args.arg_required_ptr(0)?)?;
    Ok(ApiOutcome::Return(0))
}

pub(super) fn delete_critical_section(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.delete_critical_section(args.arg_required_ptr(0)?)?;
    Ok(ApiOutcome::Return(0))
}

pub(super) fn set_critical_section_spin_count(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let previous = kernel.set_critical_section_spin_count(args.arg_required_ptr(0)?, args.arg_u32(1))?;
    Ok(ApiOutcome::Return(previous))
}

/// ============================================================================
/// Named wait objects
/// ============================================================================

/// Create a wait object, reopening a same-named one if it exists
///
/// The last error reports whether the name already existed.
fn create_named(kernel: &mut Kernel, object: WaitObject, name: Option<u32>) -> KernelResult<ApiOutcome> {
    let name = read_string(kernel.memory.as_ref(), name)?;
    if let Some(existing) = name.as_deref().and_then(|n| kernel.objects.lookup_by_name(n)) {
        let same_kind = match kernel.objects.wait_object(existing) {
            Ok(w) => std::mem::discriminant(&w.kind) == std::mem::discriminant(&object.kind),
            Err(_) => false,
        };
        if !same_kind {
            return Err(Win32Error::InvalidHandle.into());
        }
    }

    let (handle, disposition) = kernel.objects.create(KernelObject::WaitObject(object), name.as_deref())?;
    kernel.set_last_error(match disposition {
        Disposition::Created => Win32Error::Success,
        Disposition::AlreadyExists => Win32Error::AlreadyExists,
    });
    Ok(ApiOutcome::Return(handle.raw()))
}

/// Open a named wait object whose kind satisfies `accepts`
fn open_named(kernel: &mut Kernel, name: Option<u32>, accepts: fn(&WaitKind) -> bool) -> KernelResult<ApiOutcome> {
    let name = read_string(kernel.memory.as_ref(), name)?.ok_or(Win32Error::InvalidParameter)?;
    let handle = kernel.objects.lookup_by_name(&name).ok_or(Win32Error::FileNotFound)?;
    if !accepts(&kernel.objects.wait_object(handle)?.kind) {
        return Err(Win32Error::InvalidHandle.into());
    }
    kernel.objects.add_ref(handle)?;
    Ok(ApiOutcome::Return(handle.raw()))
}

/// ============================================================================
/// Events
/// ============================================================================

/// `CreateEventA(lpAttributes, bManualReset, bInitialState, lpName)`
pub(super) fn create_event(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let event = WaitObject::event(args.arg_bool(1), args.arg_bool(2));
    create_named(kernel, event, args.arg_ptr(3))
}

pub(super) fn open_event(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    open_named(kernel, args.arg_ptr(2), |kind| matches!(kind, WaitKind::Event { .. }))
}

pub(super) fn set_event(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = args.arg_handle(0);
    kernel.objects.wait_object_mut(handle)?.set_event()?;
    kernel.signal_waiters(handle)?;
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn reset_event(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.objects.wait_object_mut(args.arg_handle(0))?.reset_event()?;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Mutexes
/// ============================================================================

/// `CreateMutexA(lpAttributes, bInitialOwner, lpName)`
pub(super) fn create_mutex(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let owner = args.arg_bool(1).then_some(ctx.thread);
    create_named(kernel, WaitObject::mutex(owner), args.arg_ptr(2))
}

pub(super) fn open_mutex(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    open_named(kernel, args.arg_ptr(2), |kind| matches!(kind, WaitKind::Mutex { .. }))
}

pub(super) fn release_mutex(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let handle = args.arg_handle(0);
    kernel.objects.wait_object_mut(handle)?.release_mutex(ctx.thread)?;
    kernel.signal_waiters(handle)?;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Semaphores
/// ============================================================================

/// `CreateSemaphoreA(lpAttributes, lInitialCount, lMaximumCount, lpName)`
pub(super) fn create_semaphore(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let (initial, maximum) = (args.arg_i32(1), args.arg_i32(2));
    if initial < 0 || maximum <= 0 {
        return Err(Win32Error::InvalidParameter.into());
    }
    let semaphore = WaitObject::semaphore(initial as u32, maximum as u32)?;
    create_named(kernel, semaphore, args.arg_ptr(3))
}

/// `ReleaseSemaphore(hSemaphore, lReleaseCount, lpPreviousCount)`
pub(super) fn release_semaphore(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = args.arg_handle(0);
    let release = args.arg_i32(1);
    if release <= 0 {
        return Err(Win32Error::InvalidParameter.into());
    }
    let previous = kernel.objects.wait_object_mut(handle)?.release_semaphore(release as u32)?;
    if let Some(out) = args.arg_ptr(2) {
        kernel.memory.write_u32(out, previous)?;
    }
    kernel.signal_waiters(handle)?;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Waits
/// ============================================================================

pub(super) fn wait_for_single_object(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(kernel.wait_for_single_object(args.arg_handle(0), args.arg_u32(1))?.into())
}

/// ============================================================================
/// Interlocked operations
/// ============================================================================

// One guest thread runs at a time; a plain read-modify-write is atomic to it

pub(super) fn interlocked_increment(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let addr = args.arg_u32(0);
    let value = kernel.memory.read_u32(addr)?.wrapping_add(1);
    kernel.memory.write_u32(addr, value)?;
    Ok(ApiOutcome::Return(value))
}

pub(super) fn interlocked_decrement(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let addr = args.arg_u32(0);
    let value = kernel.memory.read_u32(addr)?.wrapping_sub(1);
    kernel.memory.write_u32(addr, value)?;
    Ok(ApiOutcome::Return(value))
}

pub(super) fn interlocked_exchange(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let addr = args.arg_u32(0);
    let previous = kernel.memory.read_u32(addr)?;
    kernel.memory.write_u32(addr, args.arg_u32(1))?;
    Ok(ApiOutcome::Return(previous))
}

/// `InterlockedCompareExchange(Destination, Exchange, Comperand)`
pub(super) fn interlocked_compare_exchange(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let addr = args.arg_u32(0);
    let previous = kernel.memory.read_u32(addr)?;
    if previous == args.arg_u32(2) {
        kernel.memory.write_u32(addr, args.arg_u32(1))?;
    }
    Ok(ApiOutcome::Return(previous))
}
