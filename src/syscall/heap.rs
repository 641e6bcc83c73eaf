// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Heap and virtual memory calls

use log::debug;

use super::{ApiArgs, ApiOutcome, FALSE, TRUE};
use crate::error::{Fault, KernelError, KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::mm::heap::{Heap, HeapFlags};
use crate::object::{Handle, KernelObject};

/// Effective flags of a call: its own plus the heap's creation flags
fn call_flags(kernel: &Kernel, heap: Handle, raw: u32) -> KernelResult<HeapFlags> {
    let own = HeapFlags::from_bits_truncate(raw);
    Ok(own | (kernel.objects.heap(heap)?.flags() & HeapFlags::GENERATE_EXCEPTIONS))
}

/// Turn a failure into a fault when the caller asked for exceptions
fn check<T>(api: &'static str, flags: HeapFlags, result: KernelResult<T>) -> KernelResult<T> {
    match result {
        Err(KernelError::Win32(err)) if flags.contains(HeapFlags::GENERATE_EXCEPTIONS) => Err(Fault::Unsupported {
            api,
            detail: format!("raising an exception for {}", err.name()),
        }
        .into()),
        other => other,
    }
}

/// `HeapCreate(flOptions, dwInitialSize, dwMaximumSize)`
pub(super) fn heap_create(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let mut flags = HeapFlags::from_bits_truncate(args.arg_u32(0));
    let maximum = args.arg_u32(2);
    if maximum == 0 {
        flags |= HeapFlags::GROWABLE;
    }
    let growth = kernel.config.heap_growth_increment;
    let heap = Heap::create(kernel.memory.as_mut(), ctx.process, flags, args.arg_u32(1), maximum, growth)?;
    let (handle, _) = kernel.objects.create(KernelObject::Heap(heap), None)?;
    debug!("process {} created heap {}", ctx.process, handle);
    Ok(ApiOutcome::Return(handle.raw()))
}

/// `HeapDestroy(hHeap)`; the default heap lives as long as its process
pub(super) fn heap_destroy(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let handle = args.arg_handle(0);
    kernel.objects.heap(handle)?;
    if kernel.objects.process(ctx.process)?.default_heap == handle {
        return Err(Win32Error::AccessDenied.into());
    }
    if let Some(KernelObject::Heap(heap)) = kernel.objects.remove(handle) {
        heap.destroy(kernel.memory.as_mut());
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// `HeapAlloc(hHeap, dwFlags, dwBytes)`
pub(super) fn heap_alloc(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = args.arg_handle(0);
    let flags = call_flags(kernel, handle, args.arg_u32(1))?;
    let result = kernel.objects.heap_mut(handle)?.allocate(kernel.memory.as_mut(), args.arg_u32(2), flags);
    Ok(ApiOutcome::Return(check("HeapAlloc", flags, result)?))
}

/// `HeapFree(hHeap, dwFlags, lpMem)`; freeing NULL succeeds
pub(super) fn heap_free(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = args.arg_handle(0);
    let heap = kernel.objects.heap_mut(handle)?;
    if let Some(block) = args.arg_ptr(2) {
        heap.free(block)?;
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// `HeapReAlloc(hHeap, dwFlags, lpMem, dwBytes)`
pub(super) fn heap_realloc(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = args.arg_handle(0);
    let flags = call_flags(kernel, handle, args.arg_u32(1))?;
    let block = args.arg_required_ptr(2)?;
    let result = kernel
        .objects
        .heap_mut(handle)?
        .reallocate(kernel.memory.as_mut(), block, args.arg_u32(3), flags);
    Ok(ApiOutcome::Return(check("HeapReAlloc", flags, result)?))
}

/// `HeapSize(hHeap, dwFlags, lpMem)`
pub(super) fn heap_size(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let block = args.arg_required_ptr(2)?;
    let size = kernel.objects.heap(args.arg_handle(0))?.size_of(block)?;
    Ok(ApiOutcome::Return(size))
}

/// `HeapValidate(hHeap, dwFlags, lpMem)`; NULL checks the whole heap
pub(super) fn heap_validate(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let valid = kernel.objects.heap(args.arg_handle(0))?.validate(args.arg_ptr(2));
    Ok(ApiOutcome::Return(if valid { TRUE } else { FALSE }))
}

pub(super) fn get_process_heap(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    Ok(ApiOutcome::Return(kernel.objects.process(ctx.process)?.default_heap.raw()))
}

/// ============================================================================
/// Virtual memory
/// ============================================================================

/// `VirtualAlloc(lpAddress, dwSize, flAllocationType, flProtect)`
pub(super) fn virtual_alloc(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let base = kernel.virtual_alloc(args.arg_u32(0), args.arg_u32(1), args.arg_u32(2), args.arg_u32(3))?;
    Ok(ApiOutcome::Return(base))
}

/// `VirtualFree(lpAddress, dwSize, dwFreeType)`
pub(super) fn virtual_free(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.virtual_free(args.arg_u32(0), args.arg_u32(1), args.arg_u32(2))?;
    Ok(ApiOutcome::Return(TRUE))
}
