// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! kernel32 ABI dispatcher
//!
//! Every modeled kernel32 export is an [`ApiEntry`] in [`API_TABLE`]. The
//! import resolver binds imports to thunks carrying the entry index; when
//! the guest calls a thunk, [`dispatch`] runs the handler and completes the
//! call on the guest's behalf.
//!
//! # Calling Convention
//!
//! | Convention | Stack cleanup            | Result |
//! |------------|--------------------------|--------|
//! | stdcall    | callee pops return + args | `eax`  |
//! | cdecl      | callee pops return only   | `eax`  |
//!
//! # Error Return Convention
//!
//! ```text
//! Success:      eax = handler result
//! Win32 error:  last error = code, eax = entry failure value
//! Fault:        nothing written; the session ends
//! ```

pub mod args;
mod handle;
mod heap;
mod process;
mod sync;
mod system;
mod thread;

use std::collections::HashMap;

use log::{debug, error};
use spin::Lazy;

pub use args::ApiArgs;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::object::Handle;
use crate::sched::ThreadState;
use crate::sync::{WaitOutcome, WAIT_FAILED};

/// Win32 `FALSE`
pub const FALSE: u32 = 0;

/// Win32 `TRUE`
pub const TRUE: u32 = 1;

/// ============================================================================
/// API Table Types
/// ============================================================================

/// Who removes the arguments from the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Callee pops its arguments (`WINAPI`)
    Stdcall,
    /// Caller pops its arguments
    Cdecl,
}

/// How a handler finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOutcome {
    /// Return this value in `eax`
    Return(u32),
    /// The caller blocked; whoever wakes it supplies `eax`
    Blocked,
    /// The caller no longer exists; leave the registers alone
    Exited,
}

impl From<WaitOutcome> for ApiOutcome {
    fn from(outcome: WaitOutcome) -> Self {
        match outcome {
            WaitOutcome::Complete(status) => Self::Return(status),
            WaitOutcome::Blocked => Self::Blocked,
        }
    }
}

/// Handler signature
pub type ApiHandler = fn(&mut Kernel, &ApiArgs) -> KernelResult<ApiOutcome>;

/// A modeled export
#[derive(Debug)]
pub struct ApiEntry {
    /// Export name
    pub name: &'static str,
    /// Number of dword arguments
    pub arity: usize,
    /// Stack cleanup convention
    pub convention: Convention,
    /// `eax` when the handler reports a Win32 error
    pub failure: u32,
    pub handler: ApiHandler,
}

impl ApiEntry {
    /// Bytes removed from the stack when the call returns
    pub fn stack_cleanup(&self) -> u32 {
        match self.convention {
            Convention::Stdcall => 4 + 4 * self.arity as u32,
            Convention::Cdecl => 4,
        }
    }
}

macro_rules! api {
    ($name:ident, $arity:expr, $failure:expr, $handler:path) => {
        ApiEntry {
            name: stringify!($name),
            arity: $arity,
            convention: Convention::Stdcall,
            failure: $failure,
            handler: $handler,
        }
    };
}

const NULL: u32 = 0;
const INVALID: u32 = Handle::INVALID.raw();

/// ============================================================================
/// API Table
/// ============================================================================

/// Every modeled kernel32 export
pub static API_TABLE: &[ApiEntry] = &[
    // Handles, console files and sections
    api!(CloseHandle, 1, FALSE, handle::close_handle),
    api!(DuplicateHandle, 7, FALSE, handle::duplicate_handle),
    api!(GetStdHandle, 1, INVALID, handle::get_std_handle),
    api!(GetFileType, 1, NULL, handle::get_file_type),
    api!(WriteFile, 5, FALSE, handle::write_file),
    api!(ReadFile, 5, FALSE, handle::read_file),
    api!(WriteConsoleA, 5, FALSE, handle::write_console),
    api!(CreateFileMappingA, 6, NULL, handle::create_file_mapping),
    api!(OpenFileMappingA, 3, NULL, handle::open_file_mapping),
    api!(MapViewOfFile, 5, NULL, handle::map_view_of_file),
    api!(UnmapViewOfFile, 1, FALSE, handle::unmap_view_of_file),
    // Processes
    api!(GetCurrentProcess, 0, NULL, process::get_current_process),
    api!(GetCurrentProcessId, 0, NULL, process::get_current_process_id),
    api!(ExitProcess, 1, NULL, process::exit_process),
    api!(TerminateProcess, 2, FALSE, process::terminate_process),
    api!(GetExitCodeProcess, 2, FALSE, process::get_exit_code_process),
    api!(CreateProcessA, 10, FALSE, process::create_process),
    api!(GetCommandLineA, 0, NULL, process::get_command_line),
    api!(GetStartupInfoA, 1, NULL, process::get_startup_info),
    api!(GetModuleHandleA, 1, NULL, process::get_module_handle),
    api!(GetModuleFileNameA, 3, NULL, process::get_module_file_name),
    api!(GetEnvironmentVariableA, 3, NULL, process::get_environment_variable),
    api!(SetEnvironmentVariableA, 2, FALSE, process::set_environment_variable),
    api!(GetEnvironmentStrings, 0, NULL, process::get_environment_strings),
    api!(GetEnvironmentStringsA, 0, NULL, process::get_environment_strings),
    api!(FreeEnvironmentStringsA, 1, FALSE, process::free_environment_strings),
    api!(GetCurrentDirectoryA, 2, NULL, process::get_current_directory),
    api!(SetCurrentDirectoryA, 1, FALSE, process::set_current_directory),
    api!(SetUnhandledExceptionFilter, 1, NULL, process::set_unhandled_exception_filter),
    // Threads, TLS and last error
    api!(CreateThread, 6, NULL, thread::create_thread),
    api!(ExitThread, 1, NULL, thread::exit_thread),
    api!(TerminateThread, 2, FALSE, thread::terminate_thread),
    api!(GetCurrentThread, 0, NULL, thread::get_current_thread),
    api!(GetCurrentThreadId, 0, NULL, thread::get_current_thread_id),
    api!(GetExitCodeThread, 2, FALSE, thread::get_exit_code_thread),
    api!(SuspendThread, 1, u32::MAX, thread::suspend_thread),
    api!(ResumeThread, 1, u32::MAX, thread::resume_thread),
    api!(Sleep, 1, NULL, thread::sleep),
    api!(SwitchToThread, 0, FALSE, thread::switch_to_thread),
    api!(TlsAlloc, 0, crate::process::tls::TLS_OUT_OF_INDEXES, thread::tls_alloc),
    api!(TlsFree, 1, FALSE, thread::tls_free),
    api!(TlsGetValue, 1, NULL, thread::tls_get_value),
    api!(TlsSetValue, 2, FALSE, thread::tls_set_value),
    api!(GetLastError, 0, NULL, thread::get_last_error),
    api!(SetLastError, 1, NULL, thread::set_last_error),
    // Synchronization
    api!(InitializeCriticalSection, 1, NULL, sync::initialize_critical_section),
    api!(InitializeCriticalSectionAndSpinCount, 2, FALSE, sync::initialize_critical_section_and_spin_count),
    api!(EnterCriticalSection, 1, NULL, sync::enter_critical_section),
    api!(TryEnterCriticalSection, 1, FALSE, sync::try_enter_critical_section),
    api!(LeaveCriticalSection, 1, NULL, sync::leave_critical_section),
    api!(DeleteCriticalSection, 1, NULL, sync::delete_critical_section),
    api!(SetCriticalSectionSpinCount, 2, NULL, sync::set_critical_section_spin_count),
    api!(CreateEventA, 4, NULL, sync::create_event),
    api!(OpenEventA, 3, NULL, sync::open_event),
    api!(SetEvent, 1, FALSE, sync::set_event),
    api!(ResetEvent, 1, FALSE, sync::reset_event),
    api!(CreateMutexA, 3, NULL, sync::create_mutex),
    api!(OpenMutexA, 3, NULL, sync::open_mutex),
    api!(ReleaseMutex, 1, FALSE, sync::release_mutex),
    api!(CreateSemaphoreA, 4, NULL, sync::create_semaphore),
    api!(ReleaseSemaphore, 3, FALSE, sync::release_semaphore),
    api!(WaitForSingleObject, 2, WAIT_FAILED, sync::wait_for_single_object),
    api!(InterlockedIncrement, 1, NULL, sync::interlocked_increment),
    api!(InterlockedDecrement, 1, NULL, sync::interlocked_decrement),
    api!(InterlockedExchange, 2, NULL, sync::interlocked_exchange),
    api!(InterlockedCompareExchange, 3, NULL, sync::interlocked_compare_exchange),
    // Heaps
    api!(HeapCreate, 3, NULL, heap::heap_create),
    api!(HeapDestroy, 1, FALSE, heap::heap_destroy),
    api!(HeapAlloc, 3, NULL, heap::heap_alloc),
    api!(HeapFree, 3, FALSE, heap::heap_free),
    api!(HeapReAlloc, 4, NULL, heap::heap_realloc),
    api!(HeapSize, 3, u32::MAX, heap::heap_size),
    api!(HeapValidate, 3, FALSE, heap::heap_validate),
    api!(GetProcessHeap, 0, NULL, heap::get_process_heap),
    api!(VirtualAlloc, 4, NULL, heap::virtual_alloc),
    api!(VirtualFree, 3, FALSE, heap::virtual_free),
    // System information
    api!(GetVersion, 0, NULL, system::get_version),
    api!(GetVersionExA, 1, FALSE, system::get_version_ex),
    api!(GetTickCount, 0, NULL, system::get_tick_count),
    api!(GetSystemTimeAsFileTime, 1, NULL, system::get_system_time_as_file_time),
    api!(QueryPerformanceCounter, 1, FALSE, system::query_performance_counter),
    api!(QueryPerformanceFrequency, 1, FALSE, system::query_performance_frequency),
    api!(GetSystemInfo, 1, NULL, system::get_system_info),
    api!(EncodePointer, 1, NULL, system::encode_pointer),
    api!(DecodePointer, 1, NULL, system::decode_pointer),
    api!(IsDebuggerPresent, 0, FALSE, system::is_debugger_present),
    api!(SetHandleCount, 1, NULL, system::set_handle_count),
    api!(lstrlenA, 1, NULL, system::lstrlen),
    api!(OutputDebugStringA, 1, NULL, system::output_debug_string),
];

/// Export name -> table index
static API_INDEX: Lazy<HashMap<&'static str, usize>> =
    Lazy::new(|| API_TABLE.iter().enumerate().map(|(index, entry)| (entry.name, index)).collect());

/// Find the table index of an export
pub fn lookup(name: &str) -> Option<usize> {
    API_INDEX.get(name).copied()
}

/// Find the table entry of an export
pub fn entry(name: &str) -> Option<&'static ApiEntry> {
    lookup(name).and_then(|index| API_TABLE.get(index))
}

/// ============================================================================
/// Dispatcher
/// ============================================================================

/// Run the API at `index` for the current thread and complete the call
///
/// Switches threads afterwards if the caller no longer runs.
pub fn dispatch(kernel: &mut Kernel, index: usize) -> KernelResult<()> {
    let entry = API_TABLE.get(index).ok_or(crate::error::Fault::UnknownCallback(kernel.cpu.eip))?;
    let ctx = kernel.current_context()?;
    let args = ApiArgs::from_stack(kernel.memory.as_ref(), kernel.cpu.esp, entry.arity)?;
    debug!("[{}] {}({})", ctx.thread, entry.name, args);
    kernel.record_api_call(index);

    match (entry.handler)(kernel, &args) {
        Ok(ApiOutcome::Return(value)) => {
            kernel.cpu.eax = value;
            complete(kernel, entry, &args);
        }
        Ok(ApiOutcome::Blocked) => complete(kernel, entry, &args),
        Ok(ApiOutcome::Exited) => {}
        Err(KernelError::Win32(err)) => {
            debug!("{} failed: {}", entry.name, err.name());
            kernel.set_last_error(err);
            kernel.cpu.eax = entry.failure;
            complete(kernel, entry, &args);
        }
        Err(KernelError::Fault(fault)) => {
            error!("{} raised a fault: {}", entry.name, fault);
            return Err(fault.into());
        }
    }

    let still_running = kernel
        .scheduler
        .current()
        .and_then(|current| kernel.objects.thread(current).ok())
        .is_some_and(|thread| thread.state == ThreadState::Running);
    if !still_running {
        kernel.reschedule()?;
    }
    Ok(())
}

/// Pop the frame and return to the caller
fn complete(kernel: &mut Kernel, entry: &ApiEntry, args: &ApiArgs) {
    kernel.cpu.esp = kernel.cpu.esp.wrapping_add(entry.stack_cleanup());
    kernel.cpu.eip = args.return_address();
}
