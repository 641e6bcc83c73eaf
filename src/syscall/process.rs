// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process calls
//!
//! Process creation and exit, the command line, startup information,
//! modules, environment variables and the current directory. Calls that
//! return strings follow the size-probing protocol of
//! [`write_probed_string`].

use log::{debug, warn};

use super::args::{read_string, write_probed_string};
use super::{ApiArgs, ApiOutcome, TRUE};
use crate::error::{Fault, KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::mm::GuestAddr;
use crate::object::Handle;
use crate::process::lifecycle::{ProcessCreationFlags, ProcessParams};
use crate::process::{Environment, Module};
use crate::traits::GuestMemory;

/// `sizeof(STARTUPINFOA)`
pub(crate) const STARTUPINFO_SIZE: u32 = 68;

const STARTF_USECOUNTCHARS: u32 = 0x0000_0008;
const STARTF_USESTDHANDLES: u32 = 0x0000_0100;

/// Console size reported in `STARTUPINFOA`
const CONSOLE_COLUMNS: u32 = 80;
const CONSOLE_ROWS: u32 = 25;

/// Upper bound on an environment block read from the guest
const MAX_ENVIRONMENT_BLOCK: usize = 0x0001_0000;

/// ============================================================================
/// Identity and exit
/// ============================================================================

pub(super) fn get_current_process(_kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(Handle::CURRENT_PROCESS.raw()))
}

pub(super) fn get_current_process_id(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(kernel.current_context()?.process.raw()))
}

pub(super) fn exit_process(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    kernel.exit_process(ctx.process, args.arg_u32(0))?;
    Ok(ApiOutcome::Exited)
}

pub(super) fn terminate_process(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let target = kernel.resolve_pseudo(args.arg_handle(0))?;
    kernel.objects.process(target)?;
    kernel.exit_process(target, args.arg_u32(1))?;
    if target == ctx.process {
        return Ok(ApiOutcome::Exited);
    }
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn get_exit_code_process(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let target = kernel.resolve_pseudo(args.arg_handle(0))?;
    let out = args.arg_required_ptr(1)?;
    let code = kernel.objects.process(target)?.exit_code;
    kernel.memory.write_u32(out, code)?;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Creation
/// ============================================================================

/// First token of a command line, honouring double quotes
fn image_name(command_line: &str) -> &str {
    let trimmed = command_line.trim_start();
    match trimmed.strip_prefix('"') {
        Some(rest) => rest.split('"').next().unwrap_or(rest),
        None => trimmed.split_whitespace().next().unwrap_or(trimmed),
    }
}

/// Read a `NAME=value\0...\0\0` block from guest memory
fn read_environment_block(memory: &dyn GuestMemory, addr: GuestAddr) -> KernelResult<Environment> {
    let mut block = Vec::new();
    let mut at = addr;
    loop {
        let byte = memory.read_u8(at)?;
        block.push(byte);
        let len = block.len();
        if byte == 0 && (len == 1 || block[len - 2] == 0) {
            break;
        }
        if len >= MAX_ENVIRONMENT_BLOCK {
            return Err(Win32Error::InvalidParameter.into());
        }
        at = at.checked_add(1).ok_or(Win32Error::InvalidParameter)?;
    }
    Ok(Environment::from_block(&block))
}

/// `CreateProcessA(lpApp, lpCmdLine, lpProcAttr, lpThreadAttr, inherit, flags,
/// lpEnvironment, lpCwd, lpStartupInfo, lpProcessInformation)`
///
/// The child inherits the caller's environment and directory unless given
/// its own. `PROCESS_INFORMATION` receives handles whose values double as ids.
pub(super) fn create_process(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let app = read_string(kernel.memory.as_ref(), args.arg_ptr(0))?;
    let command_line = read_string(kernel.memory.as_ref(), args.arg_ptr(1))?;
    args.arg_required_ptr(8)?;
    let info_ptr = args.arg_required_ptr(9)?;

    let flags = ProcessCreationFlags::from_bits(args.arg_u32(5)).ok_or(Win32Error::InvalidParameter)?;
    if flags.contains(ProcessCreationFlags::DETACHED_PROCESS | ProcessCreationFlags::CREATE_NEW_CONSOLE) {
        return Err(Win32Error::InvalidParameter.into());
    }
    if flags.contains(ProcessCreationFlags::CREATE_UNICODE_ENVIRONMENT) {
        return Err(Fault::Unsupported {
            api: "CreateProcessA",
            detail: String::from("a Unicode environment block"),
        }
        .into());
    }

    let (name, command_line) = match (app, command_line) {
        (Some(app), Some(cmd)) => (app, cmd),
        (Some(app), None) => (app.clone(), app),
        (None, Some(cmd)) => (image_name(&cmd).to_string(), cmd),
        (None, None) => return Err(Win32Error::InvalidParameter.into()),
    };
    if name.is_empty() {
        return Err(Win32Error::InvalidParameter.into());
    }

    let parent = kernel.objects.process(ctx.process)?;
    let (inherited_env, inherited_cwd) = (parent.environment.clone(), parent.cwd.clone());
    let environment = match args.arg_ptr(6) {
        Some(block) => read_environment_block(kernel.memory.as_ref(), block)?,
        None => inherited_env,
    };
    let cwd = read_string(kernel.memory.as_ref(), args.arg_ptr(7))?.unwrap_or(inherited_cwd);
    let search_paths = kernel.config.search_paths.clone();

    let info = kernel.spawn_process(ProcessParams {
        name: &name,
        command_line: &command_line,
        search_paths: &search_paths,
        cwd: &cwd,
        environment,
        suspended: flags.contains(ProcessCreationFlags::CREATE_SUSPENDED),
    })?;

    let fields = [info.process.raw(), info.thread.raw(), info.process.raw(), info.thread.raw()];
    for (i, value) in fields.into_iter().enumerate() {
        kernel.memory.write_u32(info_ptr + 4 * i as u32, value)?;
    }
    debug!("process {} created {} ({:?})", ctx.process, info.process, command_line);
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Command line and startup information
/// ============================================================================

pub(super) fn get_command_line(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    Ok(ApiOutcome::Return(kernel.objects.process(ctx.process)?.command_line_ptr))
}

/// `GetStartupInfoA(lpStartupInfo)`: an 80x25 console on the std handles
pub(super) fn get_startup_info(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let info = args.arg_required_ptr(0)?;
    let mem = kernel.memory.as_mut();
    mem.fill(info, 0, STARTUPINFO_SIZE)?;
    mem.write_u32(info, STARTUPINFO_SIZE)?;
    mem.write_u32(info + 32, CONSOLE_COLUMNS)?;
    mem.write_u32(info + 36, CONSOLE_ROWS)?;
    mem.write_u32(info + 44, STARTF_USECOUNTCHARS | STARTF_USESTDHANDLES)?;
    mem.write_u32(info + 56, Handle::STD_INPUT.raw())?;
    mem.write_u32(info + 60, Handle::STD_OUTPUT.raw())?;
    mem.write_u32(info + 64, Handle::STD_ERROR.raw())?;
    Ok(ApiOutcome::Return(0))
}

/// ============================================================================
/// Modules
/// ============================================================================

pub(super) fn get_module_handle(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let name = read_string(kernel.memory.as_ref(), args.arg_ptr(0))?;
    let process = kernel.objects.process(ctx.process)?;
    let module = match name {
        Some(name) => process.find_module(&name),
        None => process.image(),
    };
    module.map(|m| ApiOutcome::Return(m.base)).ok_or_else(|| Win32Error::ModNotFound.into())
}

/// `GetModuleFileNameA(hModule, lpFilename, nSize)`
///
/// A path that does not fit is truncated and terminated, and the call
/// returns `nSize` with `ERROR_INSUFFICIENT_BUFFER`.
pub(super) fn get_module_file_name(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let base = args.arg_u32(0);
    let process = kernel.objects.process(ctx.process)?;
    let module: Option<&Module> = if base == 0 { process.image() } else { process.module_at(base) };
    let path = module.ok_or(Win32Error::ModNotFound)?.path.clone();

    let buffer = args.arg_required_ptr(1)?;
    let size = args.arg_u32(2);
    let mut bytes = super::args::ansi_bytes(&path, false);
    if (bytes.len() as u32) < size {
        let len = bytes.len() as u32;
        bytes.push(0);
        kernel.memory.write_bytes(buffer, &bytes)?;
        return Ok(ApiOutcome::Return(len));
    }

    if size > 0 {
        bytes.truncate(size as usize - 1);
        bytes.push(0);
        kernel.memory.write_bytes(buffer, &bytes)?;
    }
    kernel.set_last_error(Win32Error::InsufficientBuffer);
    Ok(ApiOutcome::Return(size))
}

/// ============================================================================
/// Environment
/// ============================================================================

/// `GetEnvironmentVariableA(lpName, lpBuffer, nSize)`
pub(super) fn get_environment_variable(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let name = read_string(kernel.memory.as_ref(), args.arg_ptr(0))?.ok_or(Win32Error::InvalidParameter)?;
    let value = kernel
        .objects
        .process(ctx.process)?
        .environment
        .get(&name)
        .map(str::to_string)
        .ok_or(Win32Error::EnvvarNotFound)?;
    let written = write_probed_string(kernel.memory.as_mut(), args.arg_ptr(1), args.arg_u32(2), &value)?;
    Ok(ApiOutcome::Return(written))
}

/// `SetEnvironmentVariableA(lpName, lpValue)`; a NULL value deletes
pub(super) fn set_environment_variable(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let name = read_string(kernel.memory.as_ref(), args.arg_ptr(0))?.ok_or(Win32Error::InvalidParameter)?;
    if name.is_empty() || name.chars().skip(1).any(|c| c == '=') {
        return Err(Win32Error::InvalidParameter.into());
    }
    let value = read_string(kernel.memory.as_ref(), args.arg_ptr(1))?;

    let environment = &mut kernel.objects.process_mut(ctx.process)?.environment;
    if value.is_none() && environment.get(&name).is_none() {
        return Err(Win32Error::EnvvarNotFound.into());
    }
    environment.set(&name, value.as_deref());
    Ok(ApiOutcome::Return(TRUE))
}

/// `GetEnvironmentStrings(A)`: a fresh copy of the block on the process heap
pub(super) fn get_environment_strings(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let process = kernel.objects.process(ctx.process)?;
    let (heap, block) = (process.default_heap, process.environment.to_block());
    Ok(ApiOutcome::Return(kernel.copy_bytes_to_heap(heap, &block)?))
}

pub(super) fn free_environment_strings(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let block = args.arg_required_ptr(0)?;
    let heap = kernel.objects.process(ctx.process)?.default_heap;
    kernel.objects.heap_mut(heap)?.free(block)?;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Current directory
/// ============================================================================

/// `GetCurrentDirectoryA(nBufferLength, lpBuffer)`
pub(super) fn get_current_directory(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let cwd = kernel.objects.process(ctx.process)?.cwd.clone();
    let written = write_probed_string(kernel.memory.as_mut(), args.arg_ptr(1), args.arg_u32(0), &cwd)?;
    Ok(ApiOutcome::Return(written))
}

pub(super) fn set_current_directory(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let path = read_string(kernel.memory.as_ref(), args.arg_ptr(0))?.ok_or(Win32Error::InvalidParameter)?;
    if path.is_empty() {
        return Err(Win32Error::PathNotFound.into());
    }
    kernel.objects.process_mut(ctx.process)?.cwd = path;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Exception filter
/// ============================================================================

pub(super) fn set_unhandled_exception_filter(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let ctx = kernel.current_context()?;
    let process = kernel.objects.process_mut(ctx.process)?;
    let previous = std::mem::replace(&mut process.unhandled_exception_filter, args.arg_u32(0));
    if previous != 0 {
        warn!("unhandled exception filter {:#010x} replaced", previous);
    }
    Ok(ApiOutcome::Return(previous))
}
