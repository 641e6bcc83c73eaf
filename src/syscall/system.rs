// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Version, time and system information calls
//!
//! # Structure layouts
//!
//! ```text
//! OSVERSIONINFOA (148)      OSVERSIONINFOEXA (156) adds
//!   0  dwOSVersionInfoSize    148  wServicePackMajor
//!   4  dwMajorVersion         150  wServicePackMinor
//!   8  dwMinorVersion         152  wSuiteMask
//!  12  dwBuildNumber          154  wProductType
//!  16  dwPlatformId           155  wReserved
//!  20  szCSDVersion[128]
//! ```

use log::info;

use super::args::{read_string, MAX_STRING};
use super::{ApiArgs, ApiOutcome, FALSE, TRUE};
use crate::error::{KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::mm::{GuestAddr, PAGE_SIZE};

/// `sizeof(OSVERSIONINFOA)`
pub const OSVERSIONINFO_SIZE: u32 = 148;

/// `sizeof(OSVERSIONINFOEXA)`
pub const OSVERSIONINFOEX_SIZE: u32 = 156;

/// `sizeof(SYSTEM_INFO)`
pub const SYSTEM_INFO_SIZE: u32 = 36;

const CSD_VERSION_LEN: usize = 128;

/// Performance counter ticks per second
const PERFORMANCE_FREQUENCY: u64 = 1000;

/// Milliseconds from 1601-01-01 to the Unix epoch
const FILETIME_UNIX_EPOCH_MS: u64 = 11_644_473_600_000;

/// FILETIME ticks (100 ns) per millisecond
const FILETIME_TICKS_PER_MS: u64 = 10_000;

const PROCESSOR_ARCHITECTURE_INTEL: u16 = 0;
const PROCESSOR_INTEL_PENTIUM: u32 = 586;
const MIN_APPLICATION_ADDRESS: u32 = 0x0001_0000;
const MAX_APPLICATION_ADDRESS: u32 = 0x7FFE_FFFF;

/// ============================================================================
/// Version
/// ============================================================================

pub(super) fn get_version(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(kernel.config.version.packed()))
}

/// `GetVersionExA(lpVersionInfo)`
pub(super) fn get_version_ex(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let info = args.arg_required_ptr(0)?;
    let size = kernel.memory.read_u32(info)?;
    if size != OSVERSIONINFO_SIZE && size != OSVERSIONINFOEX_SIZE {
        return Err(Win32Error::InsufficientBuffer.into());
    }

    let version = &kernel.config.version;
    let mut csd = super::args::ansi_bytes(&version.csd_version, false);
    csd.resize(CSD_VERSION_LEN, 0);
    csd[CSD_VERSION_LEN - 1] = 0;

    let mem = kernel.memory.as_mut();
    mem.write_u32(info + 4, version.major)?;
    mem.write_u32(info + 8, version.minor)?;
    mem.write_u32(info + 12, version.build)?;
    mem.write_u32(info + 16, version.platform_id)?;
    mem.write_bytes(info + 20, &csd)?;
    if size == OSVERSIONINFOEX_SIZE {
        mem.write_u16(info + 148, version.service_pack_major)?;
        mem.write_u16(info + 150, version.service_pack_minor)?;
        mem.write_u16(info + 152, version.suite_mask)?;
        mem.write_u8(info + 154, version.product_type)?;
        mem.write_u8(info + 155, 0)?;
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Time
/// ============================================================================

pub(super) fn get_tick_count(kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(kernel.clock.now_ms() as u32))
}

fn write_u64(kernel: &mut Kernel, addr: GuestAddr, value: u64) -> KernelResult<()> {
    kernel.memory.write_bytes(addr, &value.to_le_bytes())?;
    Ok(())
}

/// Wall-clock time as a FILETIME
fn file_time(unix_ms: u64) -> u64 {
    (unix_ms + FILETIME_UNIX_EPOCH_MS) * FILETIME_TICKS_PER_MS
}

/// `GetSystemTimeAsFileTime(lpSystemTimeAsFileTime)`
pub(super) fn get_system_time_as_file_time(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let out = args.arg_required_ptr(0)?;
    let now = file_time(kernel.clock.system_time_ms());
    write_u64(kernel, out, now)?;
    Ok(ApiOutcome::Return(0))
}

pub(super) fn query_performance_counter(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let out = args.arg_required_ptr(0)?;
    let now = kernel.clock.now_ms();
    write_u64(kernel, out, now)?;
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn query_performance_frequency(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    write_u64(kernel, args.arg_required_ptr(0)?, PERFORMANCE_FREQUENCY)?;
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// System information
/// ============================================================================

/// `GetSystemInfo(lpSystemInfo)`: one Pentium-class processor
pub(super) fn get_system_info(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let info = args.arg_required_ptr(0)?;
    let mem = kernel.memory.as_mut();
    mem.fill(info, 0, SYSTEM_INFO_SIZE)?;
    mem.write_u16(info, PROCESSOR_ARCHITECTURE_INTEL)?;
    mem.write_u32(info + 4, PAGE_SIZE)?;
    mem.write_u32(info + 8, MIN_APPLICATION_ADDRESS)?;
    mem.write_u32(info + 12, MAX_APPLICATION_ADDRESS)?;
    mem.write_u32(info + 16, 1)?;
    mem.write_u32(info + 20, 1)?;
    mem.write_u32(info + 24, PROCESSOR_INTEL_PENTIUM)?;
    mem.write_u32(info + 28, PAGE_SIZE)?;
    mem.write_u16(info + 32, 6)?;
    mem.write_u16(info + 34, 0)?;
    Ok(ApiOutcome::Return(0))
}

pub(super) fn encode_pointer(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(args.arg_u32(0) ^ kernel.config.pointer_cookie))
}

pub(super) fn decode_pointer(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(args.arg_u32(0) ^ kernel.config.pointer_cookie))
}

pub(super) fn is_debugger_present(_kernel: &mut Kernel, _args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(FALSE))
}

pub(super) fn set_handle_count(_kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    Ok(ApiOutcome::Return(args.arg_u32(0)))
}

/// ============================================================================
/// Strings and debug output
/// ============================================================================

/// `lstrlenA`; NULL has length zero
pub(super) fn lstrlen(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let Some(text) = args.arg_ptr(0) else {
        return Ok(ApiOutcome::Return(0));
    };
    let mut len = 0u32;
    while (len as usize) < MAX_STRING && kernel.memory.read_u8(text.wrapping_add(len))? != 0 {
        len += 1;
    }
    Ok(ApiOutcome::Return(len))
}

pub(super) fn output_debug_string(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    if let Some(text) = read_string(kernel.memory.as_ref(), args.arg_ptr(0))? {
        info!("debug output: {}", text.trim_end());
    }
    Ok(ApiOutcome::Return(0))
}
