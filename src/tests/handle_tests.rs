// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Handle, Console and System Call Integration Tests

use crate::error::{Fault, KernelError};
use crate::mm::PAGE_SIZE;
use crate::object::Handle;
use crate::syscall::{FALSE, TRUE};
use crate::testing::{Guest, MANUAL_CLOCK_EPOCH_MS};
use crate::Win32Error;

const STD_INPUT_HANDLE: u32 = -10i32 as u32;
const STD_OUTPUT_HANDLE: u32 = -11i32 as u32;
const STD_ERROR_HANDLE: u32 = -12i32 as u32;
const DUPLICATE_CLOSE_SOURCE: u32 = 0x1;
const DUPLICATE_SAME_ACCESS: u32 = 0x2;

/// ============================================================================
/// Handle table
/// ============================================================================

#[test]
fn test_closed_handle_is_invalid_and_never_reused() {
    let mut guest = Guest::boot();
    let first = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    assert_eq!(first % 4, 0);
    assert_eq!(guest.call("CloseHandle", &[first]), TRUE);

    assert_eq!(guest.call("SetEvent", &[first]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::InvalidHandle.code());
    assert_eq!(guest.call("CloseHandle", &[first]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::InvalidHandle.code());

    let second = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    assert!(second > first);
}

#[test]
fn test_duplicate_handle() {
    let mut guest = Guest::boot();
    let process = Handle::CURRENT_PROCESS.raw();
    let event = guest.call("CreateEventA", &[0, TRUE, FALSE, 0]);
    let target = guest.alloc(4);

    let args = [process, event, process, target, 0, 0, DUPLICATE_SAME_ACCESS];
    assert_eq!(guest.call("DuplicateHandle", &args), TRUE);
    assert_eq!(guest.read_u32(target), event);
    assert_eq!(guest.kernel.objects().refs(Handle::from_raw(event)), 2);

    guest.call("CloseHandle", &[event]);
    assert_eq!(guest.call("SetEvent", &[event]), TRUE);

    let args = [process, event, process, target, 0, 0, DUPLICATE_SAME_ACCESS | DUPLICATE_CLOSE_SOURCE];
    assert_eq!(guest.call("DuplicateHandle", &args), TRUE);
    assert_eq!(guest.kernel.objects().refs(Handle::from_raw(event)), 1);

    let args = [process, event, process, target, 0, 0, 0x8];
    assert_eq!(guest.call("DuplicateHandle", &args), FALSE);
    assert_eq!(guest.last_error(), Win32Error::InvalidFlags.code());
}

#[test]
fn test_closing_last_reference_of_named_object_frees_the_name() {
    let mut guest = Guest::boot();
    let name = guest.string("once");
    let first = guest.call("CreateMutexA", &[0, FALSE, name]);
    guest.call("CloseHandle", &[first]);

    let second = guest.call("CreateMutexA", &[0, FALSE, name]);
    assert_ne!(second, first);
    assert_eq!(guest.last_error(), Win32Error::Success.code());
}

/// ============================================================================
/// Console
/// ============================================================================

#[test]
fn test_write_file_to_console() {
    let mut guest = Guest::boot();
    let stdout = guest.call("GetStdHandle", &[STD_OUTPUT_HANDLE]);
    assert_eq!(stdout, Handle::STD_OUTPUT.raw());
    assert_eq!(guest.call("GetFileType", &[stdout]), 2);

    let text = guest.string("hello");
    let written = guest.alloc(4);
    assert_eq!(guest.call("WriteFile", &[stdout, text, 5, written, 0]), TRUE);
    assert_eq!(guest.read_u32(written), 5);

    let stderr = guest.call("GetStdHandle", &[STD_ERROR_HANDLE]);
    let warning = guest.string("oops\n");
    assert_eq!(guest.call("WriteConsoleA", &[stderr, warning, 5, written, 0]), TRUE);

    assert_eq!(guest.console.output(), "hello");
    assert_eq!(guest.console.error(), "oops\n");
}

#[test]
fn test_read_file_from_console() {
    let mut guest = Guest::boot();
    guest.console.push_input(b"abc");
    let stdin = guest.call("GetStdHandle", &[STD_INPUT_HANDLE]);
    let buffer = guest.alloc(16);
    let read = guest.alloc(4);

    assert_eq!(guest.call("ReadFile", &[stdin, buffer, 16, read, 0]), TRUE);
    assert_eq!(guest.read_u32(read), 3);
    assert_eq!(guest.read_bytes(buffer, 3), b"abc".to_vec());

    assert_eq!(guest.call("ReadFile", &[stdin, buffer, 16, read, 0]), TRUE);
    assert_eq!(guest.read_u32(read), 0);

    assert_eq!(guest.call("WriteFile", &[stdin, buffer, 1, read, 0]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::AccessDenied.code());
}

#[test]
fn test_console_transfers_do_not_trust_the_count() {
    let mut guest = Guest::boot();
    guest.console.push_input(b"xyz");
    let stdin = guest.call("GetStdHandle", &[STD_INPUT_HANDLE]);
    let buffer = guest.alloc(16);
    let count = guest.alloc(4);
    assert_eq!(guest.call("ReadFile", &[stdin, buffer, u32::MAX, count, 0]), TRUE);
    assert_eq!(guest.read_u32(count), 3);
    assert_eq!(guest.read_bytes(buffer, 3), b"xyz".to_vec());

    let stdout = guest.call("GetStdHandle", &[STD_OUTPUT_HANDLE]);
    match guest.try_call("WriteFile", &[stdout, 0x7FFE_0000, u32::MAX, count, 0]) {
        Err(KernelError::Fault(Fault::Memory(_))) => {}
        other => panic!("expected a memory fault, got {:?}", other),
    }
    assert_eq!(guest.console.output(), "");
}

#[test]
fn test_bad_std_handle() {
    let mut guest = Guest::boot();
    assert_eq!(guest.call("GetStdHandle", &[-20i32 as u32]), Handle::INVALID.raw());
    assert_eq!(guest.last_error(), Win32Error::InvalidHandle.code());
}

#[test]
fn test_write_to_non_file_handle_faults() {
    let mut guest = Guest::boot();
    let event = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    let text = guest.string("x");

    match guest.try_call("WriteFile", &[event, text, 1, 0, 0]) {
        Err(KernelError::Fault(Fault::Unsupported { api, .. })) => assert_eq!(api, "WriteFile"),
        other => panic!("expected a fault, got {:?}", other),
    }
}

/// ============================================================================
/// Version and system information
/// ============================================================================

#[test]
fn test_get_version() {
    let mut guest = Guest::boot();
    assert_eq!(guest.call("GetVersion", &[]), 0x0A28_0105);
}

#[test]
fn test_get_version_ex() {
    let mut guest = Guest::boot();
    let info = guest.alloc(156);
    guest.write_u32(info, 148);
    assert_eq!(guest.call("GetVersionExA", &[info]), TRUE);
    assert_eq!(guest.read_u32(info + 4), 5);
    assert_eq!(guest.read_u32(info + 8), 1);
    assert_eq!(guest.read_u32(info + 12), 2600);
    assert_eq!(guest.read_u32(info + 16), 2);
    assert_eq!(guest.read_string(info + 20), "Service Pack 2");
    assert_eq!(guest.read_bytes(info + 148, 8), vec![0u8; 8]);

    guest.write_u32(info, 156);
    assert_eq!(guest.call("GetVersionExA", &[info]), TRUE);
    let extra = guest.read_bytes(info + 148, 8);
    assert_eq!(u16::from_le_bytes([extra[0], extra[1]]), 2);
    assert_eq!(u16::from_le_bytes([extra[2], extra[3]]), 0);
    assert_eq!(extra[6], 1);

    guest.write_u32(info, 100);
    assert_eq!(guest.call("GetVersionExA", &[info]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::InsufficientBuffer.code());
}

#[test]
fn test_get_system_info() {
    let mut guest = Guest::boot();
    let info = guest.alloc(36);
    guest.call("GetSystemInfo", &[info]);
    assert_eq!(guest.read_u32(info + 4), PAGE_SIZE);
    assert_eq!(guest.read_u32(info + 20), 1);
    assert_eq!(guest.read_u32(info + 24), 586);
}

#[test]
fn test_system_time_as_file_time() {
    let mut guest = Guest::boot();
    let out = guest.alloc(8);
    guest.clock.advance(1234);
    guest.call("GetSystemTimeAsFileTime", &[out]);

    let low = u64::from(guest.read_u32(out));
    let high = u64::from(guest.read_u32(out + 4));
    let unix_ms = MANUAL_CLOCK_EPOCH_MS + guest.clock.now();
    assert_eq!((high << 32) | low, (unix_ms + 11_644_473_600_000) * 10_000);
}

#[test]
fn test_performance_counter() {
    let mut guest = Guest::boot();
    let out = guest.alloc(8);
    assert_eq!(guest.call("QueryPerformanceFrequency", &[out]), TRUE);
    assert_eq!(guest.read_u32(out), 1000);

    guest.clock.advance(1500);
    assert_eq!(guest.call("QueryPerformanceCounter", &[out]), TRUE);
    assert_eq!(guest.read_u32(out), 1500);
    assert_eq!(guest.read_u32(out + 4), 0);
}

#[test]
fn test_pointer_encoding() {
    let mut guest = Guest::boot();
    let encoded = guest.call("EncodePointer", &[0x0040_1000]);
    assert_ne!(encoded, 0x0040_1000);
    assert_eq!(guest.call("DecodePointer", &[encoded]), 0x0040_1000);
}

#[test]
fn test_small_helpers() {
    let mut guest = Guest::boot();
    let text = guest.string("kernel32");
    assert_eq!(guest.call("lstrlenA", &[text]), 8);
    assert_eq!(guest.call("lstrlenA", &[0]), 0);
    assert_eq!(guest.call("IsDebuggerPresent", &[]), FALSE);
    assert_eq!(guest.call("SetHandleCount", &[20]), 20);

    let message = guest.string("checkpoint\n");
    guest.call("OutputDebugStringA", &[message]);
    assert_eq!(guest.console.output(), "");
}

/// ============================================================================
/// Dispatch
/// ============================================================================

#[test]
fn test_api_call_counts() {
    let mut guest = Guest::boot();
    guest.call("GetTickCount", &[]);
    guest.call("GetTickCount", &[]);
    guest.call("CloseHandle", &[0x1000]);

    assert_eq!(guest.kernel.api_call_count("GetTickCount"), 2);
    assert_eq!(guest.kernel.api_call_count("CloseHandle"), 1);
    assert_eq!(guest.kernel.api_call_count("Sleep"), 0);
    assert_eq!(guest.kernel.api_call_count("NoSuchExport"), 0);
}

#[test]
fn test_stdcall_frame_is_popped() {
    let mut guest = Guest::boot();
    let esp = guest.kernel.cpu().esp;
    guest.call("SetHandleCount", &[5]);
    assert_eq!(guest.kernel.cpu().esp, esp);
    guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    assert_eq!(guest.kernel.cpu().esp, esp);
}

#[test]
fn test_unsupported_import_faults() {
    let mut guest = Guest::boot();
    let thunk = guest.kernel.resolve_import("user32.dll", "MessageBoxA");
    assert!(guest.kernel.is_host_address(thunk));
    assert_eq!(guest.kernel.resolve_import("USER32.DLL", "MessageBoxA"), thunk);

    // Exports that raise exceptions end the session the same way
    let debug_break = guest.kernel.resolve_import("kernel32.dll", "DebugBreak");
    assert!(matches!(
        guest.kernel.invoke_host(debug_break),
        Err(KernelError::Fault(Fault::UnsupportedImport { .. }))
    ));

    match guest.kernel.invoke_host(thunk) {
        Err(KernelError::Fault(Fault::UnsupportedImport { module, name })) => {
            assert_eq!(module, "user32.dll");
            assert_eq!(name, "MessageBoxA");
        }
        other => panic!("expected an unsupported import, got {:?}", other),
    }
}

#[test]
fn test_unknown_host_address() {
    let mut guest = Guest::boot();
    assert!(matches!(
        guest.kernel.invoke_host(0x0040_0000),
        Err(KernelError::Fault(Fault::UnknownCallback(0x0040_0000)))
    ));
}
