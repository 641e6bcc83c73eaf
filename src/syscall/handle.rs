// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Handle, console file and section calls

use bitflags::bitflags;
use log::{trace, warn};

use super::args::read_string;
use super::{ApiArgs, ApiOutcome, TRUE};
use crate::error::{Fault, KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::mm::{align_page_down, GuestAddr, PAGE_SIZE};
use crate::object::{
    CloseOutcome, Disposition, FileMapAccess, FileMapping, Handle, KernelObject, PageProtection,
};
use crate::traits::MemoryError;

bitflags! {
    /// `DuplicateHandle` options
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DuplicateOptions: u32 {
        const CLOSE_SOURCE = 0x0000_0001;
        const SAME_ACCESS = 0x0000_0002;
    }
}

/// `STD_INPUT_HANDLE`
const STD_INPUT_HANDLE: i32 = -10;
/// `STD_OUTPUT_HANDLE`
const STD_OUTPUT_HANDLE: i32 = -11;
/// `STD_ERROR_HANDLE`
const STD_ERROR_HANDLE: i32 = -12;

impl Kernel {
    /// Drop one reference to a handle
    ///
    /// Pseudo-handles are accepted and ignored. Destroyed sections release
    /// their backing pages once no view uses them; destroyed heaps release
    /// their regions.
    pub fn close_handle(&mut self, handle: Handle) -> KernelResult<()> {
        if handle.is_pseudo() {
            return Ok(());
        }
        match self.objects.close(handle)? {
            CloseOutcome::Retained => {}
            CloseOutcome::Released => self.reap(handle),
            CloseOutcome::Destroyed(object) => self.destroy_object(handle, object)?,
        }
        Ok(())
    }

    fn destroy_object(&mut self, handle: Handle, object: KernelObject) -> KernelResult<()> {
        match object {
            KernelObject::FileMapping(FileMapping { region: Some(region), .. }) => {
                if let Some(region) = self.views.release(region) {
                    self.memory.free_pages(region);
                }
            }
            KernelObject::Heap(heap) => heap.destroy(self.memory.as_mut()),
            KernelObject::WaitObject(w) if !w.queue.is_empty() => {
                warn!("{} closed with {} waiter(s) still queued", handle, w.queue.len());
                self.orphan_waiters(w)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Write to a console handle
    fn console_write(&mut self, api: &'static str, handle: Handle, buffer: GuestAddr, len: u32) -> KernelResult<u32> {
        let stream = match self.objects.lookup(handle)? {
            KernelObject::File(file) if file.is_writable() => file.stream(),
            KernelObject::File(_) => return Err(Win32Error::AccessDenied.into()),
            other => {
                return Err(Fault::Unsupported {
                    api,
                    detail: format!("writing to a {} handle", other.object_type().name()),
                }
                .into())
            }
        };
        let mut chunk = [0u8; PAGE_SIZE as usize];
        let mut written = 0u32;
        while written < len {
            let at = buffer.checked_add(written).ok_or(MemoryError::Wrap { addr: buffer, len: len as usize })?;
            let n = chunk_len(at, len - written);
            self.memory.read_bytes(at, &mut chunk[..n])?;
            let done = self.console.write(stream, &chunk[..n]).min(n);
            written += done as u32;
            if done < n {
                break;
            }
        }
        Ok(written)
    }

    /// Read console input into guest memory
    fn console_read(&mut self, buffer: GuestAddr, len: u32) -> KernelResult<u32> {
        let mut chunk = [0u8; PAGE_SIZE as usize];
        let mut read = 0u32;
        while read < len {
            let at = buffer.checked_add(read).ok_or(MemoryError::Wrap { addr: buffer, len: len as usize })?;
            let n = chunk_len(at, len - read);
            let got = self.console.read(&mut chunk[..n]).min(n);
            self.memory.write_bytes(at, &chunk[..got])?;
            read += got as u32;
            if got < n {
                break;
            }
        }
        Ok(read)
    }
}

/// Bytes of a guest transfer at `at` that stay within its page
fn chunk_len(at: GuestAddr, remaining: u32) -> usize {
    let page_end = u64::from(align_page_down(at)) + u64::from(PAGE_SIZE);
    (page_end - u64::from(at)).min(u64::from(remaining)) as usize
}

/// ============================================================================
/// Handles
/// ============================================================================

pub(super) fn close_handle(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    kernel.close_handle(args.arg_handle(0))?;
    Ok(ApiOutcome::Return(TRUE))
}

/// `DuplicateHandle(hSourceProcess, hSource, hTargetProcess, lpTarget, access, inherit, options)`
///
/// Duplicates share the handle value of the source and add a reference.
pub(super) fn duplicate_handle(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let options = DuplicateOptions::from_bits(args.arg_u32(6)).ok_or(Win32Error::InvalidFlags)?;
    kernel.objects.process(kernel.resolve_pseudo(args.arg_handle(0))?)?;
    kernel.objects.process(kernel.resolve_pseudo(args.arg_handle(2))?)?;

    let source = kernel.resolve_pseudo(args.arg_handle(1))?;
    kernel.objects.add_ref(source)?;
    if let Some(target) = args.arg_ptr(3) {
        kernel.memory.write_u32(target, source.raw())?;
    }
    if options.contains(DuplicateOptions::CLOSE_SOURCE) {
        kernel.close_handle(source)?;
    }
    trace!("duplicated {} ({} refs)", source, kernel.objects.refs(source));
    Ok(ApiOutcome::Return(TRUE))
}

pub(super) fn get_std_handle(_kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = match args.arg_i32(0) {
        STD_INPUT_HANDLE => Handle::STD_INPUT,
        STD_OUTPUT_HANDLE => Handle::STD_OUTPUT,
        STD_ERROR_HANDLE => Handle::STD_ERROR,
        _ => return Err(Win32Error::InvalidHandle.into()),
    };
    Ok(ApiOutcome::Return(handle.raw()))
}

pub(super) fn get_file_type(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let file = kernel.objects.file(args.arg_handle(0))?;
    Ok(ApiOutcome::Return(file.file_type()))
}

/// ============================================================================
/// Console I/O
/// ============================================================================

/// `WriteFile(hFile, lpBuffer, nBytes, lpWritten, lpOverlapped)`
pub(super) fn write_file(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    if args.arg_ptr(4).is_some() {
        return Err(Fault::Unsupported { api: "WriteFile", detail: String::from("overlapped I/O") }.into());
    }
    let written = kernel.console_write("WriteFile", args.arg_handle(0), args.arg_u32(1), args.arg_u32(2))?;
    if let Some(out) = args.arg_ptr(3) {
        kernel.memory.write_u32(out, written)?;
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// `WriteConsoleA(hConsole, lpBuffer, nChars, lpWritten, reserved)`
pub(super) fn write_console(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let written = kernel.console_write("WriteConsoleA", args.arg_handle(0), args.arg_u32(1), args.arg_u32(2))?;
    if let Some(out) = args.arg_ptr(3) {
        kernel.memory.write_u32(out, written)?;
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// `ReadFile(hFile, lpBuffer, nBytes, lpRead, lpOverlapped)`
pub(super) fn read_file(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    if args.arg_ptr(4).is_some() {
        return Err(Fault::Unsupported { api: "ReadFile", detail: String::from("overlapped I/O") }.into());
    }
    match kernel.objects.lookup(args.arg_handle(0))? {
        KernelObject::File(file) if file.is_readable() => {}
        KernelObject::File(_) => return Err(Win32Error::AccessDenied.into()),
        other => {
            return Err(Fault::Unsupported {
                api: "ReadFile",
                detail: format!("reading from a {} handle", other.object_type().name()),
            }
            .into())
        }
    }

    let read = kernel.console_read(args.arg_u32(1), args.arg_u32(2))?;
    if let Some(out) = args.arg_ptr(3) {
        kernel.memory.write_u32(out, read)?;
    }
    Ok(ApiOutcome::Return(TRUE))
}

/// ============================================================================
/// Sections
/// ============================================================================

/// `CreateFileMappingA(hFile, lpAttributes, flProtect, sizeHigh, sizeLow, lpName)`
pub(super) fn create_file_mapping(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    if args.arg_handle(0) != Handle::INVALID {
        return Err(Fault::Unsupported {
            api: "CreateFileMappingA",
            detail: String::from("file-backed sections"),
        }
        .into());
    }
    let protection = PageProtection::parse(args.arg_u32(2))?;
    let size = args.arg_u32(4);
    if args.arg_u32(3) != 0 || size == 0 {
        return Err(Win32Error::InvalidParameter.into());
    }
    let name = read_string(kernel.memory.as_ref(), args.arg_ptr(5))?;

    let mapping = FileMapping::new(size, protection);
    let (handle, disposition) = kernel.objects.create(KernelObject::FileMapping(mapping), name.as_deref())?;
    let last_error = match disposition {
        Disposition::Created => Win32Error::Success,
        Disposition::AlreadyExists => Win32Error::AlreadyExists,
    };
    kernel.set_last_error(last_error);
    Ok(ApiOutcome::Return(handle.raw()))
}

/// `OpenFileMappingA(access, inherit, lpName)`
pub(super) fn open_file_mapping(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let name = read_string(kernel.memory.as_ref(), args.arg_ptr(2))?.ok_or(Win32Error::InvalidParameter)?;
    let handle = kernel.objects.lookup_by_name(&name).ok_or(Win32Error::FileNotFound)?;
    kernel.objects.file_mapping(handle)?;
    kernel.objects.add_ref(handle)?;
    Ok(ApiOutcome::Return(handle.raw()))
}

/// `MapViewOfFile(hMapping, access, offsetHigh, offsetLow, length)`
///
/// The section is committed on its first map; every view of a section
/// aliases the same pages.
pub(super) fn map_view_of_file(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    let handle = args.arg_handle(0);
    let access = FileMapAccess::from_bits_truncate(args.arg_u32(1));
    if args.arg_u32(2) != 0 {
        return Err(Win32Error::InvalidParameter.into());
    }
    let offset = args.arg_u32(3);

    let mapping = kernel.objects.file_mapping(handle)?;
    mapping.view_length(access, offset, args.arg_u32(4))?;
    let (size, committed) = (mapping.size, mapping.region);
    let region = match committed {
        Some(region) => region,
        None => {
            let region = kernel.memory.alloc_pages(size).ok_or(Win32Error::NotEnoughMemory)?;
            kernel.objects.file_mapping_mut(handle)?.region = Some(region);
            kernel.views.attach(region);
            region
        }
    };

    let view = region + offset;
    kernel.views.map(region, view);
    trace!("view of {} at {:#010x}", handle, view);
    Ok(ApiOutcome::Return(view))
}

pub(super) fn unmap_view_of_file(kernel: &mut Kernel, args: &ApiArgs) -> KernelResult<ApiOutcome> {
    if let Some(region) = kernel.views.unmap(args.arg_u32(0))? {
        kernel.memory.free_pages(region);
    }
    Ok(ApiOutcome::Return(TRUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StdStream;

    #[test]
    fn test_duplicate_options() {
        assert!(DuplicateOptions::from_bits(3).is_some());
        assert!(DuplicateOptions::from_bits(4).is_none());
    }

    #[test]
    fn test_std_handle_constants() {
        assert_eq!(STD_OUTPUT_HANDLE as u32, 0xFFFF_FFF5);
        assert_eq!(STD_INPUT_HANDLE as u32, 0xFFFF_FFF6);
    }

    #[test]
    fn test_chunks_stop_at_page_ends() {
        assert_eq!(chunk_len(0x1000, 10), 10);
        assert_eq!(chunk_len(0x1FF0, 0x100), 0x10);
        assert_eq!(chunk_len(0x2000, u32::MAX), PAGE_SIZE as usize);
        assert_eq!(chunk_len(0xFFFF_FFFF, 8), 1);
    }

    #[test]
    fn test_stream_of_std_handles() {
        let file = crate::object::FileObject::new(StdStream::Error);
        assert!(file.is_writable());
        assert!(!file.is_readable());
    }
}
