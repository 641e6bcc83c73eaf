// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Typed argument extraction
//!
//! Arguments are read from the guest stack once, before the handler runs,
//! so handlers never touch `esp` and do not care which interpreter drives
//! them.
//!
//! ```text
//! esp + 0        return address
//! esp + 4        argument 0
//! esp + 4 + 4n   argument n
//! ```

use core::fmt;

use crate::error::{KernelResult, Win32Error};
use crate::mm::GuestAddr;
use crate::object::Handle;
use crate::traits::{GuestMemory, MemoryError};

/// Longest string read from guest memory (`UNICODE_STRING` limit)
pub const MAX_STRING: usize = 32_767;

/// Arguments of one API call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiArgs {
    /// Address the call returns to
    return_address: GuestAddr,

    /// Raw dword arguments, first argument first
    args: Vec<u32>,
}

impl ApiArgs {
    /// Create from already extracted values
    pub fn new(return_address: GuestAddr, args: Vec<u32>) -> Self {
        Self { return_address, args }
    }

    /// Read the return address and `arity` dwords above it
    pub fn from_stack(memory: &dyn GuestMemory, esp: GuestAddr, arity: usize) -> Result<Self, MemoryError> {
        let return_address = memory.read_u32(esp)?;
        let mut args = Vec::with_capacity(arity);
        let mut at = esp;
        for _ in 0..arity {
            at = at.checked_add(4).ok_or(MemoryError::Wrap { addr: esp, len: 4 * (arity + 1) })?;
            args.push(memory.read_u32(at)?);
        }
        Ok(Self { return_address, args })
    }

    /// Get the return address
    pub fn return_address(&self) -> GuestAddr {
        self.return_address
    }

    /// Get the number of arguments
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Get argument at index (0 past the end)
    pub fn arg(&self, index: usize) -> u32 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Get argument as u32
    pub fn arg_u32(&self, index: usize) -> u32 {
        self.arg(index)
    }

    /// Get argument as i32
    pub fn arg_i32(&self, index: usize) -> i32 {
        self.arg(index) as i32
    }

    /// Get argument as a Win32 `BOOL`
    pub fn arg_bool(&self, index: usize) -> bool {
        self.arg(index) != 0
    }

    /// Get argument as a pointer; NULL is `None`
    pub fn arg_ptr(&self, index: usize) -> Option<GuestAddr> {
        match self.arg(index) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Get argument as a pointer that must not be NULL
    pub fn arg_required_ptr(&self, index: usize) -> KernelResult<GuestAddr> {
        self.arg_ptr(index).ok_or_else(|| Win32Error::InvalidParameter.into())
    }

    /// Get argument as a handle
    pub fn arg_handle(&self, index: usize) -> Handle {
        Handle::from_raw(self.arg(index))
    }
}

impl fmt::Display for ApiArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:#x}", arg)?;
        }
        Ok(())
    }
}

/// ============================================================================
/// String Helpers
/// ============================================================================

/// Encode text as single-byte ANSI, optionally NUL-terminated
pub fn ansi_bytes(text: &str, nul: bool) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.chars().map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' }).collect();
    if nul {
        bytes.push(0);
    }
    bytes
}

/// Read an optional ANSI string argument
pub fn read_string(memory: &dyn GuestMemory, ptr: Option<GuestAddr>) -> Result<Option<String>, MemoryError> {
    ptr.map(|addr| memory.read_cstr(addr, MAX_STRING)).transpose()
}

/// Copy `text` into a caller buffer of `size` bytes
///
/// Follows the size-probing protocol: if the buffer cannot hold the text
/// and its terminator, nothing is written and the required size including
/// the terminator is returned. Otherwise the length without the terminator
/// is returned.
pub fn write_probed_string(memory: &mut dyn GuestMemory, buffer: Option<GuestAddr>, size: u32, text: &str) -> Result<u32, MemoryError> {
    let bytes = ansi_bytes(text, true);
    let required = bytes.len() as u32;
    match buffer {
        Some(addr) if size >= required => {
            memory.write_bytes(addr, &bytes)?;
            Ok(required - 1)
        }
        _ => Ok(required),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::memory::FlatMemory;

    #[test]
    fn test_from_stack() {
        let mut mem = FlatMemory::new();
        let esp = mem.alloc_pages(0x1000).unwrap() + 0x100;
        for (i, value) in [0x0040_1234u32, 1, 2, 0xFFFF_FFF6].iter().enumerate() {
            mem.write_u32(esp + 4 * i as u32, *value).unwrap();
        }

        let args = ApiArgs::from_stack(&mem, esp, 3).unwrap();
        assert_eq!(args.return_address(), 0x0040_1234);
        assert_eq!(args.len(), 3);
        assert_eq!(args.arg_u32(0), 1);
        assert!(args.arg_bool(1));
        assert_eq!(args.arg_i32(2), -10);
        assert_eq!(args.arg(7), 0);
        assert_eq!(args.to_string(), "0x1, 0x2, 0xfffffff6");
    }

    #[test]
    fn test_pointer_arguments() {
        let args = ApiArgs::new(0, vec![0, 0x2000]);
        assert_eq!(args.arg_ptr(0), None);
        assert_eq!(args.arg_ptr(1), Some(0x2000));
        assert!(args.arg_required_ptr(0).is_err());
        assert_eq!(args.arg_handle(1), Handle::from_raw(0x2000));
    }

    #[test]
    fn test_probed_string() {
        let mut mem = FlatMemory::new();
        let buf = mem.alloc_pages(1).unwrap();
        assert_eq!(write_probed_string(&mut mem, None, 0, "C:\\tmp").unwrap(), 7);
        assert_eq!(write_probed_string(&mut mem, Some(buf), 6, "C:\\tmp").unwrap(), 7);
        assert_eq!(mem.read_u8(buf).unwrap(), 0);
        assert_eq!(write_probed_string(&mut mem, Some(buf), 7, "C:\\tmp").unwrap(), 6);
        assert_eq!(mem.read_cstr(buf, 64).unwrap(), "C:\\tmp");
    }
}
