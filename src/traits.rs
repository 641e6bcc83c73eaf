// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Collaborator traits
//!
//! The kernel consumes its surroundings through these seams:
//!
//! - [`GuestMemory`]: byte-addressable guest memory plus a page allocator
//! - [`ImageLoader`]: maps executables and binds their imports
//! - [`Clock`]: monotonic milliseconds used for wait timeouts
//! - [`Console`]: backing store for the standard handles

use std::io::{Read, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::mm::GuestAddr;

/// ============================================================================
/// Guest Memory
/// ============================================================================

/// Guest memory access failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// Address is not backed by a committed page
    #[error("access to unmapped guest address {addr:#010x}")]
    Unmapped { addr: GuestAddr },

    /// Access would run past the top of the 32-bit address space
    #[error("access at {addr:#010x} of {len} bytes wraps the address space")]
    Wrap { addr: GuestAddr, len: usize },
}

/// Byte-addressable guest memory
///
/// Implementors provide raw byte transfer and page allocation; the typed
/// accessors are derived from them. All multi-byte values are little-endian.
pub trait GuestMemory {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`
    fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `data` into guest memory starting at `addr`
    fn write_bytes(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MemoryError>;

    /// Commit a zeroed, page-aligned region of at least `size` bytes
    ///
    /// # Returns
    /// * `Some(base)` on success
    /// * `None` if the address space is exhausted
    fn alloc_pages(&mut self, size: u32) -> Option<GuestAddr>;

    /// Release a region previously returned by [`GuestMemory::alloc_pages`]
    fn free_pages(&mut self, base: GuestAddr) -> bool;

    fn read_u8(&self, addr: GuestAddr) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: GuestAddr) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: GuestAddr) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u8(&mut self, addr: GuestAddr, value: u8) -> Result<(), MemoryError> {
        self.write_bytes(addr, &[value])
    }

    fn write_u16(&mut self, addr: GuestAddr, value: u16) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: GuestAddr, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Fill `len` bytes at `addr` with `value`
    fn fill(&mut self, addr: GuestAddr, value: u8, len: u32) -> Result<(), MemoryError> {
        const CHUNK: usize = 256;
        let chunk = [value; CHUNK];
        let mut done: u32 = 0;
        while done < len {
            let n = ((len - done) as usize).min(CHUNK);
            let at = addr.checked_add(done).ok_or(MemoryError::Wrap { addr, len: len as usize })?;
            self.write_bytes(at, &chunk[..n])?;
            done += n as u32;
        }
        Ok(())
    }

    /// Read a NUL-terminated ANSI string of at most `limit` bytes
    fn read_cstr(&self, addr: GuestAddr, limit: usize) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        let mut at = addr;
        while bytes.len() < limit {
            let b = self.read_u8(at)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            at = at.checked_add(1).ok_or(MemoryError::Wrap { addr, len: bytes.len() })?;
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    }

    /// Write `text` followed by a NUL terminator
    fn write_cstr(&mut self, addr: GuestAddr, text: &str) -> Result<(), MemoryError> {
        let mut bytes: Vec<u8> = text.chars().map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' }).collect();
        bytes.push(0);
        self.write_bytes(addr, &bytes)
    }
}

/// ============================================================================
/// Image Loading
/// ============================================================================

/// Binds an imported symbol to a callable guest address
pub trait ImportResolver {
    /// Resolve `module!name` to an address the guest can call
    fn resolve(&mut self, module: &str, name: &str) -> GuestAddr;
}

/// Request handed to the loader when a process is created
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    /// Executable name as given by the caller
    pub name: &'a str,
    /// Directories to search, in order
    pub search_paths: &'a [String],
    /// Working directory of the new process
    pub cwd: &'a str,
}

/// A mapped executable image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Module base name (e.g. `app.exe`)
    pub name: String,
    /// Full host-visible path
    pub path: String,
    /// Base address of the mapped image
    pub base: GuestAddr,
    /// Entry point address
    pub entry: GuestAddr,
    /// Stack commit from the image header (0 means default)
    pub stack_commit: u32,
    /// Stack reserve from the image header (0 means default)
    pub stack_reserve: u32,
}

/// Executable loader
pub trait ImageLoader {
    /// Locate, map and bind an executable
    ///
    /// # Returns
    /// * `Some(image)` once the image is mapped and its imports bound
    /// * `None` if the image cannot be found
    fn load(
        &mut self,
        memory: &mut dyn GuestMemory,
        imports: &mut dyn ImportResolver,
        request: &LoadRequest<'_>,
    ) -> Option<LoadedImage>;
}

/// ============================================================================
/// Time
/// ============================================================================

/// Monotonic millisecond clock plus a wall-clock reading
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch
    fn system_time_ms(&self) -> u64;

    /// Block the host until `deadline_ms` has passed
    fn sleep_until(&mut self, deadline_ms: u64);
}

/// Clock backed by [`std::time::Instant`]
#[derive(Debug)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn system_time_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |since| since.as_millis() as u64)
    }

    fn sleep_until(&mut self, deadline_ms: u64) {
        let now = self.now_ms();
        if deadline_ms > now {
            std::thread::sleep(Duration::from_millis(deadline_ms - now));
        }
    }
}

/// ============================================================================
/// Console
/// ============================================================================

/// Standard stream behind one of the reserved handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Output,
    Input,
    Error,
}

/// Console backing the standard handles
pub trait Console {
    /// Write bytes to an output stream, returning the number written
    fn write(&mut self, stream: StdStream, data: &[u8]) -> usize;

    /// Read up to `buf.len()` bytes of input; 0 means end of input
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Console attached to the host process's own standard streams
#[derive(Debug, Default)]
pub struct HostConsole;

impl Console for HostConsole {
    fn write(&mut self, stream: StdStream, data: &[u8]) -> usize {
        let result = match stream {
            StdStream::Error => std::io::stderr().write_all(data),
            _ => std::io::stdout().write_all(data),
        };
        match result {
            Ok(()) => data.len(),
            Err(err) => {
                log::warn!("console write to {:?} failed: {}", stream, err);
                0
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        std::io::stdin().read(buf).unwrap_or(0)
    }
}
