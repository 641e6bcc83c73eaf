// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! File and section objects
//!
//! Two kinds of file-ish objects exist:
//!
//! - [`FileObject`]: a character device behind one of the standard handles
//! - [`FileMapping`]: a page-file backed section created by
//!   `CreateFileMappingA`; its pages are committed on the first map
//!
//! Views are tracked by the [`ViewRegistry`] rather than by the mapping, so
//! a view stays valid after the last mapping handle is closed.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::error::Win32Error;
use crate::mm::{GuestAddr, PAGE_SIZE};
use crate::traits::StdStream;

/// `GetFileType` result for character devices
pub const FILE_TYPE_CHAR: u32 = 0x0002;

bitflags! {
    /// `PAGE_*` protection values plus the `SEC_*` section attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProtection: u32 {
        const NOACCESS = 0x01;
        const READONLY = 0x02;
        const READWRITE = 0x04;
        const WRITECOPY = 0x08;
        const EXECUTE = 0x10;
        const EXECUTE_READ = 0x20;
        const EXECUTE_READWRITE = 0x40;
        const EXECUTE_WRITECOPY = 0x80;

        const SEC_IMAGE = 0x0100_0000;
        const SEC_RESERVE = 0x0400_0000;
        const SEC_COMMIT = 0x0800_0000;
        const SEC_NOCACHE = 0x1000_0000;
    }
}

bitflags! {
    /// `FILE_MAP_*` access requested by `MapViewOfFile`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMapAccess: u32 {
        const COPY = 0x01;
        const WRITE = 0x02;
        const READ = 0x04;
        const EXECUTE = 0x20;
        const ALL_ACCESS = 0x000F_001F;
    }
}

impl PageProtection {
    const PROTECTION_MASK: u32 = 0xFF;

    /// Validate a `flProtect` argument: exactly one protection value plus
    /// any section attributes
    pub fn parse(raw: u32) -> Result<Self, Win32Error> {
        let flags = Self::from_bits(raw).ok_or(Win32Error::InvalidParameter)?;
        if (raw & Self::PROTECTION_MASK).count_ones() != 1 {
            return Err(Win32Error::InvalidParameter);
        }
        Ok(flags)
    }

    /// Whether views may be mapped for writing
    pub fn is_writable(self) -> bool {
        self.intersects(Self::READWRITE | Self::WRITECOPY | Self::EXECUTE_READWRITE | Self::EXECUTE_WRITECOPY)
    }
}

/// ============================================================================
/// Console File Object
/// ============================================================================

/// Character device behind a standard handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileObject {
    stream: StdStream,
}

impl FileObject {
    /// Create a file object over a console stream
    pub fn new(stream: StdStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> StdStream {
        self.stream
    }

    /// `GetFileType` value
    pub fn file_type(&self) -> u32 {
        FILE_TYPE_CHAR
    }

    pub fn is_readable(&self) -> bool {
        self.stream == StdStream::Input
    }

    pub fn is_writable(&self) -> bool {
        !self.is_readable()
    }
}

/// ============================================================================
/// File Mapping
/// ============================================================================

/// Page-file backed section object
#[derive(Debug)]
pub struct FileMapping {
    /// Section size in bytes
    pub size: u32,

    /// Protection the section was created with
    pub protection: PageProtection,

    /// Backing region, committed on first map
    pub region: Option<GuestAddr>,
}

impl FileMapping {
    /// Create an uncommitted section
    pub fn new(size: u32, protection: PageProtection) -> Self {
        Self { size, protection, region: None }
    }

    /// Check a view request and return its length
    pub fn view_length(&self, access: FileMapAccess, offset: u32, length: u32) -> Result<u32, Win32Error> {
        if offset % PAGE_SIZE != 0 || offset >= self.size {
            return Err(Win32Error::InvalidParameter);
        }
        if access.contains(FileMapAccess::WRITE) && !self.protection.is_writable() {
            return Err(Win32Error::AccessDenied);
        }
        let available = self.size - offset;
        match length {
            0 => Ok(available),
            n if n <= available => Ok(n),
            _ => Err(Win32Error::AccessDenied),
        }
    }
}

/// ============================================================================
/// View Registry
/// ============================================================================

/// Mapped views and the sections backing them
///
/// Each backing region carries a use count: one for the open mapping object
/// plus one per mapped view. The region is released when the count drops
/// to zero.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    /// View address -> (backing region, times mapped at this address)
    views: BTreeMap<GuestAddr, (GuestAddr, u32)>,
    /// Backing region -> use count
    backings: BTreeMap<GuestAddr, u32>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly committed backing region held by its mapping object
    pub fn attach(&mut self, region: GuestAddr) {
        *self.backings.entry(region).or_insert(0) += 1;
    }

    /// Record a view of `region` at `view`
    pub fn map(&mut self, region: GuestAddr, view: GuestAddr) {
        *self.backings.entry(region).or_insert(0) += 1;
        self.views.entry(view).or_insert((region, 0)).1 += 1;
    }

    /// Remove a view
    ///
    /// # Returns
    /// * `Ok(Some(region))` when the backing region is no longer used and
    ///   must be released
    /// * `Ok(None)` when the region is still in use
    /// * `Err(ERROR_INVALID_ADDRESS)` when no view starts at `view`
    pub fn unmap(&mut self, view: GuestAddr) -> Result<Option<GuestAddr>, Win32Error> {
        let (region, count) = self.views.get_mut(&view).ok_or(Win32Error::InvalidAddress)?;
        let region = *region;
        *count -= 1;
        if *count == 0 {
            self.views.remove(&view);
        }
        Ok(self.release(region))
    }

    /// Drop one use of a backing region, returning it once unused
    pub fn release(&mut self, region: GuestAddr) -> Option<GuestAddr> {
        let uses = self.backings.get_mut(&region)?;
        *uses -= 1;
        if *uses > 0 {
            return None;
        }
        self.backings.remove(&region);
        Some(region)
    }

    /// Number of distinct view addresses
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn is_mapped(&self, view: GuestAddr) -> bool {
        self.views.contains_key(&view)
    }
}
