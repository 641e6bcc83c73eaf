// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual allocations
//!
//! `VirtualAlloc` regions of a process, keyed by base address. Every region
//! is committed in full when it is created, so a later `MEM_COMMIT` inside
//! a reserved region only has to find it.
//!
//! # Design
//!
//! ```text
//! VirtualAlloc(NULL, size)   -> alloc_pages(page_span(size)) -> insert(base, size)
//! VirtualAlloc(addr, size)   -> containing(addr, size)       -> page base of addr
//! VirtualFree(base, 0, REL)  -> release(base)                -> free_pages(base)
//! ```

use std::collections::BTreeMap;

use bitflags::bitflags;
use log::{debug, trace};

use super::{align_page_down, page_span, GuestAddr};
use crate::error::{Fault, KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::object::PageProtection;

bitflags! {
    /// `flAllocationType` of `VirtualAlloc`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationType: u32 {
        const COMMIT = 0x0000_1000;
        const RESERVE = 0x0000_2000;
        const RESET = 0x0008_0000;
        const TOP_DOWN = 0x0010_0000;
    }
}

bitflags! {
    /// `dwFreeType` of `VirtualFree`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FreeType: u32 {
        const DECOMMIT = 0x0000_4000;
        const RELEASE = 0x0000_8000;
    }
}

/// Regions a process allocated with `VirtualAlloc`
#[derive(Debug, Default, Clone)]
pub struct VirtualRegions {
    /// base -> page-rounded size
    regions: BTreeMap<GuestAddr, u32>,
}

impl VirtualRegions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, base: GuestAddr, size: u32) {
        self.regions.insert(base, size);
    }

    /// Base of the region holding all of `[addr, addr + len)`
    pub fn containing(&self, addr: GuestAddr, len: u32) -> Option<GuestAddr> {
        let (&base, &size) = self.regions.range(..=addr).next_back()?;
        let end = u64::from(base) + u64::from(size);
        (u64::from(addr) + u64::from(len) <= end).then_some(base)
    }

    /// Forget the region starting at `base`, returning its size
    pub fn release(&mut self, base: GuestAddr) -> Option<u32> {
        self.regions.remove(&base)
    }

    /// Forget every region, returning their bases
    pub fn drain(&mut self) -> Vec<GuestAddr> {
        std::mem::take(&mut self.regions).into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Kernel {
    /// `VirtualAlloc` for the current process
    ///
    /// A NULL address commits a new region. A non-NULL address must fall
    /// inside a region the process already owns; placing a new region at
    /// a fixed address is not modeled.
    pub fn virtual_alloc(&mut self, addr: GuestAddr, size: u32, kind: u32, protect: u32) -> KernelResult<GuestAddr> {
        let ctx = self.current_context()?;
        let kind = AllocationType::from_bits(kind).ok_or(Win32Error::InvalidParameter)?;
        if !kind.intersects(AllocationType::COMMIT | AllocationType::RESERVE) || size == 0 {
            return Err(Win32Error::InvalidParameter.into());
        }
        PageProtection::parse(protect)?;

        if addr != 0 {
            let regions = &self.objects.process(ctx.process)?.virtual_regions;
            return match regions.containing(addr, size) {
                Some(_) => Ok(align_page_down(addr)),
                None => Err(Fault::Unsupported {
                    api: "VirtualAlloc",
                    detail: format!("placing a region at {:#010x}", addr),
                }
                .into()),
            };
        }

        let span = page_span(size).ok_or(Win32Error::NotEnoughMemory)?;
        let base = self.memory.alloc_pages(span).ok_or(Win32Error::NotEnoughMemory)?;
        self.objects.process_mut(ctx.process)?.virtual_regions.insert(base, span);
        debug!("process {} allocated {:#x} bytes at {:#010x}", ctx.process, span, base);
        Ok(base)
    }

    /// `VirtualFree` for the current process
    ///
    /// `MEM_RELEASE` returns a whole region. `MEM_DECOMMIT` is accepted for
    /// any owned range and leaves the pages committed.
    pub fn virtual_free(&mut self, addr: GuestAddr, size: u32, free_type: u32) -> KernelResult<()> {
        let ctx = self.current_context()?;
        let free_type = FreeType::from_bits(free_type).ok_or(Win32Error::InvalidParameter)?;
        let process = self.objects.process_mut(ctx.process)?;

        if free_type == FreeType::RELEASE {
            if size != 0 {
                return Err(Win32Error::InvalidParameter.into());
            }
            process.virtual_regions.release(addr).ok_or(Win32Error::InvalidAddress)?;
            self.memory.free_pages(addr);
            trace!("process {} released {:#010x}", ctx.process, addr);
            return Ok(());
        }
        if free_type == FreeType::DECOMMIT {
            process.virtual_regions.containing(addr, size.max(1)).ok_or(Win32Error::InvalidAddress)?;
            return Ok(());
        }
        Err(Win32Error::InvalidParameter.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containing() {
        let mut regions = VirtualRegions::new();
        regions.insert(0x10000, 0x3000);
        assert_eq!(regions.containing(0x10000, 1), Some(0x10000));
        assert_eq!(regions.containing(0x12000, 0x1000), Some(0x10000));
        assert_eq!(regions.containing(0x12000, 0x1001), None);
        assert_eq!(regions.containing(0xF000, 1), None);
        assert_eq!(regions.containing(0x13000, 1), None);
    }

    #[test]
    fn test_release_and_drain() {
        let mut regions = VirtualRegions::new();
        regions.insert(0x10000, 0x1000);
        regions.insert(0x20000, 0x2000);
        assert_eq!(regions.release(0x10800), None);
        assert_eq!(regions.release(0x10000), Some(0x1000));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions.drain(), vec![0x20000]);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_flag_sets() {
        assert!(AllocationType::from_bits(0x3000).is_some());
        assert!(AllocationType::from_bits(0x1).is_none());
        assert!(FreeType::from_bits(0x8000).is_some());
    }
}
