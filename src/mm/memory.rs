// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Flat guest memory
//!
//! A sparse 32-bit address space made of 4 KiB pages. Regions are committed
//! first-fit between a floor and a ceiling; every committed page starts
//! zeroed. Hosts with their own paging layer implement
//! [`GuestMemory`](crate::traits::GuestMemory) directly instead.

use std::collections::BTreeMap;

use super::{page_span, GuestAddr, PAGE_MASK, PAGE_SIZE, PAGE_SIZE_SHIFT};
use crate::traits::{GuestMemory, MemoryError};

/// Lowest address handed out by the region allocator
pub const DEFAULT_FLOOR: GuestAddr = 0x0001_0000;

/// One past the highest address handed out by the region allocator
pub const DEFAULT_CEILING: GuestAddr = 0x7FFF_0000;

/// Sparse page-backed guest memory
pub struct FlatMemory {
    /// Committed pages keyed by page number
    pages: BTreeMap<u32, Box<[u8]>>,
    /// Committed regions: base -> size
    regions: BTreeMap<GuestAddr, u32>,
    floor: GuestAddr,
    ceiling: GuestAddr,
}

impl FlatMemory {
    /// Create an empty address space with the default bounds
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_FLOOR, DEFAULT_CEILING)
    }

    /// Create an empty address space allocating within `[floor, ceiling)`
    pub fn with_bounds(floor: GuestAddr, ceiling: GuestAddr) -> Self {
        Self {
            pages: BTreeMap::new(),
            regions: BTreeMap::new(),
            floor: floor & !PAGE_MASK,
            ceiling: ceiling & !PAGE_MASK,
        }
    }

    /// Commit a region at a fixed page-aligned address (used by loaders)
    pub fn map_fixed(&mut self, base: GuestAddr, size: u32) -> bool {
        let Some(size) = page_span(size) else {
            return false;
        };
        if base & PAGE_MASK != 0 || base.checked_add(size).is_none() || self.overlaps(base, size) {
            return false;
        }
        self.commit(base, size);
        true
    }

    /// Size of the committed region starting at `base`
    pub fn region_size(&self, base: GuestAddr) -> Option<u32> {
        self.regions.get(&base).copied()
    }

    /// Number of committed regions
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn overlaps(&self, base: GuestAddr, size: u32) -> bool {
        let end = u64::from(base) + u64::from(size);
        if let Some((&prev, &prev_size)) = self.regions.range(..=base).next_back() {
            if u64::from(prev) + u64::from(prev_size) > u64::from(base) {
                return true;
            }
        }
        self.regions.range(base..).next().is_some_and(|(&next, _)| u64::from(next) < end)
    }

    fn find_gap(&self, size: u32) -> Option<GuestAddr> {
        let mut candidate = u64::from(self.floor);
        let needed = u64::from(size);
        for (&base, &len) in self.regions.range(self.floor..) {
            if u64::from(base) >= candidate + needed {
                break;
            }
            candidate = candidate.max(u64::from(base) + u64::from(len));
        }
        if candidate + needed <= u64::from(self.ceiling) {
            Some(candidate as GuestAddr)
        } else {
            None
        }
    }

    fn commit(&mut self, base: GuestAddr, size: u32) {
        let first = base >> PAGE_SIZE_SHIFT;
        for page in first..first + (size >> PAGE_SIZE_SHIFT) {
            self.pages.insert(page, vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        }
        self.regions.insert(base, size);
    }

    /// Walk `len` bytes from `addr` page by page
    fn for_each_chunk(
        addr: GuestAddr,
        len: usize,
        mut f: impl FnMut(u32, usize, usize, usize) -> Result<(), MemoryError>,
    ) -> Result<(), MemoryError> {
        if u64::from(addr) + len as u64 > u64::from(u32::MAX) + 1 {
            return Err(MemoryError::Wrap { addr, len });
        }
        let mut done = 0usize;
        while done < len {
            let at = addr + done as u32;
            let offset = (at & PAGE_MASK) as usize;
            let n = (len - done).min(PAGE_SIZE as usize - offset);
            f(at, offset, done, n)?;
            done += n;
        }
        Ok(())
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestMemory for FlatMemory {
    fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let pages = &self.pages;
        Self::for_each_chunk(addr, buf.len(), |at, offset, done, n| {
            let page = pages.get(&(at >> PAGE_SIZE_SHIFT)).ok_or(MemoryError::Unmapped { addr: at })?;
            buf[done..done + n].copy_from_slice(&page[offset..offset + n]);
            Ok(())
        })
    }

    fn write_bytes(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MemoryError> {
        let pages = &mut self.pages;
        Self::for_each_chunk(addr, data.len(), |at, offset, done, n| {
            let page = pages.get_mut(&(at >> PAGE_SIZE_SHIFT)).ok_or(MemoryError::Unmapped { addr: at })?;
            page[offset..offset + n].copy_from_slice(&data[done..done + n]);
            Ok(())
        })
    }

    fn alloc_pages(&mut self, size: u32) -> Option<GuestAddr> {
        let size = page_span(size)?;
        let base = self.find_gap(size)?;
        self.commit(base, size);
        Some(base)
    }

    fn free_pages(&mut self, base: GuestAddr) -> bool {
        let Some(size) = self.regions.remove(&base) else {
            return false;
        };
        let first = base >> PAGE_SIZE_SHIFT;
        for page in first..first + (size >> PAGE_SIZE_SHIFT) {
            self.pages.remove(&page);
        }
        true
    }
}
