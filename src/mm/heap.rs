// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Heap Emulator
//!
//! Services `HeapAlloc` and friends from page regions committed through the
//! guest memory service. Block bookkeeping lives on the host side; guest
//! memory only ever holds payload bytes.
//!
//! # Design
//!
//! - **Regions**: page-granular commits; the first one is made at creation
//! - **Free list**: address-ordered, first fit, split on allocation
//! - **Coalescing**: adjacent free blocks of the same region merge on free
//! - **Growth**: by at least the growth increment, bounded by the maximum
//!   size unless the heap was created growable (maximum 0)

use std::collections::BTreeMap;

use bitflags::bitflags;
use log::{trace, warn};

use super::{align_up, page_span, GuestAddr};
use crate::error::{KernelResult, Win32Error};
use crate::object::Handle;
use crate::traits::GuestMemory;

/// Allocation granularity of heap blocks
pub const HEAP_GRANULARITY: u32 = 8;

bitflags! {
    /// `HEAP_*` flags accepted by heap creation and allocation calls
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        const NO_SERIALIZE = 0x0000_0001;
        const GROWABLE = 0x0000_0002;
        const GENERATE_EXCEPTIONS = 0x0000_0004;
        const ZERO_MEMORY = 0x0000_0008;
        const REALLOC_IN_PLACE_ONLY = 0x0000_0010;
        const CREATE_ENABLE_EXECUTE = 0x0004_0000;
    }
}

/// A committed page region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: GuestAddr,
    pub size: u32,
}

impl Region {
    fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    fn contains(&self, addr: GuestAddr) -> bool {
        addr >= self.base && u64::from(addr) < self.end()
    }
}

/// An allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    /// Granular size reserved for the block
    size: u32,
    /// Size the guest asked for (reported by `HeapSize`)
    requested: u32,
}

/// Emulated Win32 heap
#[derive(Debug)]
pub struct Heap {
    /// Process the heap belongs to
    owner: Handle,
    /// Creation flags
    flags: HeapFlags,
    /// Upper bound on committed bytes (0 = unbounded)
    maximum: u32,
    /// Minimum growth step
    growth: u32,
    /// Committed regions in commit order
    regions: Vec<Region>,
    /// Free blocks: address -> size
    free: BTreeMap<GuestAddr, u32>,
    /// Allocated blocks keyed by payload address
    used: BTreeMap<GuestAddr, Block>,
}

fn block_size(size: u32) -> Result<u32, Win32Error> {
    align_up(size.max(1), HEAP_GRANULARITY).ok_or(Win32Error::NotEnoughMemory)
}

impl Heap {
    /// Create a heap and commit its initial region
    ///
    /// Both sizes are rounded up to page granularity with a one-page
    /// minimum; a maximum below the initial size is raised to it.
    pub fn create(
        memory: &mut dyn GuestMemory,
        owner: Handle,
        flags: HeapFlags,
        initial: u32,
        maximum: u32,
        growth: u32,
    ) -> Result<Self, Win32Error> {
        let initial = page_span(initial).ok_or(Win32Error::InvalidParameter)?;
        let maximum = match maximum {
            0 => 0,
            max => page_span(max).ok_or(Win32Error::InvalidParameter)?.max(initial),
        };
        let base = memory.alloc_pages(initial).ok_or(Win32Error::NotEnoughMemory)?;

        let mut heap = Self {
            owner,
            flags,
            maximum,
            growth: page_span(growth).unwrap_or(initial),
            regions: vec![Region { base, size: initial }],
            free: BTreeMap::new(),
            used: BTreeMap::new(),
        };
        heap.free.insert(base, initial);
        trace!("heap created at {:#010x}: {:#x} bytes committed, max {:#x}", base, initial, maximum);
        Ok(heap)
    }

    pub fn owner(&self) -> Handle {
        self.owner
    }

    pub fn flags(&self) -> HeapFlags {
        self.flags
    }

    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Total committed bytes
    pub fn committed(&self) -> u32 {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// Bytes currently reserved by allocated blocks
    pub fn allocated(&self) -> u32 {
        self.used.values().map(|b| b.size).sum()
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.used.len()
    }

    /// Whether `addr` lies inside one of the heap's regions
    pub fn contains(&self, addr: GuestAddr) -> bool {
        self.region_of(addr).is_some()
    }

    /// Whether `addr` is the start of a live allocation
    pub fn is_allocated(&self, addr: GuestAddr) -> bool {
        self.used.contains_key(&addr)
    }

    fn region_of(&self, addr: GuestAddr) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(addr))
    }

    /// Allocate `size` bytes, growing the heap when no free block fits
    pub fn allocate(&mut self, memory: &mut dyn GuestMemory, size: u32, flags: HeapFlags) -> KernelResult<GuestAddr> {
        let needed = block_size(size)?;
        let addr = match self.take_free(needed) {
            Some(addr) => addr,
            None => {
                self.grow(memory, needed)?;
                self.take_free(needed).ok_or(Win32Error::NotEnoughMemory)?
            }
        };
        self.used.insert(addr, Block { size: needed, requested: size });
        if flags.contains(HeapFlags::ZERO_MEMORY) {
            memory.fill(addr, 0, needed)?;
        }
        Ok(addr)
    }

    /// Return a block to the free list
    ///
    /// An address that is not the start of a live block is reported and
    /// rejected without touching heap state.
    pub fn free(&mut self, addr: GuestAddr) -> Result<(), Win32Error> {
        let Some(block) = self.used.remove(&addr) else {
            warn!("heap free of {:#010x}: not an allocated block", addr);
            return Err(Win32Error::InvalidParameter);
        };
        self.insert_free(addr, block.size);
        Ok(())
    }

    /// Size requested for the block at `addr`
    pub fn size_of(&self, addr: GuestAddr) -> Result<u32, Win32Error> {
        self.used.get(&addr).map(|b| b.requested).ok_or(Win32Error::InvalidParameter)
    }

    /// Resize a block, moving it unless `REALLOC_IN_PLACE_ONLY` is given
    pub fn reallocate(
        &mut self,
        memory: &mut dyn GuestMemory,
        addr: GuestAddr,
        size: u32,
        flags: HeapFlags,
    ) -> KernelResult<GuestAddr> {
        let block = *self.used.get(&addr).ok_or(Win32Error::InvalidParameter)?;
        let needed = block_size(size)?;
        let zero = flags.contains(HeapFlags::ZERO_MEMORY);

        if needed <= block.size {
            if block.size > needed {
                self.insert_free(addr + needed, block.size - needed);
            }
            self.used.insert(addr, Block { size: needed, requested: size });
            if zero && size > block.requested {
                memory.fill(addr + block.requested, 0, size - block.requested)?;
            }
            return Ok(addr);
        }

        let end = addr + block.size;
        if let Some(&next) = self.free.get(&end) {
            let same_region = self.region_of(addr) == self.region_of(end);
            if same_region && block.size + next >= needed {
                self.free.remove(&end);
                let total = block.size + next;
                if total > needed {
                    self.free.insert(addr + needed, total - needed);
                }
                self.used.insert(addr, Block { size: needed, requested: size });
                if zero {
                    memory.fill(addr + block.requested, 0, size - block.requested)?;
                }
                return Ok(addr);
            }
        }

        if flags.contains(HeapFlags::REALLOC_IN_PLACE_ONLY) {
            return Err(Win32Error::NotEnoughMemory.into());
        }

        let moved = self.allocate(memory, size, flags & HeapFlags::ZERO_MEMORY)?;
        let mut payload = vec![0u8; block.requested.min(size) as usize];
        memory.read_bytes(addr, &mut payload)?;
        memory.write_bytes(moved, &payload)?;
        self.used.remove(&addr);
        self.insert_free(addr, block.size);
        Ok(moved)
    }

    /// Structural consistency check
    ///
    /// Free and allocated blocks must tile every region exactly. With an
    /// address, that address must also be a live allocation.
    pub fn validate(&self, addr: Option<GuestAddr>) -> bool {
        if let Some(addr) = addr {
            if !self.used.contains_key(&addr) {
                return false;
            }
        }

        let mut spans: Vec<(u64, u64)> = self
            .free
            .iter()
            .map(|(&a, &len)| (u64::from(a), u64::from(len)))
            .chain(self.used.iter().map(|(&a, b)| (u64::from(a), u64::from(b.size))))
            .collect();
        spans.sort_unstable();

        let mut regions = self.regions.clone();
        regions.sort_by_key(|r| r.base);

        let mut spans = spans.into_iter();
        for region in &regions {
            let mut cursor = u64::from(region.base);
            while cursor < region.end() {
                match spans.next() {
                    Some((start, len)) if start == cursor && len > 0 => cursor += len,
                    _ => return false,
                }
            }
            if cursor != region.end() {
                return false;
            }
        }
        spans.next().is_none()
    }

    /// Release every region back to the memory service
    pub fn destroy(self, memory: &mut dyn GuestMemory) {
        for region in &self.regions {
            if !memory.free_pages(region.base) {
                warn!("heap region {:#010x} was already released", region.base);
            }
        }
    }

    fn take_free(&mut self, needed: u32) -> Option<GuestAddr> {
        let (&addr, &len) = self.free.iter().find(|&(_, &len)| len >= needed)?;
        self.free.remove(&addr);
        if len > needed {
            self.free.insert(addr + needed, len - needed);
        }
        Some(addr)
    }

    fn grow(&mut self, memory: &mut dyn GuestMemory, needed: u32) -> Result<(), Win32Error> {
        let minimum = page_span(needed).ok_or(Win32Error::NotEnoughMemory)?;
        let mut size = minimum.max(self.growth);
        if self.maximum != 0 {
            let room = self.maximum.saturating_sub(self.committed());
            if minimum > room {
                return Err(Win32Error::NotEnoughMemory);
            }
            size = size.min(room);
        }
        let base = memory.alloc_pages(size).ok_or(Win32Error::NotEnoughMemory)?;
        trace!("heap grew by {:#x} bytes at {:#010x}", size, base);
        self.regions.push(Region { base, size });
        self.insert_free(base, size);
        Ok(())
    }

    fn insert_free(&mut self, mut addr: GuestAddr, mut len: u32) {
        let region = self.region_of(addr);

        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back() {
            if u64::from(prev) + u64::from(prev_len) == u64::from(addr) && self.region_of(prev) == region {
                self.free.remove(&prev);
                addr = prev;
                len += prev_len;
            }
        }

        let end = u64::from(addr) + u64::from(len);
        if end <= u64::from(u32::MAX) {
            let end = end as GuestAddr;
            if let Some(&next_len) = self.free.get(&end) {
                if self.region_of(end) == region {
                    self.free.remove(&end);
                    len += next_len;
                }
            }
        }

        self.free.insert(addr, len);
    }
}
