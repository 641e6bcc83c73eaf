// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Memory Management
//!
//! Page-granularity helpers shared by every component that commits guest
//! memory, plus the two allocators the kernel owns.
//!
//! # Modules
//!
//! - [`memory`] - Flat guest address space with a region allocator
//! - [`heap`] - Win32 heap emulation over committed regions
//! - [`virtual_alloc`] - `VirtualAlloc` regions per process

pub mod heap;
pub mod memory;
pub mod virtual_alloc;

use x86_64::structures::paging::{PageSize, Size4KiB};

/// Guest virtual address (32-bit guest)
pub type GuestAddr = u32;

/// Page size of the guest address space
pub const PAGE_SIZE: u32 = Size4KiB::SIZE as u32;

/// Page size shift
pub const PAGE_SIZE_SHIFT: u32 = 12;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Check if an address is page aligned
pub const fn is_page_aligned(addr: GuestAddr) -> bool {
    addr & PAGE_MASK == 0
}

/// Round `value` up to a multiple of `align` (a power of two)
///
/// Returns `None` when the result does not fit the 32-bit address space.
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    u32::try_from(x86_64::align_up(u64::from(value), u64::from(align))).ok()
}

/// Round a size up to page granularity
pub fn align_page_up(size: u32) -> Option<u32> {
    align_up(size, PAGE_SIZE)
}

/// Round an address down to its page base
pub fn align_page_down(addr: GuestAddr) -> GuestAddr {
    x86_64::align_down(u64::from(addr), u64::from(PAGE_SIZE)) as GuestAddr
}

/// Page-rounded size with a one-page minimum
pub fn page_span(size: u32) -> Option<u32> {
    align_page_up(size.max(1))
}
