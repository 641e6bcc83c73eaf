// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! TLS slot allocation
//!
//! Slot indices are process-wide; the values live in each thread.

/// `TlsAlloc` failure value
pub const TLS_OUT_OF_INDEXES: u32 = 0xFFFF_FFFF;

/// Per-process TLS slot bitmap
#[derive(Debug, Clone)]
pub struct TlsSlots {
    bitmap: Vec<u64>,
    capacity: u32,
}

impl TlsSlots {
    /// Create a bitmap with `capacity` free slots
    pub fn new(capacity: u32) -> Self {
        Self {
            bitmap: vec![0; capacity.div_ceil(64) as usize],
            capacity,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Claim the lowest free slot
    pub fn alloc(&mut self) -> Option<u32> {
        for (word_index, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            let slot = word_index as u32 * 64 + bit;
            if slot >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            return Some(slot);
        }
        None
    }

    /// Release a slot; false if it was not allocated
    pub fn free(&mut self, slot: u32) -> bool {
        if !self.is_allocated(slot) {
            return false;
        }
        self.bitmap[(slot / 64) as usize] &= !(1 << (slot % 64));
        true
    }

    /// Check if a slot is allocated
    pub fn is_allocated(&self, slot: u32) -> bool {
        slot < self.capacity && self.bitmap[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }
}
