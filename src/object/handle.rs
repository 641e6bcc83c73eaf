// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Handle Model
//!
//! Handles are the guest's only way to name a kernel object. They are plain
//! 32-bit values with a few reserved sentinels.
//!
//! # Reserved values
//!
//! - `0`: never a valid handle
//! - `0xFFFFFFFF`: current process (also `INVALID_HANDLE_VALUE`)
//! - `0xFFFFFFFE`: current thread
//! - `1`, `2`, `3`: standard output, input and error

use core::fmt;

/// ============================================================================
/// Handle
/// ============================================================================

/// Guest-visible handle value
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Invalid handle
    pub const NULL: Self = Self(0);

    /// Pseudo-handle of the calling process
    pub const CURRENT_PROCESS: Self = Self(0xFFFF_FFFF);

    /// `INVALID_HANDLE_VALUE` shares its value with the process pseudo-handle
    pub const INVALID: Self = Self::CURRENT_PROCESS;

    /// Pseudo-handle of the calling thread
    pub const CURRENT_THREAD: Self = Self(0xFFFF_FFFE);

    /// Standard output
    pub const STD_OUTPUT: Self = Self(1);

    /// Standard input
    pub const STD_INPUT: Self = Self(2);

    /// Standard error
    pub const STD_ERROR: Self = Self(3);

    /// Create from raw value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get raw value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this is the null handle
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this is one of the current-process/thread pseudo-handles
    pub const fn is_pseudo(self) -> bool {
        self.0 == Self::CURRENT_PROCESS.0 || self.0 == Self::CURRENT_THREAD.0
    }

    /// Check if this is one of the reserved standard handles
    pub const fn is_standard(self) -> bool {
        matches!(self.0, 1..=3)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// ============================================================================
/// Object Types
/// ============================================================================

/// Kernel object type
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Process object
    Process = 1,

    /// Thread object
    Thread = 2,

    /// Event, mutex, semaphore or critical-section backing object
    WaitObject = 3,

    /// Section object created by `CreateFileMapping`
    FileMapping = 4,

    /// Heap created by `HeapCreate` or a process default heap
    Heap = 5,

    /// Character device behind a standard handle
    File = 6,
}

impl ObjectType {
    /// Get raw value
    pub const fn into_raw(self) -> u32 {
        self as u32
    }

    /// Get the type name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Process => "Process",
            Self::Thread => "Thread",
            Self::WaitObject => "WaitObject",
            Self::FileMapping => "FileMapping",
            Self::Heap => "Heap",
            Self::File => "File",
        }
    }

    /// Whether closing the last reference removes the table entry at once
    ///
    /// Processes and threads leave the table through their lifecycle instead.
    pub const fn removed_on_last_close(self) -> bool {
        !matches!(self, Self::Process | Self::Thread)
    }
}
