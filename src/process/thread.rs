// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Guest threads
//!
//! A thread is a saved x86 register file plus the kernel-side state the
//! Win32 API exposes: last error, TLS values, wait state and exit code.
//! Its id is the raw value of its handle.

use std::collections::{BTreeMap, VecDeque};

use x86_64::registers::rflags::RFlags;

use crate::mm::GuestAddr;
use crate::object::Handle;
use crate::sched::ThreadState;

/// Exit code reported while a thread or process is still running
pub const STILL_ACTIVE: u32 = 259;

/// EFLAGS bit 1 always reads as set
const EFLAGS_RESERVED: u32 = 0x2;

/// Initial EFLAGS of a new thread: interrupts enabled
pub const INITIAL_EFLAGS: u32 = RFlags::INTERRUPT_FLAG.bits() as u32 | EFLAGS_RESERVED;

/// ============================================================================
/// Register File
/// ============================================================================

/// Saved 32-bit general purpose register file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
}

impl Registers {
    /// Register file for a thread about to start at `entry`
    pub fn for_entry(entry: GuestAddr, esp: GuestAddr) -> Self {
        Self {
            esp,
            ebp: esp,
            eip: entry,
            eflags: INITIAL_EFLAGS,
            ..Self::default()
        }
    }
}

/// Committed stack region of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest address
    pub base: GuestAddr,
    /// Size in bytes
    pub size: u32,
}

impl StackRegion {
    /// One past the highest address
    pub fn top(&self) -> GuestAddr {
        self.base.wrapping_add(self.size)
    }
}

/// What a blocked thread is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitState {
    /// Queue the thread sits in (`None` for a plain sleep)
    pub object: Option<Handle>,
    /// Clock value at which the wait times out (`None` waits forever)
    pub deadline: Option<u64>,
}

/// Scheduling statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Times the thread was given the CPU
    pub scheduled: u64,
    /// Times the thread blocked
    pub waits: u64,
    /// Times the thread was woken from a block
    pub wakeups: u64,
    /// Waits that ended by timeout
    pub timeouts: u64,
}

/// ============================================================================
/// Thread
/// ============================================================================

/// Guest thread
#[derive(Debug)]
pub struct Thread {
    /// Owning process
    pub process: Handle,

    /// Run state
    pub state: ThreadState,

    /// Registers saved while the thread is not running
    pub regs: Registers,

    /// Stack committed for the thread
    pub stack: StackRegion,

    /// Start address
    pub entry: GuestAddr,

    /// Argument handed to the start routine
    pub parameter: u32,

    /// TLS values by slot; unset slots read as zero
    pub tls: BTreeMap<u32, u32>,

    /// `GetLastError` cell
    pub last_error: u32,

    /// Exit code (`STILL_ACTIVE` until the thread terminates)
    pub exit_code: u32,

    /// Current wait, if blocked on an object or a timer
    pub wait: Option<WaitState>,

    /// `SuspendThread` nesting
    pub suspend_count: u32,

    /// Threads waiting for this one to terminate
    pub waiters: VecDeque<Handle>,

    /// Scheduling statistics
    pub stats: ThreadStats,
}

impl Thread {
    /// Create a thread that has not been admitted to the scheduler yet
    pub fn new(process: Handle, entry: GuestAddr, parameter: u32, stack: StackRegion) -> Self {
        Self {
            process,
            state: ThreadState::Blocked,
            regs: Registers::for_entry(entry, stack.top()),
            stack,
            entry,
            parameter,
            tls: BTreeMap::new(),
            last_error: 0,
            exit_code: STILL_ACTIVE,
            wait: None,
            suspend_count: 0,
            waiters: VecDeque::new(),
            stats: ThreadStats::default(),
        }
    }

    /// Check if the thread has terminated
    pub fn is_terminated(&self) -> bool {
        self.state == ThreadState::Terminated
    }

    /// Read a TLS slot
    pub fn tls_value(&self, slot: u32) -> u32 {
        self.tls.get(&slot).copied().unwrap_or(0)
    }

    /// Write a TLS slot
    pub fn set_tls_value(&mut self, slot: u32, value: u32) {
        if value == 0 {
            self.tls.remove(&slot);
        } else {
            self.tls.insert(slot, value);
        }
    }
}
