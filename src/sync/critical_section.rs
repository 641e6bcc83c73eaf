// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Critical sections
//!
//! A critical section is a 24-byte record in guest memory backed by a wait
//! object in the handle table. Ownership and counts live in the record so
//! guest code and debuggers see the usual layout; the backing object only
//! queues blocked entrants.
//!
//! # Record layout
//!
//! | Offset | Field                          |
//! |--------|--------------------------------|
//! | 0      | backing wait object handle     |
//! | 4      | entrant count (`i32`, -1 free) |
//! | 8      | recursion count                |
//! | 12     | owning thread id               |
//! | 16     | reserved                       |
//! | 20     | spin count                     |
//!
//! # Hand-off
//!
//! The last `leave` of the owner passes the section to the first queued
//! thread with a recursion count of 1 and wakes it.

use log::{trace, warn};

use super::wait_object::WaitObject;
use super::WaitOutcome;
use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::mm::GuestAddr;
use crate::object::{Handle, KernelObject};

/// Size of a critical-section record
pub const CRITICAL_SECTION_SIZE: u32 = 24;

const CS_HANDLE: u32 = 0;
const CS_LOCK_COUNT: u32 = 4;
const CS_RECURSION: u32 = 8;
const CS_OWNER: u32 = 12;
const CS_RESERVED: u32 = 16;
const CS_SPIN_COUNT: u32 = 20;

/// Entrant count of a free section
const LOCK_COUNT_FREE: i32 = -1;

/// Host view of a critical-section record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalSectionRecord {
    pub handle: Handle,
    pub lock_count: i32,
    pub recursion: u32,
    pub owner: u32,
    pub reserved: u32,
    pub spin_count: u32,
}

impl Kernel {
    /// Read a critical-section record
    pub fn read_critical_section(&self, record: GuestAddr) -> KernelResult<CriticalSectionRecord> {
        let mem = self.memory.as_ref();
        Ok(CriticalSectionRecord {
            handle: Handle::from_raw(mem.read_u32(record + CS_HANDLE)?),
            lock_count: mem.read_u32(record + CS_LOCK_COUNT)? as i32,
            recursion: mem.read_u32(record + CS_RECURSION)?,
            owner: mem.read_u32(record + CS_OWNER)?,
            reserved: mem.read_u32(record + CS_RESERVED)?,
            spin_count: mem.read_u32(record + CS_SPIN_COUNT)?,
        })
    }

    /// `InitializeCriticalSection(AndSpinCount)`
    pub fn initialize_critical_section(&mut self, record: GuestAddr, spin_count: u32) -> KernelResult<Handle> {
        let (handle, _) = self
            .objects
            .create(KernelObject::WaitObject(WaitObject::critical_section(record)), None)?;
        let mem = self.memory.as_mut();
        mem.write_u32(record + CS_HANDLE, handle.raw())?;
        mem.write_u32(record + CS_LOCK_COUNT, LOCK_COUNT_FREE as u32)?;
        mem.write_u32(record + CS_RECURSION, 0)?;
        mem.write_u32(record + CS_OWNER, 0)?;
        mem.write_u32(record + CS_RESERVED, 0)?;
        mem.write_u32(record + CS_SPIN_COUNT, spin_count)?;
        trace!("critical section {:#010x} backed by {}", record, handle);
        Ok(handle)
    }

    /// Backing object of a record, initializing the record if it has none
    fn critical_section_backing(&mut self, record: GuestAddr) -> KernelResult<Handle> {
        let handle = Handle::from_raw(self.memory.read_u32(record + CS_HANDLE)?);
        if self.objects.wait_object(handle).is_ok_and(WaitObject::is_critical_section) {
            return Ok(handle);
        }
        warn!("critical section {:#010x} used before initialization", record);
        self.initialize_critical_section(record, 0)
    }

    pub(crate) fn adjust_entrant_count(&mut self, record: GuestAddr, delta: i32) -> KernelResult<i32> {
        let count = (self.memory.read_u32(record + CS_LOCK_COUNT)? as i32).wrapping_add(delta);
        self.memory.write_u32(record + CS_LOCK_COUNT, count as u32)?;
        Ok(count)
    }

    /// `EnterCriticalSection` for the current thread
    pub fn enter_critical_section(&mut self, record: GuestAddr) -> KernelResult<WaitOutcome> {
        let ctx = self.current_context()?;
        let backing = self.critical_section_backing(record)?;
        let me = ctx.thread.raw();

        self.adjust_entrant_count(record, 1)?;
        let owner = self.memory.read_u32(record + CS_OWNER)?;
        if owner == 0 {
            self.memory.write_u32(record + CS_OWNER, me)?;
            self.memory.write_u32(record + CS_RECURSION, 1)?;
            return Ok(WaitOutcome::Complete(0));
        }
        if owner == me {
            let recursion = self.memory.read_u32(record + CS_RECURSION)?;
            self.memory.write_u32(record + CS_RECURSION, recursion.wrapping_add(1))?;
            return Ok(WaitOutcome::Complete(0));
        }

        self.objects.wait_object_mut(backing)?.queue.push_back(ctx.thread);
        self.block_thread(ctx.thread, Some(backing), super::wait_object::INFINITE)?;
        Ok(WaitOutcome::Blocked)
    }

    /// `TryEnterCriticalSection` for the current thread
    pub fn try_enter_critical_section(&mut self, record: GuestAddr) -> KernelResult<bool> {
        let ctx = self.current_context()?;
        self.critical_section_backing(record)?;
        let me = ctx.thread.raw();

        let owner = self.memory.read_u32(record + CS_OWNER)?;
        if owner != 0 && owner != me {
            return Ok(false);
        }
        self.adjust_entrant_count(record, 1)?;
        let recursion = if owner == 0 { 1 } else { self.memory.read_u32(record + CS_RECURSION)?.wrapping_add(1) };
        self.memory.write_u32(record + CS_OWNER, me)?;
        self.memory.write_u32(record + CS_RECURSION, recursion)?;
        Ok(true)
    }

    /// `LeaveCriticalSection` for the current thread
    pub fn leave_critical_section(&mut self, record: GuestAddr) -> KernelResult<()> {
        let ctx = self.current_context()?;
        let me = ctx.thread.raw();
        let owner = self.memory.read_u32(record + CS_OWNER)?;
        if owner != me {
            warn!("thread {} left critical section {:#010x} owned by {:#x}", ctx.thread, record, owner);
            return Ok(());
        }

        self.adjust_entrant_count(record, -1)?;
        let recursion = self.memory.read_u32(record + CS_RECURSION)?.saturating_sub(1);
        self.memory.write_u32(record + CS_RECURSION, recursion)?;
        if recursion > 0 {
            return Ok(());
        }

        let backing = Handle::from_raw(self.memory.read_u32(record + CS_HANDLE)?);
        let next = self.objects.wait_object_mut(backing).ok().and_then(|w| w.queue.pop_front());
        match next {
            Some(next) => {
                self.memory.write_u32(record + CS_OWNER, next.raw())?;
                self.memory.write_u32(record + CS_RECURSION, 1)?;
                trace!("critical section {:#010x} handed to {}", record, next);
                self.wake(next, 0)
            }
            None => {
                self.memory.write_u32(record + CS_OWNER, 0)?;
                self.memory.write_u32(record + CS_RECURSION, 0)?;
                Ok(())
            }
        }
    }

    /// `DeleteCriticalSection`
    ///
    /// Entrants still queued stay blocked; see [`Kernel::orphan_waiters`].
    pub fn delete_critical_section(&mut self, record: GuestAddr) -> KernelResult<()> {
        let handle = Handle::from_raw(self.memory.read_u32(record + CS_HANDLE)?);
        if self.objects.wait_object(handle).is_ok_and(WaitObject::is_critical_section) {
            self.close_handle(handle)?;
        } else {
            warn!("deleting uninitialized critical section {:#010x}", record);
        }
        self.memory.write_u32(record + CS_HANDLE, 0)?;
        Ok(())
    }

    /// `SetCriticalSectionSpinCount`, returning the previous spin count
    pub fn set_critical_section_spin_count(&mut self, record: GuestAddr, spin_count: u32) -> KernelResult<u32> {
        let previous = self.memory.read_u32(record + CS_SPIN_COUNT)?;
        self.memory.write_u32(record + CS_SPIN_COUNT, spin_count)?;
        Ok(previous)
    }
}
