// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Wait objects
//!
//! Host-side blocking primitive with a FIFO queue of blocked threads. The
//! same type backs events, mutexes, semaphores and guest critical sections.
//!
//! # Design
//!
//! - **Acquire on wake**: a woken waiter has already been granted the
//!   object, so wakes never race with newcomers
//! - **FIFO**: waiters are granted in arrival order; the scan stops at the
//!   first waiter that cannot be satisfied
//! - **Critical sections**: ownership lives in the guest record, so the
//!   backing object only holds the queue and is not waitable directly

use std::collections::VecDeque;

use crate::error::Win32Error;
use crate::mm::GuestAddr;
use crate::object::Handle;

/// Wait satisfied
pub const WAIT_OBJECT_0: u32 = 0x0000_0000;

/// Wait satisfied by a mutex whose owner terminated while holding it
pub const WAIT_ABANDONED: u32 = 0x0000_0080;

/// Wait timed out
pub const WAIT_TIMEOUT: u32 = 0x0000_0102;

/// Wait failed
pub const WAIT_FAILED: u32 = 0xFFFF_FFFF;

/// Timeout that never expires
pub const INFINITE: u32 = 0xFFFF_FFFF;

/// Flavor of a wait object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Backing object of the critical-section record at `record`
    CriticalSection { record: GuestAddr },

    /// Event; manual-reset events stay signaled until reset
    Event { manual_reset: bool, signaled: bool },

    /// Recursive mutex
    Mutex {
        owner: Option<Handle>,
        recursion: u32,
        /// Last owner terminated while holding it
        abandoned: bool,
    },

    /// Counting semaphore
    Semaphore { count: u32, maximum: u32 },
}

/// Wait object
#[derive(Debug)]
pub struct WaitObject {
    /// Kind-specific state
    pub kind: WaitKind,

    /// Blocked threads in arrival order
    pub queue: VecDeque<Handle>,
}

impl WaitObject {
    fn with_kind(kind: WaitKind) -> Self {
        Self { kind, queue: VecDeque::new() }
    }

    /// Create an event
    pub fn event(manual_reset: bool, initial_state: bool) -> Self {
        Self::with_kind(WaitKind::Event { manual_reset, signaled: initial_state })
    }

    /// Create a mutex, optionally owned by `owner`
    pub fn mutex(owner: Option<Handle>) -> Self {
        Self::with_kind(WaitKind::Mutex {
            owner,
            recursion: u32::from(owner.is_some()),
            abandoned: false,
        })
    }

    /// Create a semaphore
    pub fn semaphore(initial: u32, maximum: u32) -> Result<Self, Win32Error> {
        if maximum == 0 || initial > maximum {
            return Err(Win32Error::InvalidParameter);
        }
        Ok(Self::with_kind(WaitKind::Semaphore { count: initial, maximum }))
    }

    /// Create the backing object of a critical section
    pub fn critical_section(record: GuestAddr) -> Self {
        Self::with_kind(WaitKind::CriticalSection { record })
    }

    /// Whether `WaitForSingleObject` accepts this object
    pub fn is_waitable(&self) -> bool {
        !matches!(self.kind, WaitKind::CriticalSection { .. })
    }

    /// Check if this backs a critical section
    pub fn is_critical_section(&self) -> bool {
        !self.is_waitable()
    }

    /// Whether a wait by some thread would be satisfied right now
    pub fn is_signaled(&self) -> bool {
        match self.kind {
            WaitKind::CriticalSection { .. } => false,
            WaitKind::Event { signaled, .. } => signaled,
            WaitKind::Mutex { owner, .. } => owner.is_none(),
            WaitKind::Semaphore { count, .. } => count > 0,
        }
    }

    /// Try to satisfy a wait by `thread`, consuming the signal
    ///
    /// # Returns
    /// * `Some(status)` with the wait status the thread observes
    /// * `None` if the thread has to block
    pub fn try_acquire(&mut self, thread: Handle) -> Option<u32> {
        match &mut self.kind {
            WaitKind::CriticalSection { .. } => None,
            WaitKind::Event { manual_reset, signaled } => {
                if !*signaled {
                    return None;
                }
                if !*manual_reset {
                    *signaled = false;
                }
                Some(WAIT_OBJECT_0)
            }
            WaitKind::Mutex { owner, recursion, abandoned } => match *owner {
                None => {
                    *owner = Some(thread);
                    *recursion = 1;
                    if core::mem::take(abandoned) {
                        Some(WAIT_ABANDONED)
                    } else {
                        Some(WAIT_OBJECT_0)
                    }
                }
                Some(current) if current == thread => {
                    *recursion += 1;
                    Some(WAIT_OBJECT_0)
                }
                Some(_) => None,
            },
            WaitKind::Semaphore { count, .. } => {
                if *count == 0 {
                    return None;
                }
                *count -= 1;
                Some(WAIT_OBJECT_0)
            }
        }
    }

    /// Grant the object to queued waiters in FIFO order
    ///
    /// Returns the threads to wake together with their wait status.
    pub fn release_waiters(&mut self) -> Vec<(Handle, u32)> {
        let mut woken = Vec::new();
        while let Some(&head) = self.queue.front() {
            let Some(status) = self.try_acquire(head) else {
                break;
            };
            self.queue.pop_front();
            woken.push((head, status));
        }
        woken
    }

    /// Remove a thread from the queue
    pub fn cancel(&mut self, thread: Handle) -> bool {
        let before = self.queue.len();
        self.queue.retain(|&queued| queued != thread);
        self.queue.len() != before
    }

    /// Signal an event
    pub fn set_event(&mut self) -> Result<(), Win32Error> {
        match &mut self.kind {
            WaitKind::Event { signaled, .. } => {
                *signaled = true;
                Ok(())
            }
            _ => Err(Win32Error::InvalidHandle),
        }
    }

    /// Clear an event
    pub fn reset_event(&mut self) -> Result<(), Win32Error> {
        match &mut self.kind {
            WaitKind::Event { signaled, .. } => {
                *signaled = false;
                Ok(())
            }
            _ => Err(Win32Error::InvalidHandle),
        }
    }

    /// Drop one level of ownership of a mutex held by `thread`
    pub fn release_mutex(&mut self, thread: Handle) -> Result<(), Win32Error> {
        match &mut self.kind {
            WaitKind::Mutex { owner, recursion, .. } => {
                if *owner != Some(thread) {
                    return Err(Win32Error::NotOwner);
                }
                *recursion -= 1;
                if *recursion == 0 {
                    *owner = None;
                }
                Ok(())
            }
            _ => Err(Win32Error::InvalidHandle),
        }
    }

    /// Release a mutex whose owner terminated
    pub fn abandon(&mut self, thread: Handle) -> bool {
        match &mut self.kind {
            WaitKind::Mutex { owner, recursion, abandoned } if *owner == Some(thread) => {
                *owner = None;
                *recursion = 0;
                *abandoned = true;
                true
            }
            _ => false,
        }
    }

    /// Add `release` to a semaphore's count, returning the previous count
    pub fn release_semaphore(&mut self, release: u32) -> Result<u32, Win32Error> {
        match &mut self.kind {
            WaitKind::Semaphore { count, maximum } => {
                if release == 0 {
                    return Err(Win32Error::InvalidParameter);
                }
                let previous = *count;
                match previous.checked_add(release) {
                    Some(next) if next <= *maximum => {
                        *count = next;
                        Ok(previous)
                    }
                    _ => Err(Win32Error::TooManyPosts),
                }
            }
            _ => Err(Win32Error::InvalidHandle),
        }
    }

    /// Check if the object is a mutex held by `thread`
    pub fn is_owned_by(&self, thread: Handle) -> bool {
        matches!(self.kind, WaitKind::Mutex { owner: Some(owner), .. } if owner == thread)
    }
}
