// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization primitives
//!
//! Built on the object table and the scheduler. No host locking is needed:
//! only one guest thread runs at a time and every state change happens in a
//! host call.
//!
//! # Modules
//!
//! - [`wait_object`] - Events, mutexes, semaphores and critical-section backing
//! - [`critical_section`] - Critical sections over guest records
//! - [`wait`] - Blocking, waking, timeouts and sleeps

pub mod critical_section;
pub mod wait;
pub mod wait_object;

pub use critical_section::{CriticalSectionRecord, CRITICAL_SECTION_SIZE};
pub use wait_object::{WaitKind, WaitObject, INFINITE, WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};

/// Result of a call that may block the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Finished without blocking, with this status
    Complete(u32),
    /// The caller is blocked; its waker supplies the status
    Blocked,
}
