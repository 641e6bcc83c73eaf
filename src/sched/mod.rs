// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scheduler and execution context
//!
//! One guest thread runs at a time. Threads move between states only at
//! yield points:
//!
//! ```text
//! Ready -> Running -> Blocked -> Ready
//!                  \-> Terminated
//! ```
//!
//! The pair of current process and thread is never stored globally; it is
//! projected from the scheduler as an [`ExecutionContext`] and handed to
//! the operations that need it.

pub mod scheduler;
pub mod state;

pub use scheduler::Scheduler;
pub use state::{RunQueue, ThreadState};

use crate::object::Handle;

/// Current process and thread as seen by a host call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Process owning the running thread
    pub process: Handle,
    /// Running thread
    pub thread: Handle,
}
