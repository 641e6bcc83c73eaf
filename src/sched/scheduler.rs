// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scheduler implementation
//!
//! Cooperative FIFO scheduler over thread objects stored in the object
//! table. The scheduler only tracks which thread runs and which are ready;
//! thread state lives in the thread objects themselves, so every operation
//! takes the table explicitly.

use log::trace;

use super::state::{RunQueue, ThreadState};
use crate::error::Win32Error;
use crate::object::{Handle, ObjectTable};

/// Scheduler
///
/// Manages the ready set and the running thread.
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Ready threads in run order
    run_queue: RunQueue,
    /// Thread whose registers live in the CPU
    ///
    /// Stays set after the thread blocks or terminates until the next
    /// switch, so its registers can still be saved.
    current: Option<Handle>,
    /// Context switches performed
    switches: u64,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the thread whose registers are loaded
    pub fn current(&self) -> Option<Handle> {
        self.current
    }

    /// Number of context switches so far
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Get the number of ready threads
    pub fn ready_count(&self) -> usize {
        self.run_queue.len()
    }

    /// Check if a thread is in the ready set
    pub fn is_ready(&self, thread: Handle) -> bool {
        self.run_queue.contains(thread)
    }

    /// Ready threads in run order
    pub fn ready_threads(&self) -> impl Iterator<Item = Handle> + '_ {
        self.run_queue.iter()
    }

    /// Admit a thread to the tail of the ready set
    ///
    /// A thread that is already queued or running is left alone. A thread
    /// with a non-zero suspend count is parked as blocked instead.
    pub fn add_thread(&mut self, objects: &mut ObjectTable, thread: Handle, was_blocked: bool) -> Result<(), Win32Error> {
        let t = objects.thread_mut(thread)?;
        match t.state {
            ThreadState::Terminated => return Err(Win32Error::InvalidHandle),
            ThreadState::Running => return Ok(()),
            ThreadState::Ready if self.run_queue.contains(thread) => return Ok(()),
            _ => {}
        }

        t.wait = None;
        if was_blocked {
            t.stats.wakeups += 1;
        }
        if t.suspend_count > 0 {
            t.state = ThreadState::Blocked;
            trace!("thread {} parked (suspend count {})", thread, t.suspend_count);
            return Ok(());
        }
        t.state = ThreadState::Ready;
        self.run_queue.enqueue(thread);
        Ok(())
    }

    /// Take a thread out of scheduling
    ///
    /// `blocking` marks it blocked (it may be admitted again later);
    /// otherwise it is terminated.
    pub fn remove_thread(&mut self, objects: &mut ObjectTable, thread: Handle, blocking: bool) -> Result<(), Win32Error> {
        let t = objects.thread_mut(thread)?;
        self.run_queue.remove(thread);
        t.state = if blocking { ThreadState::Blocked } else { ThreadState::Terminated };
        Ok(())
    }

    /// Move the running thread to the tail of the ready set
    pub fn yield_current(&mut self, objects: &mut ObjectTable) {
        let Some(current) = self.current else {
            return;
        };
        if let Ok(t) = objects.thread_mut(current) {
            if t.state == ThreadState::Running {
                t.state = ThreadState::Ready;
                self.run_queue.enqueue(current);
            }
        }
    }

    /// Choose the thread to run next
    ///
    /// The current thread keeps the CPU while it is still running.
    /// Otherwise the first ready thread becomes current. Returns `None`
    /// when nothing can run.
    pub fn pick_next(&mut self, objects: &mut ObjectTable) -> Option<Handle> {
        if let Some(current) = self.current {
            if objects.thread(current).is_ok_and(|t| t.state == ThreadState::Running) {
                return Some(current);
            }
        }

        while let Some(next) = self.run_queue.dequeue() {
            let Ok(t) = objects.thread_mut(next) else {
                continue;
            };
            if t.state != ThreadState::Ready {
                continue;
            }
            t.state = ThreadState::Running;
            t.stats.scheduled += 1;
            if self.current != Some(next) {
                self.switches += 1;
                trace!("switch {:?} -> {}", self.current, next);
            }
            self.current = Some(next);
            return Some(next);
        }

        self.current = None;
        None
    }
}
