// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread state and run queue
//!
//! Defines thread states and the ordered ready set.

use std::collections::VecDeque;

use crate::object::Handle;

/// Thread states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is ready to run
    Ready,
    /// Thread is currently running
    Running,
    /// Thread is blocked (waiting on an object, sleeping or suspended)
    Blocked,
    /// Thread has terminated
    Terminated,
}

impl ThreadState {
    /// Whether the thread has not terminated yet
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

/// Run queue
///
/// FIFO of ready threads. A thread appears at most once.
#[derive(Debug, Default)]
pub struct RunQueue {
    queue: VecDeque<Handle>,
}

impl RunQueue {
    /// Create a new empty run queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a thread at the tail
    pub fn enqueue(&mut self, thread: Handle) {
        if !self.contains(thread) {
            self.queue.push_back(thread);
        }
    }

    /// Remove the thread at the head
    pub fn dequeue(&mut self) -> Option<Handle> {
        self.queue.pop_front()
    }

    /// Remove a specific thread
    pub fn remove(&mut self, thread: Handle) -> bool {
        match self.queue.iter().position(|&queued| queued == thread) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Check if a thread is queued
    pub fn contains(&self, thread: Handle) -> bool {
        self.queue.contains(&thread)
    }

    /// Get the number of queued threads
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the run queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Iterate in run order
    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.queue.iter().copied()
    }
}
