// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Blocking, waking and timeouts
//!
//! A blocked thread sits in exactly one queue: a wait object's, a thread's
//! joiner list or a process's joiner list. Sleeping threads sit in none and
//! only carry a deadline. Whoever wakes a thread writes its wait status into
//! the saved `eax`, since the blocking call already returned to the guest.
//! A thread whose wait object is destroyed under it is settled by
//! [`Kernel::orphan_waiters`].

use log::trace;

use super::wait_object::{WaitKind, WaitObject, INFINITE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use super::WaitOutcome;
use crate::error::{KernelResult, Win32Error};
use crate::kernel::Kernel;
use crate::object::{Handle, KernelObject};
use crate::process::thread::WaitState;
use crate::sched::ThreadState;

impl Kernel {
    /// Block `thread` on `object` (or on nothing, for a sleep)
    pub(crate) fn block_thread(&mut self, thread: Handle, object: Option<Handle>, timeout: u32) -> KernelResult<()> {
        let deadline = match timeout {
            INFINITE => None,
            ms => Some(self.clock.now_ms() + u64::from(ms)),
        };
        let t = self.objects.thread_mut(thread)?;
        t.wait = Some(WaitState { object, deadline });
        t.stats.waits += 1;
        self.scheduler.remove_thread(&mut self.objects, thread, true)?;
        trace!("thread {} blocked on {:?} until {:?}", thread, object, deadline);
        Ok(())
    }

    /// Resume a blocked thread with `status` as the result of its wait
    pub(crate) fn wake(&mut self, thread: Handle, status: u32) -> KernelResult<()> {
        let t = self.objects.thread_mut(thread)?;
        t.regs.eax = status;
        self.scheduler.add_thread(&mut self.objects, thread, true)?;
        trace!("thread {} woken with {:#x}", thread, status);
        Ok(())
    }

    /// Grant a wait object to its queued waiters
    pub(crate) fn signal_waiters(&mut self, handle: Handle) -> KernelResult<()> {
        let woken = self.objects.wait_object_mut(handle)?.release_waiters();
        for (thread, status) in woken {
            self.wake(thread, status)?;
        }
        Ok(())
    }

    /// Take a thread out of whatever queue it is waiting in
    pub(crate) fn cancel_wait(&mut self, thread: Handle) -> KernelResult<()> {
        let Some(wait) = self.objects.thread_mut(thread)?.wait.take() else {
            return Ok(());
        };
        let Some(object) = wait.object else {
            return Ok(());
        };

        let mut cs_record = None;
        match self.objects.lookup_mut(object) {
            Ok(KernelObject::WaitObject(w)) => {
                if w.cancel(thread) {
                    if let WaitKind::CriticalSection { record } = w.kind {
                        cs_record = Some(record);
                    }
                }
            }
            Ok(KernelObject::Thread(t)) => t.waiters.retain(|&h| h != thread),
            Ok(KernelObject::Process(p)) => p.waiters.retain(|&h| h != thread),
            _ => {}
        }

        // A cancelled entrant no longer counts towards the section
        if let Some(record) = cs_record {
            self.adjust_entrant_count(record, -1)?;
        }
        Ok(())
    }

    /// Settle the queue of a wait object that left the table
    ///
    /// Object waits fail with `WAIT_FAILED` and `ERROR_INVALID_HANDLE`.
    /// Critical-section entrants have no failure path; they stay blocked on
    /// nothing until the deadlock check reports them.
    pub(crate) fn orphan_waiters(&mut self, object: WaitObject) -> KernelResult<()> {
        let orphaned_entrants = object.is_critical_section();
        for thread in object.queue {
            let Ok(t) = self.objects.thread_mut(thread) else {
                continue;
            };
            if orphaned_entrants {
                t.wait = Some(WaitState { object: None, deadline: None });
                continue;
            }
            t.wait = None;
            t.last_error = Win32Error::InvalidHandle.code();
            self.wake(thread, WAIT_FAILED)?;
        }
        Ok(())
    }

    /// Wake every thread whose deadline has passed
    pub(crate) fn expire_timeouts(&mut self) -> KernelResult<()> {
        let now = self.clock.now_ms();
        let expired: Vec<(Handle, bool)> = self
            .objects
            .threads()
            .filter(|(_, t)| t.state == ThreadState::Blocked)
            .filter_map(|(h, t)| {
                let wait = t.wait?;
                wait.deadline.filter(|&d| d <= now).map(|_| (h, wait.object.is_some()))
            })
            .collect();

        for (thread, on_object) in expired {
            self.cancel_wait(thread)?;
            self.objects.thread_mut(thread)?.stats.timeouts += 1;
            self.wake(thread, if on_object { WAIT_TIMEOUT } else { 0 })?;
        }
        Ok(())
    }

    /// Wake every thread waiting for `target` (a thread or process) to end
    pub(crate) fn wake_joiners(&mut self, target: Handle) -> KernelResult<()> {
        let joiners: Vec<Handle> = match self.objects.lookup_mut(target)? {
            KernelObject::Thread(t) => t.waiters.drain(..).collect(),
            KernelObject::Process(p) => p.waiters.drain(..).collect(),
            _ => Vec::new(),
        };
        for joiner in joiners {
            self.wake(joiner, WAIT_OBJECT_0)?;
        }
        Ok(())
    }

    /// `WaitForSingleObject` for the current thread
    pub fn wait_for_single_object(&mut self, handle: Handle, timeout: u32) -> KernelResult<WaitOutcome> {
        let ctx = self.current_context()?;
        let target = self.resolve_pseudo(handle)?;

        let acquired = match self.objects.lookup_mut(target)? {
            KernelObject::WaitObject(w) => {
                if !w.is_waitable() {
                    return Err(Win32Error::InvalidHandle.into());
                }
                let status = w.try_acquire(ctx.thread);
                if status.is_none() && timeout != 0 {
                    w.queue.push_back(ctx.thread);
                }
                status
            }
            KernelObject::Thread(t) => {
                if t.is_terminated() {
                    Some(WAIT_OBJECT_0)
                } else {
                    if timeout != 0 {
                        t.waiters.push_back(ctx.thread);
                    }
                    None
                }
            }
            KernelObject::Process(p) => {
                if p.has_exited() {
                    Some(WAIT_OBJECT_0)
                } else {
                    if timeout != 0 {
                        p.waiters.push_back(ctx.thread);
                    }
                    None
                }
            }
            _ => return Err(Win32Error::InvalidHandle.into()),
        };

        match acquired {
            Some(status) => Ok(WaitOutcome::Complete(status)),
            None if timeout == 0 => Ok(WaitOutcome::Complete(WAIT_TIMEOUT)),
            None => {
                self.block_thread(ctx.thread, Some(target), timeout)?;
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    /// `Sleep` for the current thread; zero yields
    pub fn sleep(&mut self, milliseconds: u32) -> KernelResult<WaitOutcome> {
        let ctx = self.current_context()?;
        if milliseconds == 0 {
            self.scheduler.yield_current(&mut self.objects);
            return Ok(WaitOutcome::Complete(0));
        }
        self.block_thread(ctx.thread, None, milliseconds)?;
        Ok(WaitOutcome::Blocked)
    }
}
