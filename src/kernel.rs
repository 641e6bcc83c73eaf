// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel state
//!
//! [`Kernel`] owns the object table, the scheduler, the host callback
//! registry and the collaborators, and is the only surface the instruction
//! interpreter talks to.
//!
//! # Usage
//!
//! ```ignore
//! kernel.create_process("app.exe", "app.exe", &[], "C:\\")?;
//! kernel.start()?;
//! loop {
//!     let eip = kernel.cpu().eip;
//!     if kernel.is_host_address(eip) {
//!         kernel.invoke_host(eip)?;
//!     } else {
//!         interpreter.step(kernel.cpu_mut(), kernel.memory_mut());
//!     }
//!     if kernel.is_finished() {
//!         break;
//!     }
//! }
//! ```

use log::{debug, error, trace};

use crate::config::KernelConfig;
use crate::error::{Fault, KernelResult, Win32Error};
use crate::mm::GuestAddr;
use crate::object::{FileObject, Handle, KernelObject, ObjectTable, ViewRegistry};
use crate::process::thread::Registers;
use crate::process::trampoline::{CallbackRegistry, HostCallback};
use crate::sched::{ExecutionContext, Scheduler, ThreadState};
use crate::syscall;
use crate::traits::{Clock, Console, GuestMemory, HostClock, HostConsole, ImageLoader, ImportResolver, StdStream};

/// Handles returned by process creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    /// New process (its id is the raw value)
    pub process: Handle,
    /// Main thread (its id is the raw value)
    pub thread: Handle,
}

/// Emulated NT kernel
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) memory: Box<dyn GuestMemory>,
    pub(crate) loader: Box<dyn ImageLoader>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) console: Box<dyn Console>,
    pub(crate) objects: ObjectTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) views: ViewRegistry,
    /// Live register file of the running thread
    pub(crate) cpu: Registers,
    /// Calls per API table entry
    api_calls: Vec<u64>,
}

impl Kernel {
    /// Create a kernel with the host clock and console
    pub fn new(config: KernelConfig, memory: Box<dyn GuestMemory>, loader: Box<dyn ImageLoader>) -> Self {
        let mut objects = ObjectTable::new();
        for (handle, stream) in [
            (Handle::STD_OUTPUT, StdStream::Output),
            (Handle::STD_INPUT, StdStream::Input),
            (Handle::STD_ERROR, StdStream::Error),
        ] {
            objects.insert_at(handle, KernelObject::File(FileObject::new(stream)));
        }

        Self {
            callbacks: CallbackRegistry::new(config.thunk_base),
            config,
            memory,
            loader,
            clock: Box::new(HostClock::new()),
            console: Box::new(HostConsole),
            objects,
            scheduler: Scheduler::new(),
            views: ViewRegistry::new(),
            cpu: Registers::default(),
            api_calls: vec![0; syscall::API_TABLE.len()],
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the console behind the standard handles
    pub fn with_console(mut self, console: Box<dyn Console>) -> Self {
        self.console = console;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Live register file
    pub fn cpu(&self) -> &Registers {
        &self.cpu
    }

    /// Live register file, for the interpreter
    pub fn cpu_mut(&mut self) -> &mut Registers {
        &mut self.cpu
    }

    pub fn memory(&self) -> &dyn GuestMemory {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut dyn GuestMemory {
        self.memory.as_mut()
    }

    /// Object table, read-only
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Current process and thread, if a thread is loaded
    pub fn context(&self) -> Option<ExecutionContext> {
        let thread = self.scheduler.current()?;
        let process = self.objects.thread(thread).ok()?.process;
        Some(ExecutionContext { process, thread })
    }

    /// Current context for a host call
    pub(crate) fn current_context(&self) -> KernelResult<ExecutionContext> {
        self.context().ok_or_else(|| Fault::NoCurrentThread.into())
    }

    /// Map the pseudo-handles to the real handles of the current context
    pub(crate) fn resolve_pseudo(&self, handle: Handle) -> KernelResult<Handle> {
        if !handle.is_pseudo() {
            return Ok(handle);
        }
        let ctx = self.current_context()?;
        Ok(if handle == Handle::CURRENT_PROCESS { ctx.process } else { ctx.thread })
    }

    /// Store an error in the current thread's last-error cell
    pub fn set_last_error(&mut self, err: Win32Error) {
        self.set_last_error_code(err.code());
    }

    pub(crate) fn set_last_error_code(&mut self, code: u32) {
        let Some(current) = self.scheduler.current() else {
            return;
        };
        if let Ok(thread) = self.objects.thread_mut(current) {
            thread.last_error = code;
        }
    }

    /// Last-error cell of the current thread
    pub fn last_error(&self) -> u32 {
        self.scheduler
            .current()
            .and_then(|current| self.objects.thread(current).ok())
            .map_or(0, |thread| thread.last_error)
    }

    pub(crate) fn record_api_call(&mut self, index: usize) {
        if let Some(count) = self.api_calls.get_mut(index) {
            *count += 1;
        }
    }

    /// Number of times the guest called `name`
    pub fn api_call_count(&self, name: &str) -> u64 {
        syscall::lookup(name).and_then(|index| self.api_calls.get(index)).copied().unwrap_or(0)
    }

    /// Bind an import to a callable address
    pub fn resolve_import(&mut self, module: &str, name: &str) -> GuestAddr {
        self.callbacks.resolve(module, name)
    }

    /// Check if the interpreter must hand `addr` to [`Kernel::invoke_host`]
    pub fn is_host_address(&self, addr: GuestAddr) -> bool {
        self.callbacks.contains(addr)
    }

    /// Run the host side of a synthetic address
    pub fn invoke_host(&mut self, addr: GuestAddr) -> KernelResult<()> {
        let callback = self.callbacks.get(addr).cloned().ok_or(Fault::UnknownCallback(addr))?;
        match callback {
            HostCallback::Api(index) => syscall::dispatch(self, index),
            HostCallback::ThreadExit => {
                let ctx = self.current_context()?;
                let exit_code = self.cpu.eax;
                debug!("thread {} returned {:#x}", ctx.thread, exit_code);
                self.finalize_thread(ctx.thread, exit_code)?;
                self.reschedule()
            }
            HostCallback::Unsupported { module, name } => {
                error!("guest called unsupported import {}!{}", module, name);
                Err(Fault::UnsupportedImport { module, name }.into())
            }
        }
    }

    /// Load the first runnable thread into the CPU
    pub fn start(&mut self) -> KernelResult<()> {
        self.reschedule()
    }

    /// Scheduling tick: rotate the running thread to the back
    pub fn tick(&mut self) -> KernelResult<()> {
        self.scheduler.yield_current(&mut self.objects);
        self.reschedule()
    }

    /// Threads that have not terminated
    pub fn live_thread_count(&self) -> usize {
        self.objects.threads().filter(|(_, t)| t.state.is_live()).count()
    }

    /// True once no thread is loaded and none can run again
    pub fn is_finished(&self) -> bool {
        self.scheduler.current().is_none() && self.live_thread_count() == 0
    }

    /// Switch to the next runnable thread
    ///
    /// Saves the outgoing registers, expires timed waits and loads the
    /// first ready thread. With nothing ready it sleeps until the earliest
    /// deadline; with no deadline left it either finishes (no live threads)
    /// or reports a deadlock.
    pub(crate) fn reschedule(&mut self) -> KernelResult<()> {
        if let Some(current) = self.scheduler.current() {
            if let Ok(thread) = self.objects.thread_mut(current) {
                thread.regs = self.cpu;
            }
        }

        loop {
            self.expire_timeouts()?;
            if let Some(next) = self.scheduler.pick_next(&mut self.objects) {
                self.cpu = self.objects.thread(next)?.regs;
                trace!("running {} at {:#010x}", next, self.cpu.eip);
                return Ok(());
            }

            match self.earliest_deadline() {
                Some(deadline) => {
                    trace!("idle until {}", deadline);
                    self.clock.sleep_until(deadline);
                }
                None => {
                    let live = self.live_thread_count();
                    if live > 0 {
                        error!("{} thread(s) blocked forever", live);
                        return Err(Fault::Deadlock(live).into());
                    }
                    debug!("no live threads left");
                    return Ok(());
                }
            }
        }
    }

    fn earliest_deadline(&self) -> Option<u64> {
        self.objects
            .threads()
            .filter(|(_, t)| t.state == ThreadState::Blocked)
            .filter_map(|(_, t)| t.wait.and_then(|wait| wait.deadline))
            .min()
    }
}
