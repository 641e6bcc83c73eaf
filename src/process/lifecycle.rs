// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process and thread lifecycle
//!
//! # Thread start
//!
//! A new thread's stack is prepared so the start routine returns into the
//! thread-exit trampoline:
//!
//! ```text
//! top - 4   thread handle
//! top - 8   0
//! top - 12  parameter
//! top - 16  trampoline address   <- esp
//! ```
//!
//! # Teardown
//!
//! A thread ends by returning into the trampoline, by `ExitThread` or by
//! being terminated. The last thread of a process ending finishes the
//! process. Finished threads and processes are reaped once no handle
//! references them.

use bitflags::bitflags;
use log::{debug, info, warn};

use super::thread::{StackRegion, Thread};
use super::{Environment, Module, Process, ProcessState};
use crate::error::{KernelResult, Win32Error};
use crate::kernel::{Kernel, ProcessInfo};
use crate::mm::heap::{Heap, HeapFlags};
use crate::mm::{align_page_up, GuestAddr};
use crate::object::{Handle, KernelObject};
use crate::sched::ThreadState;
use crate::traits::LoadRequest;

bitflags! {
    /// `CreateThread` creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadCreationFlags: u32 {
        const CREATE_SUSPENDED = 0x0000_0004;
        const STACK_SIZE_PARAM_IS_A_RESERVATION = 0x0001_0000;
    }
}

bitflags! {
    /// `CreateProcessA` creation flags that are accepted
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessCreationFlags: u32 {
        const DEBUG_PROCESS = 0x0000_0001;
        const DEBUG_ONLY_THIS_PROCESS = 0x0000_0002;
        const CREATE_SUSPENDED = 0x0000_0004;
        const DETACHED_PROCESS = 0x0000_0008;
        const CREATE_NEW_CONSOLE = 0x0000_0010;
        const NORMAL_PRIORITY_CLASS = 0x0000_0020;
        const IDLE_PRIORITY_CLASS = 0x0000_0040;
        const HIGH_PRIORITY_CLASS = 0x0000_0080;
        const REALTIME_PRIORITY_CLASS = 0x0000_0100;
        const CREATE_NEW_PROCESS_GROUP = 0x0000_0200;
        const CREATE_UNICODE_ENVIRONMENT = 0x0000_0400;
        const CREATE_DEFAULT_ERROR_MODE = 0x0400_0000;
        const CREATE_NO_WINDOW = 0x0800_0000;
    }
}

/// Parameters for a new process beyond its image
#[derive(Debug, Clone)]
pub(crate) struct ProcessParams<'a> {
    pub name: &'a str,
    pub command_line: &'a str,
    pub search_paths: &'a [String],
    pub cwd: &'a str,
    pub environment: Environment,
    pub suspended: bool,
}

impl Kernel {
    /// ========================================================================
    /// Creation
    /// ========================================================================

    /// Load an executable and create its process and main thread
    ///
    /// # Errors
    /// * `ERROR_FILE_NOT_FOUND` if the loader cannot find the image
    pub fn create_process(
        &mut self,
        name: &str,
        command_line: &str,
        search_paths: &[String],
        cwd: &str,
    ) -> KernelResult<ProcessInfo> {
        let environment = self.config.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.spawn_process(ProcessParams {
            name,
            command_line,
            search_paths,
            cwd,
            environment,
            suspended: false,
        })
    }

    pub(crate) fn spawn_process(&mut self, params: ProcessParams<'_>) -> KernelResult<ProcessInfo> {
        let request = LoadRequest {
            name: params.name,
            search_paths: params.search_paths,
            cwd: params.cwd,
        };
        let image = self
            .loader
            .load(self.memory.as_mut(), &mut self.callbacks, &request)
            .ok_or(Win32Error::FileNotFound)?;
        debug!("loaded {} at {:#010x}, entry {:#010x}", image.path, image.base, image.entry);

        let module = Module {
            name: image.name.clone(),
            path: image.path.clone(),
            base: image.base,
            entry: image.entry,
        };
        let process = Process::new(module, params.command_line, params.cwd, params.environment, self.config.tls_slots);
        let (handle, _) = self.objects.create(KernelObject::Process(process), None)?;

        let heap = match Heap::create(
            self.memory.as_mut(),
            handle,
            HeapFlags::GROWABLE,
            self.config.process_heap_initial,
            self.config.process_heap_maximum,
            self.config.heap_growth_increment,
        ) {
            Ok(heap) => heap,
            Err(err) => {
                self.objects.remove(handle);
                return Err(err.into());
            }
        };
        let (heap_handle, _) = self.objects.create(KernelObject::Heap(heap), None)?;
        self.objects.process_mut(handle)?.default_heap = heap_handle;

        let command_line_ptr = self.copy_string_to_heap(heap_handle, params.command_line)?;
        self.objects.process_mut(handle)?.command_line_ptr = command_line_ptr;

        let flags = if params.suspended {
            ThreadCreationFlags::CREATE_SUSPENDED
        } else {
            ThreadCreationFlags::empty()
        };
        let thread = self.create_thread(handle, image.entry, 0, image.stack_commit, image.stack_reserve, flags)?;
        info!("process {} ({}) started with thread {}", handle, image.name, thread);
        Ok(ProcessInfo { process: handle, thread })
    }

    /// Copy a NUL-terminated string onto a heap
    pub(crate) fn copy_string_to_heap(&mut self, heap: Handle, text: &str) -> KernelResult<GuestAddr> {
        self.copy_bytes_to_heap(heap, &crate::syscall::args::ansi_bytes(text, true))
    }

    /// Copy raw bytes onto a heap
    pub(crate) fn copy_bytes_to_heap(&mut self, heap: Handle, bytes: &[u8]) -> KernelResult<GuestAddr> {
        let len = u32::try_from(bytes.len()).map_err(|_| Win32Error::NotEnoughMemory)?;
        let addr = self.objects.heap_mut(heap)?.allocate(self.memory.as_mut(), len, HeapFlags::empty())?;
        self.memory.write_bytes(addr, bytes)?;
        Ok(addr)
    }

    /// Create a thread in `process`
    ///
    /// The stack is `max(commit, reserve)` rounded up to whole pages, with
    /// the configured default reserve standing in for a zero reserve.
    pub fn create_thread(
        &mut self,
        process: Handle,
        entry: GuestAddr,
        parameter: u32,
        stack_commit: u32,
        stack_reserve: u32,
        flags: ThreadCreationFlags,
    ) -> KernelResult<Handle> {
        if self.objects.process(process)?.state != ProcessState::Running {
            return Err(Win32Error::AccessDenied.into());
        }

        let reserve = if stack_reserve == 0 { self.config.default_stack_reserve } else { stack_reserve };
        let size = align_page_up(stack_commit.max(reserve)).ok_or(Win32Error::NotEnoughMemory)?;
        let base = self.memory.alloc_pages(size).ok_or(Win32Error::NotEnoughMemory)?;
        let stack = StackRegion { base, size };

        let mut thread = Thread::new(process, entry, parameter, stack);
        if flags.contains(ThreadCreationFlags::CREATE_SUSPENDED) {
            thread.suspend_count = 1;
        }
        let handle = match self.objects.create(KernelObject::Thread(thread), None) {
            Ok((handle, _)) => handle,
            Err(err) => {
                self.memory.free_pages(base);
                return Err(err.into());
            }
        };

        let trampoline = self.callbacks.thread_exit_address();
        let mut esp = stack.top();
        for value in [handle.raw(), 0, parameter, trampoline] {
            esp -= 4;
            self.memory.write_u32(esp, value)?;
        }
        let t = self.objects.thread_mut(handle)?;
        t.regs.esp = esp;
        t.regs.ebp = esp;

        self.objects.process_mut(process)?.threads.push(handle);
        self.scheduler.add_thread(&mut self.objects, handle, false)?;
        debug!("thread {} created in {}: entry {:#010x}, stack {:#010x}+{:#x}", handle, process, entry, base, size);
        Ok(handle)
    }

    /// ========================================================================
    /// Teardown
    /// ========================================================================

    /// Terminate a thread with `exit_code`
    pub(crate) fn finalize_thread(&mut self, thread: Handle, exit_code: u32) -> KernelResult<()> {
        if self.objects.thread(thread)?.is_terminated() {
            return Ok(());
        }
        self.cancel_wait(thread)?;
        self.objects.thread_mut(thread)?.exit_code = exit_code;
        self.scheduler.remove_thread(&mut self.objects, thread, false)?;

        self.abandon_mutexes(thread)?;
        self.wake_joiners(thread)?;

        let t = self.objects.thread(thread)?;
        let (process, stack) = (t.process, t.stack);
        if !self.memory.free_pages(stack.base) {
            warn!("stack of thread {} at {:#010x} was already released", thread, stack.base);
        }
        debug!("thread {} exited with {:#x}", thread, exit_code);

        let remaining = {
            let p = self.objects.process_mut(process)?;
            p.threads.retain(|&h| h != thread);
            p.threads.len()
        };
        if remaining == 0 {
            self.finalize_process(process, exit_code)?;
        }
        self.reap(thread);
        Ok(())
    }

    /// Release every mutex a terminating thread holds
    fn abandon_mutexes(&mut self, thread: Handle) -> KernelResult<()> {
        let owned: Vec<Handle> = self
            .objects
            .iter()
            .filter_map(|(h, object)| match object {
                KernelObject::WaitObject(w) if w.is_owned_by(thread) => Some(h),
                _ => None,
            })
            .collect();
        for mutex in owned {
            self.objects.wait_object_mut(mutex)?.abandon(thread);
            warn!("mutex {} abandoned by thread {}", mutex, thread);
            self.signal_waiters(mutex)?;
        }
        Ok(())
    }

    /// Finish a process whose last thread has ended
    fn finalize_process(&mut self, process: Handle, exit_code: u32) -> KernelResult<()> {
        let p = self.objects.process_mut(process)?;
        if p.state == ProcessState::Exited {
            return Ok(());
        }
        if p.state == ProcessState::Running {
            p.exit_code = exit_code;
        }
        p.state = ProcessState::Exited;
        let code = p.exit_code;

        for heap in self.objects.heaps_of(process) {
            if let Some(KernelObject::Heap(heap)) = self.objects.remove(heap) {
                heap.destroy(self.memory.as_mut());
            }
        }
        for region in self.objects.process_mut(process)?.virtual_regions.drain() {
            self.memory.free_pages(region);
        }
        self.wake_joiners(process)?;
        info!("process {} exited with {:#x}", process, code);
        self.reap(process);
        Ok(())
    }

    /// End every thread of a process (`ExitProcess`/`TerminateProcess`)
    pub(crate) fn exit_process(&mut self, process: Handle, exit_code: u32) -> KernelResult<()> {
        let p = self.objects.process_mut(process)?;
        if p.state != ProcessState::Running {
            return Ok(());
        }
        p.state = ProcessState::Exiting;
        p.exit_code = exit_code;
        let threads = p.threads.clone();

        if threads.is_empty() {
            return self.finalize_process(process, exit_code);
        }
        for thread in threads {
            self.finalize_thread(thread, exit_code)?;
        }
        Ok(())
    }

    /// Remove a finished thread or process nobody references any more
    pub(crate) fn reap(&mut self, handle: Handle) {
        let finished = match self.objects.entry(handle) {
            Some(entry) if entry.refs == 0 => match &entry.object {
                KernelObject::Thread(t) => t.is_terminated(),
                KernelObject::Process(p) => p.has_exited(),
                _ => false,
            },
            _ => false,
        };
        if finished {
            self.objects.remove(handle);
        }
    }

    /// ========================================================================
    /// Suspension
    /// ========================================================================

    /// Increment a thread's suspend count, returning the previous count
    pub fn suspend_thread(&mut self, thread: Handle) -> KernelResult<u32> {
        let t = self.objects.thread_mut(thread)?;
        if t.is_terminated() {
            return Err(Win32Error::AccessDenied.into());
        }
        let previous = t.suspend_count;
        t.suspend_count += 1;
        if previous == 0 && matches!(t.state, ThreadState::Ready | ThreadState::Running) {
            self.scheduler.remove_thread(&mut self.objects, thread, true)?;
        }
        Ok(previous)
    }

    /// Decrement a thread's suspend count, returning the previous count
    pub fn resume_thread(&mut self, thread: Handle) -> KernelResult<u32> {
        let t = self.objects.thread_mut(thread)?;
        let previous = t.suspend_count;
        if previous == 0 {
            return Ok(0);
        }
        t.suspend_count -= 1;
        if t.suspend_count == 0 && t.state == ThreadState::Blocked && t.wait.is_none() {
            self.scheduler.add_thread(&mut self.objects, thread, true)?;
        }
        Ok(previous)
    }
}
