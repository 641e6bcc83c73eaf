// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Guest-call harness
//!
//! Plays the part of the instruction interpreter: it pushes a stdcall frame
//! for the running thread, jumps to the thunk of the called API and reports
//! whether the caller got control back.

use super::fixtures::{scratch_page, CaptureConsole, ImageSpec, ManualClock, TestLoader};
use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::kernel::{Kernel, ProcessInfo};
use crate::mm::memory::FlatMemory;
use crate::mm::GuestAddr;
use crate::object::Handle;

/// Offset of the fake call site every harness call returns to
const RETURN_SITE_OFFSET: u32 = 0x40;

/// What the caller observed after a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// The caller is still running and got this `eax`
    Returned(u32),
    /// Another thread (or none) is running now
    Switched,
}

/// A booted kernel with one process running `app.exe`
pub struct Guest {
    pub kernel: Kernel,
    pub clock: ManualClock,
    pub console: CaptureConsole,
    pub loader: TestLoader,
    /// The first process and its main thread
    pub info: ProcessInfo,
    /// Return address pushed by every call
    pub return_site: GuestAddr,
    scratch: GuestAddr,
    scratch_used: u32,
}

impl Guest {
    /// Boot with the default configuration
    pub fn boot() -> Self {
        Self::boot_with(KernelConfig::default())
    }

    /// Boot with a custom configuration
    pub fn boot_with(config: KernelConfig) -> Self {
        let loader = TestLoader::new()
            .with_image("app.exe", ImageSpec::default())
            .with_image("child.exe", ImageSpec { imports: Vec::new(), ..ImageSpec::default() });
        let clock = ManualClock::new();
        let console = CaptureConsole::new();

        let mut kernel = Kernel::new(config, Box::new(FlatMemory::new()), Box::new(loader.clone()))
            .with_clock(Box::new(clock.clone()))
            .with_console(Box::new(console.clone()));
        let info = kernel.create_process("app.exe", "app.exe --flag", &[], "C:\\work").expect("create app.exe");
        kernel.start().expect("start");

        let scratch = scratch_page(kernel.memory_mut());
        let base = kernel.objects().process(info.process).expect("process").image().expect("image").base;
        Self {
            kernel,
            clock,
            console,
            loader,
            info,
            return_site: base + RETURN_SITE_OFFSET,
            scratch,
            scratch_used: 0,
        }
    }

    /// Thread currently loaded in the CPU
    pub fn current_thread(&self) -> Option<Handle> {
        self.kernel.context().map(|ctx| ctx.thread)
    }

    /// Call a kernel32 export on behalf of the running thread
    pub fn try_call(&mut self, name: &str, args: &[u32]) -> KernelResult<CallResult> {
        let caller = self.current_thread().expect("no running thread");
        let thunk = self.kernel.resolve_import("kernel32.dll", name);

        let mut esp = self.kernel.cpu().esp;
        for &value in args.iter().rev().chain(std::iter::once(&self.return_site)) {
            esp -= 4;
            self.kernel.memory_mut().write_u32(esp, value).expect("push");
        }
        self.kernel.cpu_mut().esp = esp;
        self.kernel.cpu_mut().eip = thunk;

        self.kernel.invoke_host(thunk)?;
        Ok(if self.current_thread() == Some(caller) && self.kernel.cpu().eip == self.return_site {
            CallResult::Returned(self.kernel.cpu().eax)
        } else {
            CallResult::Switched
        })
    }

    /// Call an export that must return to the caller
    pub fn call(&mut self, name: &str, args: &[u32]) -> u32 {
        match self.try_call(name, args) {
            Ok(CallResult::Returned(value)) => value,
            other => panic!("{} did not return: {:?}", name, other),
        }
    }

    /// Call an export that must block or end the caller
    pub fn call_switching(&mut self, name: &str, args: &[u32]) {
        match self.try_call(name, args) {
            Ok(CallResult::Switched) => {}
            other => panic!("{} did not switch threads: {:?}", name, other),
        }
    }

    /// Return from the running thread's start routine (`ret 4`)
    pub fn return_from_entry(&mut self, exit_code: u32) -> KernelResult<()> {
        let esp = self.kernel.cpu().esp;
        let trampoline = self.kernel.memory().read_u32(esp).expect("return address");
        let cpu = self.kernel.cpu_mut();
        cpu.eax = exit_code;
        cpu.esp = esp + 8;
        cpu.eip = trampoline;
        self.kernel.invoke_host(trampoline)
    }

    /// Current thread's last-error cell
    pub fn last_error(&self) -> u32 {
        self.kernel.last_error()
    }

    /// ========================================================================
    /// Scratch memory
    /// ========================================================================

    /// Reserve zeroed scratch bytes, 8-byte aligned
    pub fn alloc(&mut self, size: u32) -> GuestAddr {
        let size = (size + 7) & !7;
        if self.scratch_used + size > crate::mm::PAGE_SIZE {
            self.scratch = scratch_page(self.kernel.memory_mut());
            self.scratch_used = 0;
        }
        let addr = self.scratch + self.scratch_used;
        self.scratch_used += size;
        addr
    }

    /// Place a NUL-terminated string in scratch memory
    pub fn string(&mut self, text: &str) -> GuestAddr {
        let addr = self.alloc(text.len() as u32 + 1);
        self.kernel.memory_mut().write_cstr(addr, text).expect("write string");
        addr
    }

    pub fn read_u32(&self, addr: GuestAddr) -> u32 {
        self.kernel.memory().read_u32(addr).expect("read_u32")
    }

    pub fn write_u32(&mut self, addr: GuestAddr, value: u32) {
        self.kernel.memory_mut().write_u32(addr, value).expect("write_u32");
    }

    pub fn read_string(&self, addr: GuestAddr) -> String {
        self.kernel.memory().read_cstr(addr, 4096).expect("read_string")
    }

    pub fn read_bytes(&self, addr: GuestAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.kernel.memory().read_bytes(addr, &mut buf).expect("read_bytes");
        buf
    }
}
