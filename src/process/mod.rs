// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Processes and threads
//!
//! A process owns an image, an environment, a default heap and a set of
//! threads. Its id is the raw value of its handle.
//!
//! # Design
//!
//! - **Threads run, processes contain**: a process finishes when its last
//!   thread terminates or when it exits explicitly
//! - **Lifecycle in one place**: creation, termination and reaping live in
//!   [`lifecycle`] as kernel operations
//! - **Host callbacks**: API thunks and the thread-exit trampoline are
//!   synthetic addresses owned by [`trampoline::CallbackRegistry`]
//!
//! # Modules
//!
//! - [`thread`] - Thread descriptor and register file
//! - [`tls`] - TLS slot allocation
//! - [`lifecycle`] - Process/thread creation and teardown
//! - [`trampoline`] - Host callback registry

pub mod lifecycle;
pub mod thread;
pub mod tls;
pub mod trampoline;

use std::collections::VecDeque;

use crate::mm::virtual_alloc::VirtualRegions;
use crate::mm::GuestAddr;
use crate::object::Handle;
use tls::TlsSlots;

pub use thread::{Registers, StackRegion, Thread, WaitState, STILL_ACTIVE};

/// ============================================================================
/// Process State
/// ============================================================================

/// Process lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one thread may still run
    Running,
    /// Threads are being torn down
    Exiting,
    /// All threads have terminated
    Exited,
}

/// A module mapped into a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Base name, e.g. `app.exe`
    pub name: String,
    /// Full path as reported by `GetModuleFileNameA`
    pub path: String,
    /// Load address; doubles as the module handle
    pub base: GuestAddr,
    /// Entry point
    pub entry: GuestAddr,
}

/// ============================================================================
/// Environment
/// ============================================================================

/// Environment block with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Set a variable, or remove it with `None`
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let index = self.vars.iter().position(|(key, _)| key.eq_ignore_ascii_case(name));
        match (index, value) {
            (Some(i), Some(value)) => self.vars[i].1 = value.to_string(),
            (Some(i), None) => {
                self.vars.remove(i);
            }
            (None, Some(value)) => self.vars.push((name.to_string(), value.to_string())),
            (None, None) => {}
        }
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Serialize as `NAME=value\0...\0\0` for `GetEnvironmentStrings`
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = Vec::new();
        for (name, value) in &self.vars {
            block.extend(name.chars().chain(Some('=')).chain(value.chars()).map(latin1));
            block.push(0);
        }
        if self.vars.is_empty() {
            block.push(0);
        }
        block.push(0);
        block
    }

    /// Parse a `NAME=value\0...\0\0` block
    pub fn from_block(block: &[u8]) -> Self {
        let mut env = Self::new();
        for entry in block.split(|&b| b == 0).take_while(|entry| !entry.is_empty()) {
            let text: String = entry.iter().map(|&b| b as char).collect();
            // Entries such as "=C:=C:\" start with '=' and are kept whole in the name
            match text.char_indices().skip(1).find(|&(_, c)| c == '=') {
                Some((i, _)) => env.set(&text[..i], Some(&text[i + 1..])),
                None => env.set(&text, Some("")),
            }
        }
        env
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (k, v) in iter {
            env.set(&k.into(), Some(&v.into()));
        }
        env
    }
}

fn latin1(c: char) -> u8 {
    if (c as u32) < 0x100 {
        c as u8
    } else {
        b'?'
    }
}

/// ============================================================================
/// Process
/// ============================================================================

/// Guest process
#[derive(Debug)]
pub struct Process {
    /// Main image name
    pub name: String,

    /// Mapped modules, main image first
    pub modules: Vec<Module>,

    /// Environment variables
    pub environment: Environment,

    /// Current directory
    pub cwd: String,

    /// Command line as given at creation
    pub command_line: String,

    /// Guest copy of the command line returned by `GetCommandLineA`
    pub command_line_ptr: GuestAddr,

    /// Heap returned by `GetProcessHeap`
    pub default_heap: Handle,

    /// Live threads in creation order
    pub threads: Vec<Handle>,

    /// Lifecycle state
    pub state: ProcessState,

    /// Exit code (`STILL_ACTIVE` while running)
    pub exit_code: u32,

    /// Threads waiting for the process to exit
    pub waiters: VecDeque<Handle>,

    /// TLS slot allocation
    pub tls: TlsSlots,

    /// Filter installed by `SetUnhandledExceptionFilter`
    pub unhandled_exception_filter: GuestAddr,

    /// Regions committed by `VirtualAlloc`
    pub virtual_regions: VirtualRegions,
}

impl Process {
    /// Create a process descriptor with no threads yet
    pub fn new(image: Module, command_line: &str, cwd: &str, environment: Environment, tls_slots: u32) -> Self {
        Self {
            name: image.name.clone(),
            modules: vec![image],
            environment,
            cwd: cwd.to_string(),
            command_line: command_line.to_string(),
            command_line_ptr: 0,
            default_heap: Handle::NULL,
            threads: Vec::new(),
            state: ProcessState::Running,
            exit_code: STILL_ACTIVE,
            waiters: VecDeque::new(),
            tls: TlsSlots::new(tls_slots),
            unhandled_exception_filter: 0,
            virtual_regions: VirtualRegions::new(),
        }
    }

    /// Main image
    pub fn image(&self) -> Option<&Module> {
        self.modules.first()
    }

    /// Find a module by name, case-insensitively, with or without extension
    pub fn find_module(&self, name: &str) -> Option<&Module> {
        let wanted = name.rsplit(['\\', '/']).next().unwrap_or(name);
        self.modules.iter().find(|module| {
            module.name.eq_ignore_ascii_case(wanted)
                || module
                    .name
                    .rsplit_once('.')
                    .is_some_and(|(stem, _)| stem.eq_ignore_ascii_case(wanted))
        })
    }

    /// Find the module mapped at `base`
    pub fn module_at(&self, base: GuestAddr) -> Option<&Module> {
        self.modules.iter().find(|module| module.base == base)
    }

    /// Check if the process has finished
    pub fn has_exited(&self) -> bool {
        self.state == ProcessState::Exited
    }
}
