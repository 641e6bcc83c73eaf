// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! # ntemu - NT kernel object and concurrency emulation
//!
//! ntemu hosts the kernel half of a Win32 environment for 32-bit x86 guests.
//! An external instruction interpreter executes guest code; whenever the guest
//! calls into kernel32 it jumps to a synthetic thunk address and the
//! interpreter hands control to [`Kernel::invoke_host`].
//!
//! ## Architecture
//!
//! ```text
//! src/
//! ├── object/            # Handle table, kernel object variants, namespace
//! ├── process/           # Processes, threads, TLS, lifecycle, host callbacks
//! ├── sched/             # Cooperative scheduler and execution context
//! ├── sync/              # Wait objects, critical sections, waits
//! ├── mm/                # Page helpers, flat guest memory, heap emulator
//! ├── syscall/           # kernel32 ABI dispatcher and handlers
//! ├── kernel.rs          # Kernel state and interpreter-facing surface
//! └── lib.rs             # This file
//! ```
//!
//! ## Execution model
//!
//! - **Single execution stream**: one guest thread runs at a time
//! - **Yield points**: blocking calls, thread exit, `Sleep`, [`Kernel::tick`]
//! - **Explicit context**: the current process/thread pair is projected from
//!   the scheduler on every switch, never stored globally
//!
//! ## Collaborators
//!
//! The host supplies guest memory ([`traits::GuestMemory`]), an image loader
//! ([`traits::ImageLoader`]), and optionally a clock and console.
//!
//! ```ignore
//! use ntemu::{Kernel, KernelConfig};
//! use ntemu::mm::memory::FlatMemory;
//!
//! let mut kernel = Kernel::new(KernelConfig::default(), Box::new(FlatMemory::new()), loader);
//! let info = kernel.create_process("app.exe", "app.exe", &[], "C:\\")?;
//! kernel.start()?;
//! while !kernel.is_finished() {
//!     let eip = kernel.cpu().eip;
//!     if kernel.is_host_address(eip) {
//!         kernel.invoke_host(eip)?;
//!     } else {
//!         interpreter.step(&mut kernel)?;
//!     }
//! }
//! ```

// Core traits and types
pub mod traits;

// Error taxonomy
pub mod error;

// Tunables
pub mod config;

// Memory helpers and heap emulation
pub mod mm;

// Kernel objects and the handle table
pub mod object;

// Processes and threads
pub mod process;

// Scheduler
pub mod sched;

// Synchronization primitives
pub mod sync;

// Win32 ABI boundary
pub mod syscall;

// Kernel state
pub mod kernel;

// Test fixtures
#[cfg(test)]
pub mod testing;

// Integration tests
#[cfg(test)]
mod tests;

pub use config::{KernelConfig, VersionInfo};
pub use error::{Fault, KernelError, KernelResult, Win32Error};
pub use kernel::{Kernel, ProcessInfo};
pub use mm::GuestAddr;
pub use object::Handle;
pub use process::thread::Registers;
pub use sched::ExecutionContext;
