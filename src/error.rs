// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Error taxonomy
//!
//! Two families of failure exist:
//!
//! - [`Win32Error`]: recoverable errors a guest observes through its
//!   last-error cell and a failure return value
//! - [`Fault`]: conditions the emulator cannot model; they end the session
//!
//! Kernel operations return [`KernelResult`] so both flow through `?`.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::mm::GuestAddr;
use crate::traits::MemoryError;

/// ============================================================================
/// Win32 Error Codes
/// ============================================================================

/// Win32 error codes stored in a thread's last-error cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, thiserror::Error)]
#[repr(u32)]
pub enum Win32Error {
    #[error("The operation completed successfully")]
    Success = 0,

    #[error("The system cannot find the file specified")]
    FileNotFound = 2,

    #[error("The system cannot find the path specified")]
    PathNotFound = 3,

    #[error("The system cannot open the file")]
    TooManyOpenFiles = 4,

    #[error("Access is denied")]
    AccessDenied = 5,

    #[error("The handle is invalid")]
    InvalidHandle = 6,

    #[error("Not enough storage is available to process this command")]
    NotEnoughMemory = 8,

    #[error("The parameter is incorrect")]
    InvalidParameter = 87,

    #[error("The data area passed to a system call is too small")]
    InsufficientBuffer = 122,

    #[error("The specified module could not be found")]
    ModNotFound = 126,

    #[error("Cannot create a file when that file already exists")]
    AlreadyExists = 183,

    #[error("The system could not find the environment option that was entered")]
    EnvvarNotFound = 203,

    #[error("Attempt to release mutex not owned by caller")]
    NotOwner = 288,

    #[error("Too many posts were made to a semaphore")]
    TooManyPosts = 298,

    #[error("Attempt to access invalid address")]
    InvalidAddress = 487,

    #[error("Invalid flags")]
    InvalidFlags = 1004,
}

impl Win32Error {
    /// Numeric code as seen by `GetLastError`
    pub fn code(self) -> u32 {
        self.into()
    }

    /// Symbolic name for logging
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "ERROR_SUCCESS",
            Self::FileNotFound => "ERROR_FILE_NOT_FOUND",
            Self::PathNotFound => "ERROR_PATH_NOT_FOUND",
            Self::TooManyOpenFiles => "ERROR_TOO_MANY_OPEN_FILES",
            Self::AccessDenied => "ERROR_ACCESS_DENIED",
            Self::InvalidHandle => "ERROR_INVALID_HANDLE",
            Self::NotEnoughMemory => "ERROR_NOT_ENOUGH_MEMORY",
            Self::InvalidParameter => "ERROR_INVALID_PARAMETER",
            Self::InsufficientBuffer => "ERROR_INSUFFICIENT_BUFFER",
            Self::ModNotFound => "ERROR_MOD_NOT_FOUND",
            Self::AlreadyExists => "ERROR_ALREADY_EXISTS",
            Self::EnvvarNotFound => "ERROR_ENVVAR_NOT_FOUND",
            Self::NotOwner => "ERROR_NOT_OWNER",
            Self::TooManyPosts => "ERROR_TOO_MANY_POSTS",
            Self::InvalidAddress => "ERROR_INVALID_ADDRESS",
            Self::InvalidFlags => "ERROR_INVALID_FLAGS",
        }
    }
}

/// ============================================================================
/// Faults
/// ============================================================================

/// Unrecoverable emulation failures
///
/// A fault terminates the emulated session: continuing after an unmodeled
/// call would hand the guest fabricated data.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// Guest called an import with no host implementation
    #[error("unsupported import {module}!{name}")]
    UnsupportedImport { module: String, name: String },

    /// A modeled call took a path that is not modeled
    #[error("{api}: {detail} is not supported")]
    Unsupported { api: &'static str, detail: String },

    /// Guest memory access failed inside a host call
    #[error("guest memory fault: {0}")]
    Memory(#[from] MemoryError),

    /// The interpreter jumped to a synthetic address nobody registered
    #[error("no host callback registered at {0:#010x}")]
    UnknownCallback(GuestAddr),

    /// A host call arrived while no guest thread was running
    #[error("no guest thread is running")]
    NoCurrentThread,

    /// Every live thread is blocked and no wait can time out
    #[error("deadlock: {0} live thread(s) blocked with no pending timeout")]
    Deadlock(usize),
}

/// ============================================================================
/// Combined Result
/// ============================================================================

/// Error returned by kernel operations
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Win32(#[from] Win32Error),

    #[error(transparent)]
    Fault(#[from] Fault),
}

impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        Self::Fault(Fault::Memory(err))
    }
}

/// Result type used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;
