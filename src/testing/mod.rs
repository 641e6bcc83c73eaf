// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Testing infrastructure for guest-call scenarios
//!
//! Deterministic collaborators plus a harness that drives the kernel the
//! way an instruction interpreter would, one kernel32 call at a time.
//!
//! # Usage
//! ```ignore
//! use crate::testing::Guest;
//!
//! let mut guest = Guest::boot();
//! let event = guest.call("CreateEventA", &[0, 1, 0, 0]);
//! guest.call("SetEvent", &[event]);
//! guest.return_from_entry(0);
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::{CaptureConsole, ImageSpec, ManualClock, TestLoader, MANUAL_CLOCK_EPOCH_MS};
pub use harness::{CallResult, Guest};
