// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Integration Tests
//!
//! These tests boot a kernel with one guest process and drive it through
//! the kernel32 thunks the way the instruction interpreter would.

mod handle_tests;
mod sync_tests;
