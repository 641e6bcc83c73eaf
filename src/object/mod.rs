// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Objects
//!
//! Every resource a guest can name is a [`KernelObject`] living in the
//! [`ObjectTable`] behind a [`Handle`].
//!
//! # Design
//!
//! - **Closed object set**: process, thread, wait object, file mapping,
//!   heap and console file; operations match exhaustively
//! - **Reference counting**: an entry lives while handles reference it;
//!   processes and threads additionally live until they terminate
//! - **Namespace**: named wait objects and sections are shared by name
//!
//! # Modules
//!
//! - [`handle`] - Handle values and object types
//! - [`table`] - Handle table and namespace
//! - [`file`] - Console files, sections and mapped views

pub mod file;
pub mod handle;
pub mod table;

pub use file::{FileMapAccess, FileMapping, FileObject, PageProtection, ViewRegistry, FILE_TYPE_CHAR};
pub use handle::{Handle, ObjectType};
pub use table::{CloseOutcome, Disposition, KernelObject, ObjectEntry, ObjectTable};
