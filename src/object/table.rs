// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Object Table
//!
//! Maps handles to kernel objects and names to handles.
//!
//! # Design
//!
//! - **Monotonic handles**: values start at 4 and advance by 4; a value is
//!   never handed out twice, even after its object is gone
//! - **Reference counts**: one per open handle reference; `DuplicateHandle`
//!   and `Open*` add references to the same entry
//! - **Namespace**: named objects are found again by name while they live
//! - **Lifecycle objects**: processes and threads survive their last close
//!   and are reaped by the lifecycle code once terminated

use std::collections::{BTreeMap, HashMap};

use log::trace;

use super::file::{FileMapping, FileObject};
use super::handle::{Handle, ObjectType};
use crate::error::Win32Error;
use crate::mm::heap::Heap;
use crate::process::thread::Thread;
use crate::process::Process;
use crate::sync::wait_object::WaitObject;

/// First handle value handed out by the table
const FIRST_HANDLE: u32 = 4;

/// Distance between consecutive handle values
const HANDLE_STEP: u32 = 4;

/// ============================================================================
/// Kernel Objects
/// ============================================================================

/// Every object a handle can refer to
#[derive(Debug)]
pub enum KernelObject {
    Process(Process),
    Thread(Thread),
    WaitObject(WaitObject),
    FileMapping(FileMapping),
    Heap(Heap),
    File(FileObject),
}

impl KernelObject {
    /// Get the object type
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Process(_) => ObjectType::Process,
            Self::Thread(_) => ObjectType::Thread,
            Self::WaitObject(_) => ObjectType::WaitObject,
            Self::FileMapping(_) => ObjectType::FileMapping,
            Self::Heap(_) => ObjectType::Heap,
            Self::File(_) => ObjectType::File,
        }
    }
}

/// A table slot
#[derive(Debug)]
pub struct ObjectEntry {
    /// The object itself
    pub object: KernelObject,

    /// Name in the object namespace, if any
    pub name: Option<String>,

    /// Open handle references
    pub refs: u32,
}

/// Outcome of a named create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A new entry was made
    Created,
    /// The name already existed; the returned handle is the existing entry
    AlreadyExists,
}

/// Outcome of [`ObjectTable::close`]
#[derive(Debug)]
pub enum CloseOutcome {
    /// Other references remain
    Retained,
    /// Last reference dropped; the entry stays until its lifecycle ends
    Released,
    /// Last reference dropped and the entry was removed
    Destroyed(KernelObject),
}

/// ============================================================================
/// Object Table
/// ============================================================================

/// Handle table plus object namespace
#[derive(Debug)]
pub struct ObjectTable {
    entries: BTreeMap<Handle, ObjectEntry>,
    names: HashMap<String, Handle>,
    /// Next handle value; `None` once the handle space is spent
    next: Option<u32>,
}

macro_rules! typed_accessors {
    ($($variant:ident => $get:ident, $get_mut:ident: $ty:ty;)*) => {
        $(
            #[doc = concat!("Resolve a handle to a ", stringify!($variant), " object")]
            pub fn $get(&self, handle: Handle) -> Result<&$ty, Win32Error> {
                match self.lookup(handle)? {
                    KernelObject::$variant(object) => Ok(object),
                    _ => Err(Win32Error::InvalidHandle),
                }
            }

            #[doc = concat!("Resolve a handle to a mutable ", stringify!($variant), " object")]
            pub fn $get_mut(&mut self, handle: Handle) -> Result<&mut $ty, Win32Error> {
                match self.lookup_mut(handle)? {
                    KernelObject::$variant(object) => Ok(object),
                    _ => Err(Win32Error::InvalidHandle),
                }
            }
        )*
    };
}

impl ObjectTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            names: HashMap::new(),
            next: Some(FIRST_HANDLE),
        }
    }

    /// Register an object and hand out a fresh handle
    ///
    /// A named create whose name is already taken by an object of the same
    /// type returns the existing handle with an extra reference and drops
    /// `object`. A name held by a different type is `ERROR_INVALID_HANDLE`.
    pub fn create(&mut self, object: KernelObject, name: Option<&str>) -> Result<(Handle, Disposition), Win32Error> {
        if let Some(name) = name {
            if let Some(&existing) = self.names.get(name) {
                let entry = self.entries.get_mut(&existing).ok_or(Win32Error::InvalidHandle)?;
                if entry.object.object_type() != object.object_type() {
                    return Err(Win32Error::InvalidHandle);
                }
                entry.refs += 1;
                trace!("object {:?} reopened as {} ({} refs)", name, existing, entry.refs);
                return Ok((existing, Disposition::AlreadyExists));
            }
        }

        let handle = self.allocate_handle()?;
        trace!("handle {} -> {}", handle, object.object_type().name());
        let name = name.map(String::from);
        if let Some(name) = &name {
            self.names.insert(name.clone(), handle);
        }
        self.entries.insert(handle, ObjectEntry { object, name, refs: 1 });
        Ok((handle, Disposition::Created))
    }

    /// Register an object at a reserved handle value (standard handles)
    pub fn insert_at(&mut self, handle: Handle, object: KernelObject) {
        self.entries.insert(handle, ObjectEntry { object, name: None, refs: 1 });
    }

    fn allocate_handle(&mut self) -> Result<Handle, Win32Error> {
        let raw = self.next.ok_or(Win32Error::TooManyOpenFiles)?;
        self.next = raw.checked_add(HANDLE_STEP);
        Ok(Handle::from_raw(raw))
    }

    /// Check if a handle refers to a live entry
    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Resolve a handle
    pub fn lookup(&self, handle: Handle) -> Result<&KernelObject, Win32Error> {
        self.entries.get(&handle).map(|entry| &entry.object).ok_or(Win32Error::InvalidHandle)
    }

    /// Resolve a handle for mutation
    pub fn lookup_mut(&mut self, handle: Handle) -> Result<&mut KernelObject, Win32Error> {
        self.entries.get_mut(&handle).map(|entry| &mut entry.object).ok_or(Win32Error::InvalidHandle)
    }

    /// Find a named object
    pub fn lookup_by_name(&self, name: &str) -> Option<Handle> {
        self.names.get(name).copied()
    }

    /// Get the whole slot behind a handle
    pub fn entry(&self, handle: Handle) -> Option<&ObjectEntry> {
        self.entries.get(&handle)
    }

    /// Open references on a handle (0 for unknown handles)
    pub fn refs(&self, handle: Handle) -> u32 {
        self.entries.get(&handle).map_or(0, |entry| entry.refs)
    }

    /// Add a reference to an existing entry
    pub fn add_ref(&mut self, handle: Handle) -> Result<(), Win32Error> {
        let entry = self.entries.get_mut(&handle).ok_or(Win32Error::InvalidHandle)?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one reference
    pub fn close(&mut self, handle: Handle) -> Result<CloseOutcome, Win32Error> {
        let entry = self.entries.get_mut(&handle).ok_or(Win32Error::InvalidHandle)?;
        if entry.refs == 0 {
            return Err(Win32Error::InvalidHandle);
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(CloseOutcome::Retained);
        }
        if !entry.object.object_type().removed_on_last_close() {
            return Ok(CloseOutcome::Released);
        }
        match self.remove(handle) {
            Some(object) => Ok(CloseOutcome::Destroyed(object)),
            None => Err(Win32Error::InvalidHandle),
        }
    }

    /// Remove an entry regardless of its reference count
    pub fn remove(&mut self, handle: Handle) -> Option<KernelObject> {
        let entry = self.entries.remove(&handle)?;
        if let Some(name) = entry.name {
            if self.names.get(&name) == Some(&handle) {
                self.names.remove(&name);
            }
        }
        trace!("handle {} removed ({})", handle, entry.object.object_type().name());
        Some(entry.object)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over every entry in handle order
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &KernelObject)> {
        self.entries.iter().map(|(&handle, entry)| (handle, &entry.object))
    }

    /// Iterate over every thread object
    pub fn threads(&self) -> impl Iterator<Item = (Handle, &Thread)> {
        self.entries.iter().filter_map(|(&handle, entry)| match &entry.object {
            KernelObject::Thread(thread) => Some((handle, thread)),
            _ => None,
        })
    }

    /// Handles of every heap owned by `process`
    pub fn heaps_of(&self, process: Handle) -> Vec<Handle> {
        self.entries
            .iter()
            .filter_map(|(&handle, entry)| match &entry.object {
                KernelObject::Heap(heap) if heap.owner() == process => Some(handle),
                _ => None,
            })
            .collect()
    }

    typed_accessors! {
        Process => process, process_mut: Process;
        Thread => thread, thread_mut: Thread;
        WaitObject => wait_object, wait_object_mut: WaitObject;
        FileMapping => file_mapping, file_mapping_mut: FileMapping;
        Heap => heap, heap_mut: Heap;
        File => file, file_mut: FileObject;
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
