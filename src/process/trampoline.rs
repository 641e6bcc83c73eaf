// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Host callback registry
//!
//! Guest code reaches the host by jumping to synthetic addresses in a range
//! no image occupies. Each address maps to a [`HostCallback`]:
//!
//! - an API thunk bound by the import resolver
//! - the thread-exit trampoline every thread returns into
//! - a placeholder for an import nobody implements, which faults when called
//!
//! # Usage
//!
//! ```ignore
//! let addr = registry.resolve("kernel32.dll", "GetTickCount");
//! assert!(matches!(registry.get(addr), Some(HostCallback::Api(_))));
//! ```

use std::collections::{BTreeMap, HashMap};

use log::{debug, error, warn};
use spin::Once;

use crate::mm::GuestAddr;
use crate::syscall;
use crate::traits::ImportResolver;

/// Distance between consecutive thunk addresses
pub const THUNK_STRIDE: u32 = 4;

/// What happens when guest code reaches a synthetic address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCallback {
    /// Dispatch to the API table entry at this index
    Api(usize),
    /// Finish the current thread with `eax` as its exit code
    ThreadExit,
    /// Import without a host implementation
    Unsupported { module: String, name: String },
}

/// Registry of synthetic host addresses
#[derive(Debug)]
pub struct CallbackRegistry {
    /// First synthetic address
    base: GuestAddr,
    /// Next address to hand out; `None` once the range is spent
    next: Option<GuestAddr>,
    entries: BTreeMap<GuestAddr, HostCallback>,
    /// (lowercase module, name) -> bound address
    bound: HashMap<(String, String), GuestAddr>,
    /// Thread-exit trampoline, registered on first use
    thread_exit: Once<GuestAddr>,
}

impl CallbackRegistry {
    /// Create an empty registry handing out addresses from `base`
    pub fn new(base: GuestAddr) -> Self {
        Self {
            base,
            next: Some(base),
            entries: BTreeMap::new(),
            bound: HashMap::new(),
            thread_exit: Once::new(),
        }
    }

    /// First synthetic address
    pub fn base(&self) -> GuestAddr {
        self.base
    }

    /// Look up the callback behind an address
    pub fn get(&self, addr: GuestAddr) -> Option<&HostCallback> {
        self.entries.get(&addr)
    }

    /// Check if an address belongs to the host
    pub fn contains(&self, addr: GuestAddr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Address of the thread-exit trampoline
    pub fn thread_exit_address(&mut self) -> GuestAddr {
        let entries = &mut self.entries;
        let next = &mut self.next;
        *self.thread_exit.call_once(|| {
            let addr = Self::claim(next).unwrap_or(0);
            entries.insert(addr, HostCallback::ThreadExit);
            debug!("thread-exit trampoline at {:#010x}", addr);
            addr
        })
    }

    fn claim(next: &mut Option<GuestAddr>) -> Option<GuestAddr> {
        let addr = (*next)?;
        *next = addr.checked_add(THUNK_STRIDE);
        Some(addr)
    }

    fn is_kernel32(module: &str) -> bool {
        let module = module.rsplit(['\\', '/']).next().unwrap_or(module);
        module.eq_ignore_ascii_case("kernel32.dll") || module.eq_ignore_ascii_case("kernel32")
    }
}

impl ImportResolver for CallbackRegistry {
    fn resolve(&mut self, module: &str, name: &str) -> GuestAddr {
        let key = (module.to_ascii_lowercase(), name.to_string());
        if let Some(&addr) = self.bound.get(&key) {
            return addr;
        }

        let Some(addr) = Self::claim(&mut self.next) else {
            error!("thunk range exhausted binding {}!{}", module, name);
            return 0;
        };
        let callback = match syscall::lookup(name) {
            Some(index) if Self::is_kernel32(module) => HostCallback::Api(index),
            _ => {
                warn!("import {}!{} has no host implementation", module, name);
                HostCallback::Unsupported { module: module.to_string(), name: name.to_string() }
            }
        };
        self.entries.insert(addr, callback);
        self.bound.insert(key, addr);
        addr
    }
}
