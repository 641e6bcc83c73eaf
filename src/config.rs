// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel configuration
//!
//! Tunables that shape the emulated environment. [`KernelConfig::default`]
//! reproduces a Windows XP SP2 workstation with a console subsystem.

use crate::mm::GuestAddr;

/// Default stack reserve for new threads (1 MiB)
pub const DEFAULT_STACK_RESERVE: u32 = 0x0010_0000;

/// Default stack commit for new threads
pub const DEFAULT_STACK_COMMIT: u32 = 0x1000;

/// Default base address of the synthetic thunk range
pub const DEFAULT_THUNK_BASE: GuestAddr = 0xF000_0000;

/// Number of TLS slots available to each process
pub const DEFAULT_TLS_SLOTS: u32 = 1088;

/// Operating system version reported to guests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    /// `VER_PLATFORM_WIN32_NT` is 2
    pub platform_id: u32,
    /// Service pack string (`szCSDVersion`)
    pub csd_version: String,
    pub service_pack_major: u16,
    pub service_pack_minor: u16,
    pub suite_mask: u16,
    /// `VER_NT_WORKSTATION` is 1
    pub product_type: u8,
}

impl VersionInfo {
    /// Windows XP Professional, Service Pack 2
    pub fn windows_xp_sp2() -> Self {
        Self {
            major: 5,
            minor: 1,
            build: 2600,
            platform_id: 2,
            csd_version: String::from("Service Pack 2"),
            service_pack_major: 2,
            service_pack_minor: 0,
            suite_mask: 0,
            product_type: 1,
        }
    }

    /// Packed value returned by `GetVersion`
    pub fn packed(&self) -> u32 {
        (self.build << 16) | ((self.minor & 0xFF) << 8) | (self.major & 0xFF)
    }
}

/// Kernel configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Stack reserve used when neither caller nor image specifies one
    pub default_stack_reserve: u32,
    /// Stack commit used when neither caller nor image specifies one
    pub default_stack_commit: u32,
    /// Initial size of each process's default heap
    pub process_heap_initial: u32,
    /// Maximum size of each process's default heap (0 = growable)
    pub process_heap_maximum: u32,
    /// Minimum number of bytes a heap grows by
    pub heap_growth_increment: u32,
    /// First synthetic address handed out for host callbacks
    pub thunk_base: GuestAddr,
    /// TLS slots per process
    pub tls_slots: u32,
    /// Cookie mixed into `EncodePointer` results
    pub pointer_cookie: u32,
    /// Environment given to the first process
    pub environment: Vec<(String, String)>,
    /// Loader search path for processes created by the guest
    pub search_paths: Vec<String>,
    /// Version reported by `GetVersion` and `GetVersionExA`
    pub version: VersionInfo,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_stack_reserve: DEFAULT_STACK_RESERVE,
            default_stack_commit: DEFAULT_STACK_COMMIT,
            process_heap_initial: 0x0001_0000,
            process_heap_maximum: 0,
            heap_growth_increment: 0x0001_0000,
            thunk_base: DEFAULT_THUNK_BASE,
            tls_slots: DEFAULT_TLS_SLOTS,
            pointer_cookie: 0x5EED_C0DE,
            environment: vec![
                (String::from("PATH"), String::from("C:\\WINDOWS\\system32;C:\\WINDOWS")),
                (String::from("SystemRoot"), String::from("C:\\WINDOWS")),
                (String::from("TEMP"), String::from("C:\\WINDOWS\\TEMP")),
            ],
            search_paths: Vec::new(),
            version: VersionInfo::windows_xp_sp2(),
        }
    }
}
