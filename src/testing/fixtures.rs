// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Deterministic collaborators

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::mm::GuestAddr;
use crate::traits::{Clock, Console, GuestMemory, ImageLoader, ImportResolver, LoadRequest, LoadedImage, StdStream};

/// Offset of the entry point inside a test image
pub const ENTRY_OFFSET: u32 = 0x100;

/// Offset of the import address table inside a test image
pub const IAT_OFFSET: u32 = 0x800;

/// ============================================================================
/// Loader
/// ============================================================================

/// Shape of an image the test loader can "load"
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Bytes mapped for the image
    pub size: u32,
    pub stack_commit: u32,
    pub stack_reserve: u32,
    /// kernel32 imports bound into the IAT at load time
    pub imports: Vec<&'static str>,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            size: 0x2000,
            stack_commit: 0,
            stack_reserve: 0x4000,
            imports: vec!["GetCommandLineA", "ExitProcess"],
        }
    }
}

/// Loader serving a fixed set of named images
#[derive(Debug, Default, Clone)]
pub struct TestLoader {
    images: HashMap<String, ImageSpec>,
    loaded: Rc<RefCell<Vec<LoadedImage>>>,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` loadable
    pub fn with_image(mut self, name: &str, spec: ImageSpec) -> Self {
        self.images.insert(name.to_ascii_lowercase(), spec);
        self
    }

    /// Every image loaded so far, shared with clones of this loader
    pub fn loaded(&self) -> Vec<LoadedImage> {
        self.loaded.borrow().clone()
    }
}

impl ImageLoader for TestLoader {
    fn load(
        &mut self,
        memory: &mut dyn GuestMemory,
        imports: &mut dyn ImportResolver,
        request: &LoadRequest<'_>,
    ) -> Option<LoadedImage> {
        let file = request.name.rsplit(['\\', '/']).next().unwrap_or(request.name);
        let key = file.to_ascii_lowercase();
        let spec = self.images.get(&key)?;

        let base = memory.alloc_pages(spec.size)?;
        for (i, name) in spec.imports.iter().enumerate() {
            let thunk = imports.resolve("kernel32.dll", name);
            memory.write_u32(base + IAT_OFFSET + 4 * i as u32, thunk).ok()?;
        }

        let image = LoadedImage {
            name: key.clone(),
            path: format!("{}\\{}", request.cwd.trim_end_matches('\\'), key),
            base,
            entry: base + ENTRY_OFFSET,
            stack_commit: spec.stack_commit,
            stack_reserve: spec.stack_reserve,
        };
        self.loaded.borrow_mut().push(image.clone());
        Some(image)
    }
}

/// ============================================================================
/// Clock
/// ============================================================================

/// Wall-clock reading of a [`ManualClock`] at zero (2010-01-01 00:00 UTC)
pub const MANUAL_CLOCK_EPOCH_MS: u64 = 1_262_304_000_000;

/// Clock that only moves when told to, or when the kernel idles
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    /// Move time forward
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn system_time_ms(&self) -> u64 {
        MANUAL_CLOCK_EPOCH_MS + self.now.get()
    }

    fn sleep_until(&mut self, deadline_ms: u64) {
        if deadline_ms > self.now.get() {
            self.now.set(deadline_ms);
        }
    }
}

/// ============================================================================
/// Console
/// ============================================================================

/// Console recording output and serving scripted input
#[derive(Debug, Default, Clone)]
pub struct CaptureConsole {
    output: Rc<RefCell<Vec<u8>>>,
    error: Rc<RefCell<Vec<u8>>>,
    input: Rc<RefCell<VecDeque<u8>>>,
}

impl CaptureConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for `ReadFile` on standard input
    pub fn push_input(&self, data: &[u8]) {
        self.input.borrow_mut().extend(data.iter().copied());
    }

    /// Everything written to standard output
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }

    /// Everything written to standard error
    pub fn error(&self) -> String {
        String::from_utf8_lossy(&self.error.borrow()).into_owned()
    }
}

impl Console for CaptureConsole {
    fn write(&mut self, stream: StdStream, data: &[u8]) -> usize {
        let sink = match stream {
            StdStream::Error => &self.error,
            _ => &self.output,
        };
        sink.borrow_mut().extend_from_slice(data);
        data.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut input = self.input.borrow_mut();
        let n = buf.len().min(input.len());
        for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// Allocate a zeroed scratch page in guest memory
pub fn scratch_page(memory: &mut dyn GuestMemory) -> GuestAddr {
    memory.alloc_pages(crate::mm::PAGE_SIZE).expect("scratch page")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::memory::FlatMemory;

    struct Recorder(Vec<String>);

    impl ImportResolver for Recorder {
        fn resolve(&mut self, _module: &str, name: &str) -> GuestAddr {
            self.0.push(name.to_string());
            0xF000_0000 + 4 * (self.0.len() as u32 - 1)
        }
    }

    #[test]
    fn test_loader_binds_imports() {
        let mut loader = TestLoader::new().with_image("App.exe", ImageSpec::default());
        let mut mem = FlatMemory::new();
        let mut recorder = Recorder(Vec::new());
        let request = LoadRequest { name: "C:\\bin\\APP.EXE", search_paths: &[], cwd: "C:\\work" };

        let image = loader.load(&mut mem, &mut recorder, &request).unwrap();
        assert_eq!(image.entry, image.base + ENTRY_OFFSET);
        assert_eq!(image.path, "C:\\work\\app.exe");
        assert_eq!(recorder.0, ["GetCommandLineA", "ExitProcess"]);
        assert_eq!(mem.read_u32(image.base + IAT_OFFSET + 4).unwrap(), 0xF000_0004);
        assert_eq!(loader.loaded().len(), 1);

        let missing = LoadRequest { name: "other.exe", search_paths: &[], cwd: "C:\\" };
        assert!(loader.load(&mut mem, &mut recorder, &missing).is_none());
    }

    #[test]
    fn test_manual_clock() {
        let mut clock = ManualClock::new();
        let shared = clock.clone();
        shared.advance(10);
        assert_eq!(clock.now_ms(), 10);
        clock.sleep_until(25);
        assert_eq!(shared.now(), 25);
        clock.sleep_until(5);
        assert_eq!(shared.now(), 25);
    }

    #[test]
    fn test_capture_console() {
        let mut console = CaptureConsole::new();
        let shared = console.clone();
        console.write(StdStream::Output, b"hello");
        console.write(StdStream::Error, b"oops");
        assert_eq!(shared.output(), "hello");
        assert_eq!(shared.error(), "oops");

        shared.push_input(b"abc");
        let mut buf = [0u8; 2];
        assert_eq!(console.read(&mut buf), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(console.read(&mut buf), 1);
        assert_eq!(console.read(&mut buf), 0);
    }
}
