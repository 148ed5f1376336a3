//! Optional packet analyzer plugin (spec §4.7): an external
//! collaborator loaded from a shared object at a configured path.
//!
//! Safe-mode isolation wraps each `analyze()` call in
//! `std::panic::catch_unwind` rather than the original's
//! signal-based segfault guard (SPEC_FULL.md §E) — this is the
//! documented limitation: a genuine SIGSEGV inside the `.so` still
//! aborts the process, `catch_unwind` only contains Rust panics raised
//! across the FFI boundary by a well-behaved (if buggy) plugin.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::AnalyzerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Safe,
    Fast,
}

type InitFn = unsafe extern "C" fn() -> i32;
type AllocateFn = unsafe extern "C" fn() -> u64;
type ReleaseFn = unsafe extern "C" fn(u64);
type AnalyzeFn = unsafe extern "C" fn(conn_id: u64, from_client: i32, buf: *const u8, len: usize) -> u64;

struct Plugin {
    _lib: Library,
    init: Symbol<'static, InitFn>,
    allocate: Symbol<'static, AllocateFn>,
    release: Symbol<'static, ReleaseFn>,
    analyze: Symbol<'static, AnalyzeFn>,
}

/// Owns the (optional) loaded plugin and the enable/mode/refcount
/// state the admin interface and relay consult.
pub struct Analyzer {
    plugin: Mutex<Option<Plugin>>,
    enabled: AtomicBool,
    mode: Mutex<Mode>,
    live_handles: AtomicU64,
    faulted: AtomicBool,
}

impl Default for Analyzer {
    fn default() -> Self {
        Analyzer {
            plugin: Mutex::new(None),
            enabled: AtomicBool::new(false),
            mode: Mutex::new(Mode::Safe),
            live_handles: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
        }
    }
}

impl Analyzer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn load(&self, path: &str) -> Result<(), AnalyzerError> {
        // Symbols borrow from the `Library`; leaking the underlying
        // fd table lifetime to `'static` is sound here because
        // `Plugin` keeps the `Library` alive for exactly as long as
        // the symbols are used, and is dropped as a unit.
        unsafe {
            let lib = Library::new(path).map_err(|source| AnalyzerError::Load {
                path: path.to_string(),
                source,
            })?;
            let init: Symbol<InitFn> = lib
                .get(b"init")
                .map_err(|_| AnalyzerError::MissingSymbol("init"))?;
            let allocate: Symbol<AllocateFn> = lib
                .get(b"allocate")
                .map_err(|_| AnalyzerError::MissingSymbol("allocate"))?;
            let release: Symbol<ReleaseFn> = lib
                .get(b"release")
                .map_err(|_| AnalyzerError::MissingSymbol("release"))?;
            let analyze: Symbol<AnalyzeFn> = lib
                .get(b"analyze")
                .map_err(|_| AnalyzerError::MissingSymbol("analyze"))?;

            let init: Symbol<'static, InitFn> = std::mem::transmute(init);
            let allocate: Symbol<'static, AllocateFn> = std::mem::transmute(allocate);
            let release: Symbol<'static, ReleaseFn> = std::mem::transmute(release);
            let analyze: Symbol<'static, AnalyzeFn> = std::mem::transmute(analyze);

            (init)();

            *self.plugin.lock() = Some(Plugin {
                _lib: lib,
                init,
                allocate,
                release,
                analyze,
            });
        }
        self.faulted.store(false, Ordering::Release);
        info!(path, "analyzer plugin loaded");
        Ok(())
    }

    /// Unloads the plugin once every outstanding handle has been
    /// released. Blocks the admin thread only as long as it takes
    /// in-flight relay calls to finish their current `analyze()`.
    pub fn unload(&self) {
        self.enabled.store(false, Ordering::Release);
        while self.live_handles.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        *self.plugin.lock() = None;
        info!("analyzer plugin unloaded");
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && self.plugin.lock().is_some()
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    pub fn allocate_handle(&self) -> Option<u64> {
        let plugin = self.plugin.lock();
        let plugin = plugin.as_ref()?;
        let handle = unsafe { (plugin.allocate)() };
        self.live_handles.fetch_add(1, Ordering::AcqRel);
        Some(handle)
    }

    pub fn release_handle(&self, handle: u64) {
        let plugin = self.plugin.lock();
        if let Some(plugin) = plugin.as_ref() {
            unsafe { (plugin.release)(handle) };
        }
        self.live_handles.fetch_sub(1, Ordering::AcqRel);
    }

    /// Runs `analyze()` against the current chunk. Returns `None` (and
    /// disables the plugin for all subsequent traffic) if the plugin
    /// faulted or isn't loaded — the caller is expected to continue
    /// the relay without analyzer input in that case, per §4.7's
    /// "disabled for all subsequent traffic" behavior.
    pub fn analyze(&self, conn_id: u64, from_client: bool, buf: &[u8]) -> Option<u64> {
        if !self.is_enabled() || self.faulted.load(Ordering::Acquire) {
            return None;
        }
        let plugin = self.plugin.lock();
        let Some(plugin) = plugin.as_ref() else {
            return None;
        };

        let mode = self.mode();
        let ptr = buf.as_ptr();
        let len = buf.len();
        let analyze_fn = &plugin.analyze;
        let call = AssertUnwindSafe(|| unsafe { (analyze_fn)(conn_id, from_client as i32, ptr, len) });

        match mode {
            Mode::Fast => Some(call()),
            Mode::Safe => match panic::catch_unwind(call) {
                Ok(result) => Some(result),
                Err(_) => {
                    error!(conn_id, "analyzer panicked during analyze(), disabling plugin");
                    self.faulted.store(true, Ordering::Release);
                    self.enabled.store(false, Ordering::Release);
                    None
                }
            },
        }
    }
}

// `Library`/`Symbol` are not `Send`/`Sync` by default in libloading's
// type signature on some platforms; the plugin ABI contract (spec
// §4.7) requires it to be safely callable from the single relay
// thread that owns the `Mutex<Option<Plugin>>`, so this is sound as
// long as nothing else touches the raw symbols.
unsafe impl Send for Plugin {}
unsafe impl Sync for Plugin {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_analyzer_returns_none() {
        let analyzer = Analyzer::new();
        assert_eq!(analyzer.analyze(1, true, b"hello"), None);
    }

    #[test]
    fn mode_defaults_to_safe() {
        let analyzer = Analyzer::new();
        assert_eq!(analyzer.mode(), Mode::Safe);
    }
}
