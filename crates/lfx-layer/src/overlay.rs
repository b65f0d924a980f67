//! Optional latency reporting into an already-loaded overlay.
//!
//! MangoHud exports `overlay_SetMetrics`; when the overlay is loaded into
//! the process we forward the measured latency to it. The overlay is never
//! loaded by us: resolution uses `RTLD_NOLOAD`, so an absent overlay simply
//! disables reporting.

use std::os::raw::c_char;

type PfnSetMetrics = unsafe extern "C" fn(*const *const c_char, *const f32, usize);

/// Handle to the overlay's metrics entry point.
#[derive(Clone, Copy)]
pub struct OverlaySink {
    set_metrics: PfnSetMetrics,
}

// SAFETY: a resolved function pointer into a library that stays loaded for
// the process lifetime.
unsafe impl Send for OverlaySink {}
unsafe impl Sync for OverlaySink {}

impl OverlaySink {
    /// Probe the process for a loaded overlay module. Returns `None` when
    /// the overlay or its symbol is absent.
    #[cfg(unix)]
    pub fn resolve() -> Option<Self> {
        use libloading::os::unix::{Library, RTLD_NOW};

        // Not exposed by libloading; same value on glibc and musl.
        const RTLD_NOLOAD: std::os::raw::c_int = 0x4;

        // SAFETY: RTLD_NOLOAD only bumps the refcount of a library that is
        // already mapped; no initialization code runs.
        let lib = unsafe { Library::open(Some("libMangoHud.so"), RTLD_NOW | RTLD_NOLOAD) }.ok()?;
        let set_metrics = unsafe {
            lib.get::<PfnSetMetrics>(b"overlay_SetMetrics\0")
                .map(|sym| *sym)
                .ok()?
        };
        // Keep the module referenced for the rest of the process lifetime.
        std::mem::forget(lib);
        Some(Self { set_metrics })
    }

    #[cfg(not(unix))]
    pub fn resolve() -> Option<Self> {
        None
    }

    /// Report the frame latency in milliseconds.
    pub fn report_latency(&self, latency_ms: f32) {
        let name: *const c_char = c"Latency".as_ptr();
        let names = [name];
        let values = [latency_ms];
        // SAFETY: the overlay reads `count` entries from both arrays during
        // the call and does not retain the pointers.
        unsafe { (self.set_metrics)(names.as_ptr(), values.as_ptr(), 1) };
    }
}
