//! LatencyFleX Vulkan layer.
//!
//! A vendor-agnostic input-to-photon latency reducer. The layer watches the
//! application's presents through the Vulkan layer chain, measures when each
//! frame's GPU work really finishes, and tells the simulation thread how
//! long to sleep before the next tick so the render queue stays at a minimal
//! but non-zero depth.
//!
//! The application (or an engine hook) drives the simulation side through
//! two exported symbols:
//!
//! - [`lfx_WaitAndBeginFrame`] — call once per simulation tick, before input
//!   sampling.
//! - [`lfx_SetTargetFrameTime`] — optional FPS floor; 0 disables it.
//!
//! Environment: `LFX_MAX_FPS` caps the frame rate, `LFX_PLACEBO` disables
//! sleeping for A/B benchmarking, `LFX_UE4_HOOK` carries the engine tick
//! address for an external injection shim.

pub mod config;
pub mod dispatch;
pub mod fence_wait;
pub mod layer;
pub mod overlay;
pub mod ticker;

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;

use crate::config::LayerConfig;
use crate::dispatch::LayerState;
use crate::ticker::FrameTicker;

/// Process-wide layer runtime: the frame ticker plus the Vulkan dispatch
/// bookkeeping.
pub struct LfxRuntime {
    pub ticker: Arc<FrameTicker>,
    pub layer_state: Mutex<LayerState>,
}

/// The runtime singleton, built on first use. Construction reads the
/// environment and installs logging before anything is published, so no
/// unsynchronized setup writes are ever visible to other threads.
pub fn runtime() -> &'static LfxRuntime {
    static RUNTIME: OnceLock<LfxRuntime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        init_tracing();
        info!(version = env!("CARGO_PKG_VERSION"), "module loaded");
        let config = LayerConfig::from_env();
        LfxRuntime {
            ticker: Arc::new(FrameTicker::new(
                config.placebo,
                config.target_frame_time,
                None,
            )),
            layer_state: Mutex::new(LayerState::default()),
        }
    })
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Another consumer in the process may already have installed a
    // subscriber; diagnostics are best effort.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Sleep until the pacer's wake target and begin the next simulation frame.
///
/// Call once per simulation tick, before input sampling. An engine hook
/// installed via `LFX_UE4_HOOK` calls this from its tick trampoline.
#[no_mangle]
pub extern "C" fn lfx_WaitAndBeginFrame() {
    runtime().ticker.wait_and_begin_frame();
}

/// Set the minimum inter-frame interval in nanoseconds. 0 disables the FPS
/// floor.
#[no_mangle]
pub extern "C" fn lfx_SetTargetFrameTime(target_frame_time: u64) {
    info!(target_frame_time, "setting target frame time");
    runtime().ticker.set_target_frame_time(target_frame_time);
}
