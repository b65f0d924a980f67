//! Environment-variable configuration, read once at runtime init.

use std::env;

use tracing::{info, warn};

/// Layer configuration resolved from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerConfig {
    /// Minimum inter-frame interval in nanoseconds (from `LFX_MAX_FPS`).
    /// 0 = unlimited.
    pub target_frame_time: u64,
    /// Placebo mode (`LFX_PLACEBO`): all measurement and math run but no
    /// sleep is performed. Useful for comparison benchmarks.
    pub placebo: bool,
    /// Engine tick function address (`LFX_UE4_HOOK`, hex). The trampoline
    /// install is done by an external shim; the shim's hook must call
    /// `lfx_WaitAndBeginFrame` once per simulation tick, before input
    /// sampling.
    pub ue4_hook_addr: Option<usize>,
}

impl LayerConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let config = Self {
            target_frame_time: env::var("LFX_MAX_FPS")
                .ok()
                .map(|v| parse_max_fps(&v))
                .unwrap_or(0),
            placebo: env::var("LFX_PLACEBO").is_ok(),
            ue4_hook_addr: env::var("LFX_UE4_HOOK")
                .ok()
                .and_then(|v| parse_hook_addr(&v)),
        };
        if config.target_frame_time != 0 {
            info!(
                target_frame_time = config.target_frame_time,
                "setting target frame time from LFX_MAX_FPS"
            );
        }
        if config.placebo {
            info!("running in placebo mode");
        }
        if let Some(addr) = config.ue4_hook_addr {
            info!("engine tick hook address noted: {:#x}", addr);
        }
        config
    }
}

/// Convert an `LFX_MAX_FPS` value to a target frame time in nanoseconds.
/// Returns 0 (unlimited) for unparsable or zero input.
fn parse_max_fps(value: &str) -> u64 {
    match value.trim().parse::<u64>() {
        Ok(fps) if fps > 0 => 1_000_000_000 / fps,
        _ => {
            warn!(value, "ignoring invalid LFX_MAX_FPS");
            0
        }
    }
}

/// Parse an `LFX_UE4_HOOK` hex address, with or without a `0x` prefix.
fn parse_hook_addr(value: &str) -> Option<usize> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    match usize::from_str_radix(digits, 16) {
        Ok(addr) if addr != 0 => Some(addr),
        _ => {
            warn!(value, "ignoring invalid LFX_UE4_HOOK");
            None
        }
    }
}
