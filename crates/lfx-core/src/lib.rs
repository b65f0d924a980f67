//! LatencyFleX frame pacing core.
//!
//! Tracks per-frame latency and throughput of a rendering pipeline and
//! computes how long the simulation thread should sleep before each frame so
//! that the GPU queue stays at a minimal but non-zero depth. The math lives
//! here; Vulkan interception lives in the `lfx-layer` crate.
//!
//! All timestamps are nanoseconds in a single monotonic clock domain (see
//! [`clock::current_time_ns`]).

pub mod clock;
pub mod ewma;
pub mod idle;
pub mod pacer;

pub use clock::current_time_ns;
pub use ewma::EwmaEstimator;
pub use idle::IdleTracker;
pub use pacer::FramePacer;
