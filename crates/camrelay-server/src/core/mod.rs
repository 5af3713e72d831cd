mod broadcast;
mod pipeline;
mod ratelimit;
mod registry;
mod server;
mod session;

use std::time::{SystemTime, UNIX_EPOCH};

pub use broadcast::run_status_fanout;
pub use pipeline::{FramePipeline, ProcessedFrames, run_housekeeping};
pub use ratelimit::RateLimiter;
pub use registry::Registry;
pub use server::run_ws_server;

/// Current unix time in fractional seconds, the timestamp unit of the wire
/// schema.
pub(crate) fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
