use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{FramePipeline, ProcessedFrames, RateLimiter, Registry};

/// Shared handles threaded through the accept loop, the sessions, and the
/// housekeeping tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub pipeline: Arc<FramePipeline>,
    pub processed: Arc<ProcessedFrames>,
    pub limiter: Arc<RateLimiter>,
    pub shutdown: CancellationToken,
}
