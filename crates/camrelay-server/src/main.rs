mod app;
mod config;
mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use camrelay_helpers::{logging, shutdown};
use config::Config;
use crate::core::{
    FramePipeline, ProcessedFrames, RateLimiter, Registry, run_housekeeping,
    run_status_fanout, run_ws_server,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "camrelay_server=info,tungstenite=warn,tokio=warn",
        "CAMRELAY_LOG",
        "camrelay-server",
    );

    let config = Config::load().context("failed to load configuration")?;

    info!(
        "broker starting: listen={}, pipeline_capacity={}, admission_timeout={:?}, rate_limit={}/{:?}",
        config.listen,
        config.pipeline_capacity,
        config.admission_timeout,
        config.rate_limit.max_connections,
        config.rate_limit.window
    );

    let (registry, status_rx) = Registry::new();
    let state = AppState {
        registry: Arc::new(registry),
        pipeline: Arc::new(FramePipeline::new(
            config.pipeline_capacity,
            config.admission_timeout,
        )),
        processed: Arc::new(ProcessedFrames::default()),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit.window,
            config.rate_limit.max_connections,
            config.rate_limit.exempt.clone(),
        )),
        config: Arc::new(config),
        shutdown: CancellationToken::new(),
    };

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    tokio::spawn(run_status_fanout(state.clone(), status_rx));
    tokio::spawn(run_housekeeping(state.clone()));

    let listen = state.config.listen.clone();
    run_ws_server(&listen, state).await
}
