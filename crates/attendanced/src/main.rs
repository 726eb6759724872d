use anyhow::{Context, Result};
use attendance_core::{annotate, Config, ScrfdDetector};
use attendance_hw::V4lDevice;
use std::sync::Arc;
use tiny_http::Server;
use tracing_subscriber::EnvFilter;

mod engine;
mod http;
mod stream;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendanced starting");

    let config = Config::load().context("loading configuration")?;
    tracing::debug!(?config, "configuration");
    if config.danger_secret.is_none() {
        tracing::warn!("no danger secret configured; bulk clear is disabled");
    }
    if let Some(path) = &config.label_font {
        annotate::set_label_font(path).context("loading label font")?;
    }

    // Fail fast on a missing detector model; the camera is opened per stream.
    let model_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&model_path)
        .with_context(|| format!("loading detector from {}", model_path.display()))?;
    tracing::info!(path = %model_path.display(), "SCRFD detector loaded");

    let device = V4lDevice::new(config.camera_device.clone(), config.warmup_frames);
    let listen_addr = config.listen_addr.clone();
    let engine = Arc::new(engine::Engine::new(config, device, detector)?);

    let server = Server::http(&listen_addr)
        .map_err(|e| anyhow::anyhow!("binding {listen_addr}: {e}"))?;
    let server = Arc::new(server);
    tracing::info!(addr = %listen_addr, "attendanced ready");

    let listener = tokio::task::spawn_blocking({
        let server = Arc::clone(&server);
        let engine = Arc::clone(&engine);
        move || http::serve(&server, &engine)
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendanced shutting down");
    server.unblock();
    listener.await?;

    Ok(())
}
