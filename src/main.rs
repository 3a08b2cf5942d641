use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use checkin_bot::api::{ApiClient, RecognitionClient};
use checkin_bot::call::{CallManager, CallManagerConfig};
use checkin_bot::client::GatewayClient;
use checkin_bot::config::{FaceConfig, GatewayConfig, RetryPolicy};
use checkin_bot::detect::FaceDetector;
use checkin_bot::telemetry;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    telemetry::init()?;

    let gateway_config = GatewayConfig::from_env().context("gateway configuration")?;
    info!(bot_id = gateway_config.bot_id, "starting check-in bot");

    let client =
        GatewayClient::new(gateway_config, RetryPolicy::default()).context("gateway client")?;
    client.login().await.context("login failed")?;

    let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into());
    let api = ApiClient::from_env().context("api client")?;
    let recognition = RecognitionClient::new(api, &base_url).context("recognition client")?;

    let manager_config = CallManagerConfig::default();
    let detector = build_detector(&manager_config.face)?;
    let manager = CallManager::new(
        Arc::clone(&client),
        recognition,
        detector,
        manager_config,
    )
    .context("call manager")?;

    info!("bot started, waiting for calls");
    wait_for_shutdown().await?;

    info!("shutting down");
    manager.shutdown_all().await;
    client.close().await;
    info!("done");
    Ok(())
}

#[cfg(feature = "haar")]
fn build_detector(face: &FaceConfig) -> Result<Option<Arc<dyn FaceDetector>>> {
    if !face.enabled {
        return Ok(None);
    }
    let detector = checkin_bot::detect::haar::HaarFaceDetector::load(&face.cascade_path)
        .context("face cascade")?;
    info!(path = %face.cascade_path, "face detector loaded");
    Ok(Some(Arc::new(detector)))
}

#[cfg(not(feature = "haar"))]
fn build_detector(face: &FaceConfig) -> Result<Option<Arc<dyn FaceDetector>>> {
    if face.enabled {
        warn!("built without the `haar` feature, face detection is disabled");
    }
    Ok(None)
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("sigterm handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("terminate received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("interrupt received");
    Ok(())
}
