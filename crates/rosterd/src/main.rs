use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod enrollment;
mod recognition;
mod recorder;

use config::{BusKind, Config};
use dbus_interface::{RosterService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rosterd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        db = %config.db_path.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let policy = config.match_policy();
    let min_cosine = policy.min_cosine_for_unit_descriptors();
    if min_cosine > 0.8 {
        tracing::warn!(
            match_threshold = policy.threshold,
            min_confidence = policy.min_confidence,
            min_cosine,
            "match policy is stricter than SFace calibration; set match_threshold = {} and min_confidence = 0",
            roster_core::matcher::SFACE_MATCH_THRESHOLD
        );
    }

    let store = roster_store::Store::open(&config.db_path)
        .await
        .context("failed to open attendance store")?;

    // Open the frame source and load both models synchronously (fail-fast)
    let source = roster_hw::open_source(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    let analyzer = roster_core::OnnxAnalyzer::load(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
    )
    .context("failed to load face models")?;
    let engine = engine::spawn_engine(source, analyzer, config.warmup_frames)?;

    let bus = config.bus;
    let service = RosterService::new(Arc::new(config), store, engine);

    let builder = match bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rosterd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rosterd shutting down");

    Ok(())
}
