use frame_snap::builder::FrameSourceBuilder;
use frame_snap::config::Config;
use frame_snap::snapshot;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load_or_default(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        name_match = config.camera.name_match,
        width = config.camera.width,
        height = config.camera.height,
        format = ?config.camera.format,
        output_dir = config.output.dir,
        duration_secs = config.capture.duration_secs,
        "starting frame-snap"
    );

    // Capture unavailable is a clean no-op, never a non-zero exit.
    let reader = match FrameSourceBuilder::from_config(&config.camera).build() {
        Some(reader) => reader,
        None => {
            info!("capture unavailable, nothing to do");
            return;
        }
    };

    let stats = snapshot::run_capture(
        reader,
        Path::new(&config.output.dir),
        Duration::from_secs(config.capture.duration_secs),
    )
    .await;

    info!(
        written = stats.written,
        skipped = stats.skipped,
        failed = stats.failed,
        "frame-snap finished"
    );
}
