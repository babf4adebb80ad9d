mod mjpeg;

use beecam_common::config::Config;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
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
        url = config.capture.stream_url,
        output_dir = %config.capture.output_dir.display(),
        every_nth = config.capture.every_nth,
        naming = ?config.capture.naming,
        "starting training-data capture"
    );

    let mut writer = match mjpeg::FrameWriter::open(&config.capture) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to prepare output directory");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = mjpeg::run_capture(&config.capture.stream_url, &mut writer) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("capture stopped");
        }
    }
}
