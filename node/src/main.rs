mod camera;
mod clock;
mod convert;
mod detect;
mod housekeeping;
mod http;
mod network;
mod persist;
mod sdcard;
mod stream;

use beecam_common::config::Config;
use beecam_common::naming::FileNamer;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use camera::{FramePool, SyntheticCamera};
use clock::{Clock, SystemClock};
use detect::MockDetector;
use http::{AppContext, Listener};
use persist::Persister;
use sdcard::{DirectoryHost, SdCard};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

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
        format = %config.camera.pixel_format,
        width = config.camera.width,
        height = config.camera.height,
        photo_dir = %config.storage.photo_dir().display(),
        naming = ?config.storage.naming,
        "bumblebee camera node starting"
    );

    // Network
    let (station, link_events) = network::host_link();
    tokio::spawn(network::run_link_supervisor(link_events, station));

    // Time
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.time.min_valid_year));
    clock::wait_for_time_sync(
        clock.as_ref(),
        config.time.sync_retries,
        Duration::from_secs(config.time.sync_interval_secs),
    )
    .await;

    // SD card
    let mut card = SdCard::new(Box::new(DirectoryHost), &config.storage);
    if let Err(e) = card.init() {
        error!(error = %e, "SD card init failed");
        std::process::exit(1);
    }
    let base_dir = PathBuf::from(&config.storage.base_dir);
    let photo_dir = match card.create_dir(&base_dir) {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "failed to create photo directory");
            std::process::exit(1);
        }
    };
    let mut namer = FileNamer::new(config.storage.naming);
    if let Err(e) = namer.seed_from_dir(&photo_dir) {
        error!(dir = %photo_dir.display(), error = %e, "failed to scan photo directory");
        std::process::exit(1);
    }
    match card.count_files(&base_dir) {
        Ok(count) => info!(dir = %photo_dir.display(), count, "files on card"),
        Err(e) => error!(error = %e, "could not count files on card"),
    }
    let persister = Persister::new(
        card,
        namer,
        Arc::clone(&clock),
        base_dir,
        config.camera.jpeg_quality,
    );

    // Camera
    let camera = match SyntheticCamera::new(&config.camera) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "camera initialization failed");
            std::process::exit(1);
        }
    };
    let pool = FramePool::new(
        camera,
        config.camera.fb_count,
        config.camera.grab_timeout_ms.map(Duration::from_millis),
    );

    // Web servers
    let burst_duration = match Duration::try_from_secs_f64(config.burst.duration_secs) {
        Ok(d) => d,
        Err(e) => {
            error!(duration_secs = config.burst.duration_secs, error = %e, "invalid burst duration");
            std::process::exit(1);
        }
    };
    let ctx = Arc::new(AppContext {
        pool: pool.clone(),
        persister,
        detector: Arc::new(MockDetector),
        quality: config.camera.jpeg_quality,
        burst_duration,
        burst_fps: config.burst.fps,
        stream_port: config.http.stream_port,
    });

    let bind: IpAddr = match config.http.bind_address.parse() {
        Ok(ip) => ip,
        Err(e) => {
            error!(address = config.http.bind_address, error = %e, "invalid bind address");
            std::process::exit(1);
        }
    };
    let control = match Listener::start(
        "control",
        SocketAddr::new(bind, config.http.control_port),
        http::control_router(Arc::clone(&ctx)),
    )
    .await
    {
        Ok(l) => l,
        Err(e) => {
            error!(port = config.http.control_port, error = %e, "failed to start control server");
            std::process::exit(1);
        }
    };
    let streaming = match Listener::start(
        "stream",
        SocketAddr::new(bind, config.http.stream_port),
        http::stream_router(Arc::clone(&ctx)),
    )
    .await
    {
        Ok(l) => l,
        Err(e) => {
            error!(port = config.http.stream_port, error = %e, "failed to start stream server");
            std::process::exit(1);
        }
    };

    info!(
        control = %control.local_addr(),
        stream = %streaming.local_addr(),
        frame_buffers = pool.capacity(),
        "system ready"
    );

    let housekeeping = tokio::spawn(housekeeping::run_housekeeping(Duration::from_secs(
        config.housekeeping.interval_secs,
    )));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    // Open streams end at their next frame once the pool is closed
    pool.close();
    control.shutdown(SHUTDOWN_GRACE).await;
    streaming.shutdown(SHUTDOWN_GRACE).await;
    housekeeping.abort();
}
