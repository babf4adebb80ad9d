use beecam_common::config::CaptureConfig;
use beecam_common::multipart::MultipartParser;
use beecam_common::naming::{is_artifact_name, FileNamer, Stamp};
use chrono::Local;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::CaptureError;

/// Writes every `every_nth` received frame into the output directory.
pub struct FrameWriter {
    dir: PathBuf,
    namer: FileNamer,
    every_nth: u64,
    received: u64,
    saved: u64,
    started: Instant,
}

impl FrameWriter {
    /// Creates `dir` if needed and resumes numbering after existing files.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let dir = config.output_dir.clone();
        std::fs::create_dir_all(&dir).map_err(|e| CaptureError::Io(dir.clone(), e))?;
        let mut namer = FileNamer::new(config.naming);
        namer
            .seed_from_dir(&dir)
            .map_err(|e| CaptureError::Io(dir.clone(), e))?;
        let existing = count_artifacts(&dir).map_err(|e| CaptureError::Io(dir.clone(), e))?;
        info!(dir = %dir.display(), existing, "output directory ready");

        Ok(Self {
            dir,
            namer,
            every_nth: config.every_nth.max(1),
            received: 0,
            saved: 0,
            started: Instant::now(),
        })
    }

    /// Returns the path written, or `None` when the frame was skipped.
    pub fn accept(&mut self, jpeg: &[u8]) -> Result<Option<PathBuf>, CaptureError> {
        self.received += 1;
        if (self.received - 1) % self.every_nth != 0 {
            return Ok(None);
        }
        let stamp = Stamp {
            wall: Some(Local::now().naive_local()),
            uptime: self.started.elapsed(),
        };
        let path = self.dir.join(self.namer.next_photo(stamp));
        std::fs::write(&path, jpeg).map_err(|e| CaptureError::Io(path.clone(), e))?;
        self.saved += 1;
        debug!(path = %path.display(), bytes = jpeg.len(), "frame saved");
        Ok(Some(path))
    }

    pub fn saved(&self) -> u64 {
        self.saved
    }
}

fn count_artifacts(dir: &Path) -> std::io::Result<usize> {
    Ok(std::fs::read_dir(dir)?
        .flatten()
        .filter(|entry| entry.file_name().to_str().is_some_and(is_artifact_name))
        .count())
}

/// Consume the camera stream, reconnecting with exponential backoff.
pub async fn run_capture(url: &str, writer: &mut FrameWriter) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url, "connecting to camera stream");
        match consume_stream(url, writer).await {
            Ok(()) => {
                info!(saved = writer.saved(), "stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

pub async fn consume_stream(url: &str, writer: &mut FrameWriter) -> Result<(), CaptureError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(CaptureError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(CaptureError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(CaptureError::HttpStatus(response.status().as_u16()));
    }
    info!(status = %response.status(), "connected to camera stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(CaptureError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            if let Err(e) = writer.accept(&jpeg) {
                warn!(error = %e, "failed to save frame");
            }
        }
    }

    debug!(pending = parser.pending(), "stream closed, dropping partial part");
    Ok(())
}
