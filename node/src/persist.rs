use axum::http::StatusCode;
use beecam_common::naming::FileNamer;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::camera::{CameraError, FramePool, JpegFrame};
use crate::clock::Clock;
use crate::convert::{self, ConvertError};
use crate::detect::Detector;
use crate::sdcard::{SdCard, SdError};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error("out of memory: {0}")]
    Allocation(ConvertError),
    #[error("frame conversion failed: {0}")]
    Conversion(ConvertError),
    #[error("JPEG encoding failed: {0}")]
    Encode(ConvertError),
    #[error("SD card not mounted")]
    NotMounted,
    #[error("could not open file: {0}")]
    FileOpen(SdError),
    #[error("incomplete write: {0}")]
    ShortWrite(SdError),
    #[error("SD card error: {0}")]
    Storage(SdError),
    #[error("no free filename after {0} attempts")]
    NamesExhausted(usize),
    #[error("worker task failed: {0}")]
    Task(String),
}

impl PersistError {
    pub fn status(&self) -> StatusCode {
        match self {
            PersistError::Camera(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short German message shown to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            PersistError::Camera(_) => "Fehler: Kamera",
            PersistError::Allocation(_) => "Fehler: Speicher",
            PersistError::Conversion(_) => "Fehler: Konvertierung",
            PersistError::Encode(_) => "Fehler: Kodierung",
            PersistError::NotMounted
            | PersistError::FileOpen(_)
            | PersistError::ShortWrite(_)
            | PersistError::Storage(_)
            | PersistError::NamesExhausted(_)
            | PersistError::Task(_) => "Fehler: SD-Karte",
        }
    }
}

impl From<SdError> for PersistError {
    fn from(e: SdError) -> Self {
        match e {
            SdError::NotMounted => PersistError::NotMounted,
            SdError::FileOpen(..) => PersistError::FileOpen(e),
            SdError::ShortWrite { .. } | SdError::Write { .. } => PersistError::ShortWrite(e),
            other => PersistError::Storage(other),
        }
    }
}

/// Uncompressed RGB888 copy of one frame.
#[derive(Debug)]
pub struct Truecolor {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPhoto {
    pub name: String,
    pub path: PathBuf,
    pub bytes: usize,
}

#[derive(Debug)]
pub struct Detection {
    pub count: usize,
    /// `None` when the annotated copy could not be stored.
    pub saved: Option<SavedPhoto>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BurstReport {
    pub saved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Artifact {
    Photo,
    Detection(usize),
}

// Upper bound on names skipped because the file already exists.
const MAX_NAME_ATTEMPTS: usize = 16;

/// Writes snapshots to the card. All SD access goes through the card
/// mutex, so concurrent requests are serialized.
#[derive(Clone)]
pub struct Persister {
    card: Arc<Mutex<SdCard>>,
    namer: Arc<Mutex<FileNamer>>,
    clock: Arc<dyn Clock>,
    photo_dir: PathBuf,
    quality: u8,
}

impl Persister {
    pub fn new(
        card: SdCard,
        namer: FileNamer,
        clock: Arc<dyn Clock>,
        photo_dir: impl Into<PathBuf>,
        quality: u8,
    ) -> Self {
        Self {
            card: Arc::new(Mutex::new(card)),
            namer: Arc::new(Mutex::new(namer)),
            clock,
            photo_dir: photo_dir.into(),
            quality,
        }
    }

    pub fn photo_dir(&self) -> &Path {
        &self.photo_dir
    }

    /// Grab one frame and convert it to RGB888. The native frame goes back
    /// to the driver as soon as conversion finishes, whatever the outcome.
    pub async fn capture_truecolor(&self, pool: &FramePool) -> Result<Truecolor, PersistError> {
        let guard = pool.acquire().await?;
        tokio::task::spawn_blocking(move || -> Result<Truecolor, PersistError> {
            let info = guard.info();
            // Early return drops the guard
            let mut rgb =
                convert::alloc_truecolor(info.width, info.height).map_err(PersistError::Allocation)?;
            let converted = convert::to_rgb888(guard.data(), &info, &mut rgb);
            drop(guard);
            converted.map_err(PersistError::Conversion)?;
            Ok(Truecolor {
                rgb,
                width: info.width,
                height: info.height,
            })
        })
        .await
        .map_err(|e| PersistError::Task(e.to_string()))?
    }

    pub async fn save_photo(&self, pool: &FramePool) -> Result<SavedPhoto, PersistError> {
        let frame = self.capture_truecolor(pool).await?;
        let jpeg = self.encode(frame).await?;
        let saved = self.store(JpegFrame::Owned(jpeg), Artifact::Photo).await?;
        info!(name = %saved.name, bytes = saved.bytes, "photo saved");
        Ok(saved)
    }

    /// Count bees in one frame and keep a copy tagged with the count.
    ///
    /// Camera and conversion failures fail the whole request; a failed
    /// write only loses the copy.
    pub async fn save_detection(
        &self,
        pool: &FramePool,
        detector: &dyn Detector,
    ) -> Result<Detection, PersistError> {
        let frame = self.capture_truecolor(pool).await?;
        let count = detector.count(&frame.rgb, frame.width, frame.height);
        info!(detector = detector.name(), count, "detection finished");

        let jpeg = self.encode(frame).await?;
        let saved = match self.store(JpegFrame::Owned(jpeg), Artifact::Detection(count)).await {
            Ok(saved) => Some(saved),
            Err(e) => {
                warn!(error = %e, "could not store detection image");
                None
            }
        };
        Ok(Detection { count, saved })
    }

    /// Store an already-encoded JPEG under the next photo name.
    pub async fn save_jpeg(&self, jpeg: JpegFrame) -> Result<SavedPhoto, PersistError> {
        self.store(jpeg, Artifact::Photo).await
    }

    /// Save frames at `fps` until `duration` has passed. JPEG frames from
    /// the driver are written directly without re-encoding.
    pub async fn burst(&self, pool: &FramePool, duration: Duration, fps: f64) -> BurstReport {
        let period = Duration::from_secs_f64(1.0 / fps.max(0.01));
        let started = Instant::now();
        let mut report = BurstReport::default();
        info!(?duration, fps, "burst started");

        while let Some(remaining) = duration.checked_sub(started.elapsed()) {
            if remaining.is_zero() {
                break;
            }
            let tick = Instant::now();
            match self.burst_frame(pool, remaining).await {
                Ok(saved) => {
                    debug!(name = %saved.name, "burst frame saved");
                    report.saved += 1;
                }
                Err(e) => {
                    warn!(error = %e, "burst frame failed");
                    report.failed += 1;
                }
            }
            tokio::time::sleep(period.saturating_sub(tick.elapsed())).await;
        }

        info!(saved = report.saved, failed = report.failed, "burst finished");
        report
    }

    async fn burst_frame(&self, pool: &FramePool, remaining: Duration) -> Result<SavedPhoto, PersistError> {
        let guard = pool.acquire_with_timeout(Some(remaining)).await?;
        let quality = self.quality;
        let jpeg = tokio::task::spawn_blocking(move || JpegFrame::from_guard(guard, quality))
            .await
            .map_err(|e| PersistError::Task(e.to_string()))?
            .map_err(PersistError::Encode)?;
        self.save_jpeg(jpeg).await
    }

    /// Number of files in the photo directory.
    pub async fn file_count(&self) -> Result<usize, PersistError> {
        let card = Arc::clone(&self.card);
        let dir = self.photo_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, PersistError> {
            let card = card.lock().map_err(|_| PersistError::Task("card lock poisoned".into()))?;
            Ok(card.count_files(&dir)?)
        })
        .await
        .map_err(|e| PersistError::Task(e.to_string()))?
    }

    async fn encode(&self, frame: Truecolor) -> Result<Vec<u8>, PersistError> {
        let quality = self.quality;
        tokio::task::spawn_blocking(move || {
            convert::encode_jpeg(&frame.rgb, frame.width, frame.height, quality)
        })
        .await
        .map_err(|e| PersistError::Task(e.to_string()))?
        .map_err(PersistError::Encode)
    }

    // The JPEG (and any driver frame behind it) is dropped once the write
    // has finished.
    async fn store(&self, jpeg: JpegFrame, artifact: Artifact) -> Result<SavedPhoto, PersistError> {
        let card = Arc::clone(&self.card);
        let namer = Arc::clone(&self.namer);
        let stamp = self.clock.stamp();
        let dir = self.photo_dir.clone();

        tokio::task::spawn_blocking(move || -> Result<SavedPhoto, PersistError> {
            let card = card.lock().map_err(|_| PersistError::Task("card lock poisoned".into()))?;
            let mut namer = namer
                .lock()
                .map_err(|_| PersistError::Task("namer lock poisoned".into()))?;

            let mut chosen = None;
            for _ in 0..MAX_NAME_ATTEMPTS {
                let name = match artifact {
                    Artifact::Photo => namer.next_photo(stamp),
                    Artifact::Detection(count) => namer.next_detection(stamp, count),
                };
                if !card.exists(&dir, &name)? {
                    chosen = Some(name);
                    break;
                }
                debug!(name = %name, "file exists, picking next name");
            }
            let name = chosen.ok_or(PersistError::NamesExhausted(MAX_NAME_ATTEMPTS))?;

            let path = card.write_file(&dir, &name, jpeg.bytes()).map_err(|e| {
                error!(name = %name, error = %e, "write failed");
                PersistError::from(e)
            })?;
            Ok(SavedPhoto {
                bytes: jpeg.len(),
                name,
                path,
            })
        })
        .await
        .map_err(|e| PersistError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::*;
    use crate::clock::testing::ManualClock;
    use crate::detect::MockDetector;
    use crate::sdcard::testing::{full_card, mounted_card, storage_config};
    use crate::sdcard::DirectoryHost;
    use beecam_common::frame::{FrameInfo, PixelFormat};
    use beecam_common::naming::NamingScheme;
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn persister(root: &Path, scheme: NamingScheme) -> Persister {
        let card = mounted_card(root);
        card.create_dir(Path::new("BeeSense")).unwrap();
        Persister::new(
            card,
            FileNamer::new(scheme),
            Arc::new(ManualClock::unsynced()),
            "BeeSense",
            80,
        )
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn qvga_rgb565_saves_one_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        let camera = Arc::new(ScriptedCamera::rgb565(320, 240));
        let pool = FramePool::new(camera.clone(), 1, None);

        let saved = persister.save_photo(&pool).await.unwrap();

        assert_eq!(saved.name, "photo000.jpg");
        assert_eq!(files_in(&dir.path().join("BeeSense")), vec!["photo000.jpg"]);
        let data = std::fs::read(&saved.path).unwrap();
        assert_eq!(data.len(), saved.bytes);
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(camera.grabs(), 1);
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn camera_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Fail]));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(err, PersistError::Camera(_)));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(camera.grabs(), camera.releases());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn allocation_failure_releases_frame() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        // Declared geometry is far beyond what can be allocated
        let info = FrameInfo {
            width: 1 << 31,
            height: 1 << 31,
            format: PixelFormat::Grayscale,
            len: 4,
        };
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Frame(vec![0; 4], info)]));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(err, PersistError::Allocation(_)));
        assert_eq!(err.user_message(), "Fehler: Speicher");
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn conversion_failure_releases_frame() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Frame(
            vec![0; 10],
            rgb565_info(4, 4),
        )]));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(err, PersistError::Conversion(_)));
        assert_eq!(camera.grabs(), 1);
        assert_eq!(camera.releases(), 1);
        assert!(files_in(&dir.path().join("BeeSense")).is_empty());
    }

    #[tokio::test]
    async fn encode_failure_releases_frame() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        // JPEG cannot represent a width above 65535
        let info = FrameInfo {
            width: 70_000,
            height: 1,
            format: PixelFormat::Grayscale,
            len: 70_000,
        };
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Frame(vec![7; 70_000], info)]));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(err, PersistError::Encode(_)));
        assert_eq!(err.user_message(), "Fehler: Kodierung");
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn missing_directory_fails_file_open() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(
            mounted_card(dir.path()),
            FileNamer::new(NamingScheme::Counter),
            Arc::new(ManualClock::unsynced()),
            "NotCreated",
            80,
        );
        let camera = Arc::new(ScriptedCamera::rgb565(8, 8));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(err, PersistError::FileOpen(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn full_card_is_a_short_write() {
        let dir = tempfile::tempdir().unwrap();
        let card = full_card(dir.path(), 16);
        card.create_dir(Path::new("BeeSense")).unwrap();
        let persister = Persister::new(
            card,
            FileNamer::new(NamingScheme::Counter),
            Arc::new(ManualClock::unsynced()),
            "BeeSense",
            80,
        );
        let camera = Arc::new(ScriptedCamera::rgb565(32, 32));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(
            err,
            PersistError::ShortWrite(SdError::ShortWrite { written: 16, .. })
        ));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(camera.grabs(), 1);
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn unmounted_card_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let card = SdCard::new(Box::new(DirectoryHost), &storage_config(dir.path()));
        let persister = Persister::new(
            card,
            FileNamer::new(NamingScheme::Counter),
            Arc::new(ManualClock::unsynced()),
            "BeeSense",
            80,
        );
        let camera = Arc::new(ScriptedCamera::rgb565(8, 8));
        let pool = FramePool::new(camera.clone(), 1, None);

        let err = persister.save_photo(&pool).await.unwrap_err();
        assert!(matches!(err, PersistError::NotMounted));
        assert_eq!(err.user_message(), "Fehler: SD-Karte");
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn hundred_saves_within_one_millisecond_are_unique() {
        let wall = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_milli_opt(12, 0, 0, 250)
            .unwrap();
        for scheme in [NamingScheme::Counter, NamingScheme::Timestamp] {
            let dir = tempfile::tempdir().unwrap();
            let card = mounted_card(dir.path());
            card.create_dir(Path::new("BeeSense")).unwrap();
            // The clock never advances, so every stamp is identical
            let persister = Persister::new(
                card,
                FileNamer::new(scheme),
                Arc::new(ManualClock::at(wall)),
                "BeeSense",
                80,
            );
            let camera = Arc::new(ScriptedCamera::rgb565(16, 16));
            let pool = FramePool::new(camera.clone(), 1, None);

            let mut names = HashSet::new();
            for _ in 0..100 {
                names.insert(persister.save_photo(&pool).await.unwrap().name);
            }
            assert_eq!(names.len(), 100, "{scheme:?}");
            assert_eq!(files_in(&dir.path().join("BeeSense")).len(), 100);
            assert_eq!(camera.grabs(), 100);
            assert_eq!(camera.releases(), 100);
        }
    }

    #[tokio::test]
    async fn existing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        std::fs::write(dir.path().join("BeeSense/photo000.jpg"), b"old").unwrap();
        let pool = FramePool::new(Arc::new(ScriptedCamera::rgb565(8, 8)), 1, None);

        let saved = persister.save_photo(&pool).await.unwrap();
        assert_eq!(saved.name, "photo001.jpg");
        assert_eq!(std::fs::read(dir.path().join("BeeSense/photo000.jpg")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn detection_saves_tagged_copy() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        let camera = Arc::new(ScriptedCamera::rgb565(32, 24));
        let pool = FramePool::new(camera.clone(), 1, None);

        let detection = persister.save_detection(&pool, &MockDetector).await.unwrap();
        assert_eq!(detection.count, 0);
        assert_eq!(detection.saved.unwrap().name, "detect000_n0.jpg");
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn detection_survives_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(
            mounted_card(dir.path()),
            FileNamer::new(NamingScheme::Counter),
            Arc::new(ManualClock::unsynced()),
            "NotCreated",
            80,
        );
        let pool = FramePool::new(Arc::new(ScriptedCamera::rgb565(8, 8)), 1, None);

        let detection = persister.save_detection(&pool, &MockDetector).await.unwrap();
        assert_eq!(detection.count, 0);
        assert!(detection.saved.is_none());
    }

    #[tokio::test]
    async fn burst_of_jpeg_frames_writes_driver_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        let camera = Arc::new(ScriptedCamera::jpeg(16, 16));
        let pool = FramePool::new(camera.clone(), 1, None);

        let report = persister
            .burst(&pool, Duration::from_millis(300), 20.0)
            .await;

        assert!(report.saved > 0);
        assert_eq!(report.failed, 0);
        assert_eq!(files_in(&dir.path().join("BeeSense")).len(), report.saved);
        assert_eq!(camera.grabs(), camera.releases());
        assert_eq!(persister.file_count().await.unwrap(), report.saved);
    }

    #[tokio::test]
    async fn burst_counts_failed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path(), NamingScheme::Counter);
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Fail, Step::Fail]));
        let pool = FramePool::new(camera.clone(), 1, None);

        let report = persister
            .burst(&pool, Duration::from_millis(100), 50.0)
            .await;

        assert_eq!(report.saved, 0);
        assert!(report.failed >= 2);
        assert_eq!(camera.releases(), 0);
    }
}
