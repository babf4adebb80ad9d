use beecam_common::config::CameraConfig;
use beecam_common::frame::{FrameInfo, PixelFormat};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::convert::{self, ConvertError};

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera init failed: {0}")]
    Init(String),
    #[error("camera returned no frame")]
    NoFrame,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("frame pool is closed")]
    Closed,
    #[error("capture task failed: {0}")]
    Task(String),
}

/// One buffer lent out by the driver. It must go back through
/// [`CameraDriver::release`] exactly once.
#[derive(Debug)]
pub struct DriverFrame {
    pub data: Vec<u8>,
    pub info: FrameInfo,
}

/// Camera driver seam.
///
/// `grab` blocks the calling thread until a frame is ready, the optional
/// timeout expires, or the sensor fails.
pub trait CameraDriver: Send + Sync {
    fn grab(&self, timeout: Option<Duration>) -> Result<DriverFrame, CameraError>;
    fn release(&self, frame: DriverFrame);
}

// ---------------------------------------------------------------------------
// Frame pool
// ---------------------------------------------------------------------------

/// Bounds concurrent frame ownership to the driver's buffer count.
///
/// Acquirers beyond capacity wait in FIFO order for a returned frame.
#[derive(Clone)]
pub struct FramePool {
    driver: Arc<dyn CameraDriver>,
    permits: Arc<Semaphore>,
    capacity: usize,
    default_timeout: Option<Duration>,
}

impl FramePool {
    pub fn new(driver: Arc<dyn CameraDriver>, capacity: usize, default_timeout: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            driver,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            default_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently lent out.
    #[allow(dead_code)]
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<FrameGuard, CameraError> {
        self.acquire_with_timeout(self.default_timeout).await
    }

    /// Wait for a free buffer slot, then grab a frame on a blocking thread.
    /// `timeout` bounds both phases together.
    pub async fn acquire_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<FrameGuard, CameraError> {
        let started = Instant::now();
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| CameraError::Timeout(limit))?,
            None => acquire.await,
        }
        .map_err(|_| CameraError::Closed)?;

        let remaining = timeout.map(|limit| limit.saturating_sub(started.elapsed()));
        let driver = Arc::clone(&self.driver);
        // The guard is built on the blocking thread. If this future is
        // dropped mid-grab, the task output is dropped and still releases.
        let guard = tokio::task::spawn_blocking(move || -> Result<FrameGuard, CameraError> {
            let frame = driver.grab(remaining)?;
            Ok(FrameGuard {
                frame: Some(frame),
                driver,
                _permit: permit,
            })
        })
        .await
        .map_err(|e| CameraError::Task(e.to_string()))??;

        debug!(
            width = guard.info().width,
            height = guard.info().height,
            format = %guard.info().format,
            bytes = guard.data().len(),
            "frame acquired"
        );

        Ok(guard)
    }

    /// Refuse further acquisitions; frames already out stay valid.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A frame borrowed from the driver pool. Dropping it hands the buffer
/// back to the driver, then frees the pool slot.
pub struct FrameGuard {
    frame: Option<DriverFrame>,
    driver: Arc<dyn CameraDriver>,
    _permit: OwnedSemaphorePermit,
}

impl FrameGuard {
    pub fn data(&self) -> &[u8] {
        self.frame.as_ref().map(|f| f.data.as_slice()).unwrap_or(&[])
    }

    pub fn info(&self) -> FrameInfo {
        self.frame
            .as_ref()
            .map(|f| f.info)
            .unwrap_or(FrameInfo {
                width: 0,
                height: 0,
                format: PixelFormat::Jpeg,
                len: 0,
            })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.driver.release(frame);
        }
    }
}

/// A JPEG ready to send or store: either the driver's own JPEG frame or a
/// heap buffer encoded from a raw frame. Dropping it releases whichever
/// resource it holds, never both.
pub enum JpegFrame {
    Borrowed(FrameGuard),
    Owned(Vec<u8>),
}

impl JpegFrame {
    /// Pass JPEG frames through; encode anything else and return the native
    /// frame to the driver as soon as the encoder is done with it.
    pub fn from_guard(guard: FrameGuard, quality: u8) -> Result<Self, ConvertError> {
        let info = guard.info();
        if info.format.is_jpeg() {
            return Ok(JpegFrame::Borrowed(guard));
        }
        let encoded = convert::frame_to_jpeg(guard.data(), &info, quality);
        drop(guard);
        encoded.map(JpegFrame::Owned)
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            JpegFrame::Borrowed(guard) => guard.data(),
            JpegFrame::Owned(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    #[allow(dead_code)]
    pub fn is_borrowed(&self) -> bool {
        matches!(self, JpegFrame::Borrowed(_))
    }
}

// ---------------------------------------------------------------------------
// Synthetic sensor
// ---------------------------------------------------------------------------

/// Host camera producing a moving color-bar pattern at a fixed frame rate.
///
/// Buffers are preallocated (`fb_count` of them) and recycled through
/// `release`, the way a sensor driver recycles its DMA buffers.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
    interval: Duration,
    free: Mutex<Vec<Vec<u8>>>,
    sequence: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
}

impl SyntheticCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CameraError> {
        if config.width == 0 || config.height == 0 {
            return Err(CameraError::Init("frame size must be non-zero".into()));
        }
        if config.pixel_format == PixelFormat::Yuv422 && config.width % 2 != 0 {
            return Err(CameraError::Init("YUV422 needs an even frame width".into()));
        }
        let capacity = config
            .pixel_format
            .expected_len(config.width, config.height)
            .unwrap_or(config.width as usize * config.height as usize / 4);
        let free = (0..config.fb_count.max(1))
            .map(|_| Vec::with_capacity(capacity))
            .collect();

        info!(
            width = config.width,
            height = config.height,
            format = %config.pixel_format,
            fb_count = config.fb_count,
            "synthetic camera initialized"
        );

        Ok(Self {
            width: config.width,
            height: config.height,
            format: config.pixel_format,
            quality: config.jpeg_quality,
            interval: Duration::from_millis(config.frame_interval_ms),
            free: Mutex::new(free),
            sequence: AtomicU64::new(0),
            last_frame: Mutex::new(None),
        })
    }

    // Sleep until the next frame period, bounded by the caller's deadline.
    fn pace(&self, timeout: Option<Duration>) -> Result<(), CameraError> {
        let mut last = self.last_frame.lock().map_err(|_| CameraError::NoFrame)?;
        let now = Instant::now();
        let wait = last
            .map(|t| self.interval.saturating_sub(now.duration_since(t)))
            .unwrap_or_default();
        if let Some(limit) = timeout {
            if wait > limit {
                std::thread::sleep(limit);
                return Err(CameraError::Timeout(limit));
            }
        }
        std::thread::sleep(wait);
        *last = Some(Instant::now());
        Ok(())
    }

    fn render(&self, seq: u64, buf: &mut Vec<u8>) -> Result<(), CameraError> {
        let rgb = color_bars(self.width, self.height, seq);
        buf.clear();
        match self.format {
            PixelFormat::Rgb888 => buf.extend_from_slice(&rgb),
            PixelFormat::Rgb565 => {
                for px in rgb.chunks_exact(3) {
                    let v = ((px[0] as u16 >> 3) << 11) | ((px[1] as u16 >> 2) << 5) | (px[2] as u16 >> 3);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
            }
            PixelFormat::Grayscale => {
                buf.extend(rgb.chunks_exact(3).map(|px| luma(px[0], px[1], px[2])));
            }
            PixelFormat::Yuv422 => {
                for pair in rgb.chunks_exact(6) {
                    let y0 = luma(pair[0], pair[1], pair[2]);
                    let y1 = luma(pair[3], pair[4], pair[5]);
                    buf.extend_from_slice(&[y0, 128, y1, 128]);
                }
            }
            PixelFormat::Jpeg => {
                let jpeg = convert::encode_jpeg(&rgb, self.width, self.height, self.quality)
                    .map_err(|e| {
                        warn!(error = %e, "synthetic JPEG encode failed");
                        CameraError::NoFrame
                    })?;
                buf.extend_from_slice(&jpeg);
            }
        }
        Ok(())
    }
}

impl CameraDriver for SyntheticCamera {
    fn grab(&self, timeout: Option<Duration>) -> Result<DriverFrame, CameraError> {
        self.pace(timeout)?;
        let mut data = self
            .free
            .lock()
            .map_err(|_| CameraError::NoFrame)?
            .pop()
            .ok_or(CameraError::NoFrame)?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.render(seq, &mut data) {
            self.recycle(data);
            return Err(e);
        }
        let info = FrameInfo {
            width: self.width,
            height: self.height,
            format: self.format,
            len: data.len(),
        };
        Ok(DriverFrame { data, info })
    }

    fn release(&self, frame: DriverFrame) {
        self.recycle(frame.data);
    }
}

impl SyntheticCamera {
    fn recycle(&self, data: Vec<u8>) {
        match self.free.lock() {
            Ok(mut free) => free.push(data),
            Err(_) => warn!("frame buffer list poisoned, dropping buffer"),
        }
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8
}

// Eight vertical bars scrolling one bar width every 8 frames.
fn color_bars(width: u32, height: u32, seq: u64) -> Vec<u8> {
    const BARS: [[u8; 3]; 8] = [
        [255, 255, 255],
        [255, 255, 0],
        [0, 255, 255],
        [0, 255, 0],
        [255, 0, 255],
        [255, 0, 0],
        [0, 0, 255],
        [0, 0, 0],
    ];
    let bar_width = (width / 8).max(1) as u64;
    let shift = seq * bar_width / 8;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for _ in 0..height {
        for x in 0..width as u64 {
            let bar = (((x + shift) / bar_width) % 8) as usize;
            rgb.extend_from_slice(&BARS[bar]);
        }
    }
    rgb
}

// ---------------------------------------------------------------------------
// Instrumented driver for tests
// ---------------------------------------------------------------------------
