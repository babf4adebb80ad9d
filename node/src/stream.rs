use axum::body::Body;
use beecam_common::multipart::{boundary_line, part_header};
use bytes::Bytes;
use std::convert::Infallible;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::camera::{CameraError, FramePool, JpegFrame};
use crate::convert::ConvertError;

#[derive(Debug, thiserror::Error)]
#[error("client is no longer receiving")]
pub struct SendError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("JPEG conversion failed: {0}")]
    Encode(#[from] ConvertError),
    #[error("encoder task failed: {0}")]
    Task(String),
}

/// Destination of one client's multipart stream.
pub trait ChunkSink: Send {
    fn send_chunk(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), SendError>> + Send;
}

#[derive(Debug)]
pub struct StreamEnd {
    pub frames_sent: usize,
    pub reason: StreamError,
}

/// Send frames to `sink` until a send or capture fails.
///
/// Each iteration holds at most one frame: the driver buffer for JPEG
/// frames, otherwise the encoded copy.
pub async fn run_stream<S: ChunkSink>(pool: &FramePool, sink: &mut S, quality: u8) -> StreamEnd {
    let mut frames_sent = 0;
    loop {
        match send_frame(pool, sink, quality).await {
            Ok(bytes) => {
                frames_sent += 1;
                debug!(frame = frames_sent, bytes, "frame streamed");
            }
            Err(reason) => {
                info!(frames_sent, reason = %reason, "stream ended");
                return StreamEnd {
                    frames_sent,
                    reason,
                };
            }
        }
    }
}

async fn send_frame<S: ChunkSink>(pool: &FramePool, sink: &mut S, quality: u8) -> Result<usize, StreamError> {
    let guard = pool.acquire().await?;
    let jpeg = tokio::task::spawn_blocking(move || JpegFrame::from_guard(guard, quality))
        .await
        .map_err(|e| StreamError::Task(e.to_string()))??;

    // A driver-owned JPEG stays borrowed until the payload has been sent
    let (payload, _held) = match jpeg {
        JpegFrame::Owned(data) => (Bytes::from(data), None),
        JpegFrame::Borrowed(guard) => (Bytes::copy_from_slice(guard.data()), Some(guard)),
    };
    let len = payload.len();

    sink.send_chunk(Bytes::from_static(boundary_line())).await?;
    sink.send_chunk(Bytes::from(part_header(len))).await?;
    sink.send_chunk(payload).await?;
    Ok(len)
}

/// Sink feeding an HTTP response body through a bounded channel. Sends
/// fail once the client has disconnected and the body is dropped.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChunkSink for ChannelSink {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SendError> {
        self.tx.send(chunk).await.map_err(|_| SendError)
    }
}

/// A connected sink/body pair; `capacity` is counted in chunks.
pub fn channel_body(capacity: usize) -> (ChannelSink, Body) {
    let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));
    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    (ChannelSink { tx }, Body::from_stream(chunks))
}
