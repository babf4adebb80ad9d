use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use beecam_common::multipart::STREAM_CONTENT_TYPE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::camera::{FramePool, JpegFrame};
use crate::detect::Detector;
use crate::persist::{PersistError, Persister};
use crate::stream::{channel_body, run_stream};

// Chunks buffered per stream client; three chunks make one frame.
const STREAM_CHANNEL_CHUNKS: usize = 6;

// ---------------------------------------------------------------------------
// App context
// ---------------------------------------------------------------------------

/// Everything the handlers share. Built once at boot and passed to both
/// routers.
pub struct AppContext {
    pub pool: FramePool,
    pub persister: Persister,
    pub detector: Arc<dyn Detector>,
    pub quality: u8,
    pub burst_duration: Duration,
    pub burst_fps: f64,
    pub stream_port: u16,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn failure(route: &str, e: PersistError) -> Response {
    error!(route, error = %e, "request failed");
    (e.status(), e.user_message()).into_response()
}

/// GET / — control page
async fn index(State(ctx): State<Arc<AppContext>>) -> Html<String> {
    Html(index_page(ctx.stream_port))
}

/// GET /save — store one photo on the card
async fn save(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.persister.save_photo(&ctx.pool).await {
        Ok(saved) => (StatusCode::OK, format!("Foto gespeichert: {}", saved.name)).into_response(),
        Err(e) => failure("/save", e),
    }
}

/// GET /detect — count bees in one frame
async fn detect(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.persister.save_detection(&ctx.pool, ctx.detector.as_ref()).await {
        Ok(detection) => (
            StatusCode::OK,
            format!("🐝 {} Hummel(n) erkannt (Mock)", detection.count),
        )
            .into_response(),
        Err(e) => failure("/detect", e),
    }
}

/// GET /burst — save photos for the configured burst window
async fn burst(State(ctx): State<Arc<AppContext>>) -> Response {
    let report = ctx
        .persister
        .burst(&ctx.pool, ctx.burst_duration, ctx.burst_fps)
        .await;
    if report.failed > 0 {
        warn!(failed = report.failed, "burst had failed frames");
    }
    (
        StatusCode::OK,
        format!("Serie beendet, {} Fotos gespeichert", report.saved),
    )
        .into_response()
}

/// GET /snapshot — one JPEG frame
async fn snapshot(State(ctx): State<Arc<AppContext>>) -> Response {
    let guard = match ctx.pool.acquire().await {
        Ok(guard) => guard,
        Err(e) => return failure("/snapshot", e.into()),
    };
    let quality = ctx.quality;
    let jpeg = match tokio::task::spawn_blocking(move || JpegFrame::from_guard(guard, quality)).await {
        Ok(Ok(jpeg)) => jpeg,
        Ok(Err(e)) => return failure("/snapshot", PersistError::Encode(e)),
        Err(e) => return failure("/snapshot", PersistError::Task(e.to_string())),
    };
    let body = match jpeg {
        JpegFrame::Owned(data) => data,
        borrowed => borrowed.bytes().to_vec(),
    };
    (
        [
            (CONTENT_TYPE, "image/jpeg"),
            (CONTENT_DISPOSITION, "inline; filename=capture.jpg"),
        ],
        body,
    )
        .into_response()
}

/// GET /files — number of photos on the card
async fn files(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.persister.file_count().await {
        Ok(count) => (
            StatusCode::OK,
            format!("{count} Dateien in {}", ctx.persister.photo_dir().display()),
        )
            .into_response(),
        Err(e) => failure("/files", e),
    }
}

/// GET /stream — MJPEG until the client disconnects
async fn stream(State(ctx): State<Arc<AppContext>>) -> Response {
    let (mut sink, body) = channel_body(STREAM_CHANNEL_CHUNKS);
    let pool = ctx.pool.clone();
    let quality = ctx.quality;
    tokio::spawn(async move {
        info!("stream client connected");
        run_stream(&pool, &mut sink, quality).await
    });
    ([(CONTENT_TYPE, STREAM_CONTENT_TYPE)], body).into_response()
}

pub fn control_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/save", get(save))
        .route("/detect", get(detect))
        .route("/burst", get(burst))
        .route("/snapshot", get(snapshot))
        .route("/files", get(files))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub fn stream_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// One HTTP server bound to its own port, stopped through its own
/// shutdown channel.
pub struct Listener {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Listener {
    pub async fn start(name: &'static str, addr: SocketAddr, router: Router) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    signal.await.ok();
                })
                .await
        });
        info!(name, addr = %local_addr, "listener started");
        Ok(Self {
            name,
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait up to `grace` for open ones.
    pub async fn shutdown(self, grace: Duration) {
        let Listener {
            name,
            shutdown,
            mut task,
            ..
        } = self;
        shutdown.send(()).ok();
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => info!(name, "listener stopped"),
            Ok(Ok(Err(e))) => error!(name, error = %e, "listener failed"),
            Ok(Err(e)) => error!(name, error = %e, "listener task panicked"),
            Err(_) => {
                warn!(name, ?grace, "connections still open, aborting listener");
                task.abort();
            }
        }
    }
}

fn index_page(stream_port: u16) -> String {
    INDEX_HTML.replace("{stream_port}", &stream_port.to_string())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Hummel-Kamera</title>
  <style>
    body { font-family: Arial, sans-serif; text-align: center; background: #1a1a1a; color: #fff; padding: 20px; }
    h1 { color: #ffd700; }
    #stream { width: 100%; max-width: 640px; border: 3px solid #ffd700; border-radius: 10px; }
    button { background: #ffd700; color: #1a1a1a; border: none; padding: 12px 24px; font-size: 16px; font-weight: bold; border-radius: 5px; margin: 8px; cursor: pointer; }
    #status, #result { margin-top: 16px; }
    #result { color: #ffd700; font-size: 22px; font-weight: bold; }
  </style>
</head>
<body>
  <h1>🐝 Hummel-Kamera</h1>
  <img id="stream" src="">
  <div>
    <button onclick="run('/save', 'Foto wird gespeichert...')">📷 Foto speichern</button>
    <button onclick="run('/detect', 'Erkennung läuft...')">🔍 Hummeln erkennen</button>
    <button onclick="run('/burst', 'Serie läuft...')">Serie aufnehmen</button>
    <button onclick="run('/files', 'Zähle Dateien...')">Dateien zählen</button>
  </div>
  <p id="status"></p>
  <p id="result"></p>
  <script>
    document.getElementById('stream').src =
      'http://' + window.location.hostname + ':{stream_port}/stream';
    function run(path, pending) {
      const status = document.getElementById('status');
      const result = document.getElementById('result');
      status.textContent = pending;
      result.textContent = '';
      fetch(path)
        .then(r => r.text())
        .then(t => { status.textContent = ''; result.textContent = t; })
        .catch(e => { status.textContent = 'Fehler: ' + e; });
    }
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::*;
    use crate::clock::testing::ManualClock;
    use crate::detect::MockDetector;
    use crate::sdcard::testing::mounted_card;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use beecam_common::naming::{FileNamer, NamingScheme};
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    fn context(root: &Path, camera: Arc<ScriptedCamera>) -> Arc<AppContext> {
        let card = mounted_card(root);
        card.create_dir(Path::new("BeeSense")).unwrap();
        let persister = Persister::new(
            card,
            FileNamer::new(NamingScheme::Counter),
            Arc::new(ManualClock::unsynced()),
            "BeeSense",
            80,
        );
        Arc::new(AppContext {
            pool: FramePool::new(camera, 1, Some(Duration::from_secs(2))),
            persister,
            detector: Arc::new(MockDetector),
            quality: 80,
            burst_duration: Duration::from_millis(200),
            burst_fps: 20.0,
            stream_port: 81,
        })
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }

    #[tokio::test]
    async fn save_writes_one_photo() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(ScriptedCamera::rgb565(320, 240));
        let router = control_router(context(dir.path(), camera.clone()));

        let (status, content_type, body) = get(router, "/save").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/plain"));
        assert_eq!(String::from_utf8(body).unwrap(), "Foto gespeichert: photo000.jpg");
        let photos: Vec<_> = std::fs::read_dir(dir.path().join("BeeSense"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].file_name().unwrap(), "photo000.jpg");
        assert!(std::fs::metadata(&photos[0]).unwrap().len() > 0);
        assert_eq!(camera.grabs(), camera.releases());
    }

    #[tokio::test]
    async fn camera_failure_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(ScriptedCamera::scripted(vec![]));
        let router = control_router(context(dir.path(), camera));

        let (status, _, body) = get(router, "/save").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, b"Fehler: Kamera");
    }

    #[tokio::test]
    async fn conversion_failure_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Frame(
            vec![0; 3],
            rgb565_info(4, 4),
        )]));
        let router = control_router(context(dir.path(), camera.clone()));

        let (status, _, body) = get(router, "/save").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, b"Fehler: Konvertierung");
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn detect_reports_mock_count() {
        let dir = tempfile::tempdir().unwrap();
        let router = control_router(context(dir.path(), Arc::new(ScriptedCamera::rgb565(32, 24))));

        let (status, _, body) = get(router, "/detect").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), "🐝 0 Hummel(n) erkannt (Mock)");
        assert!(dir.path().join("BeeSense/detect000_n0.jpg").is_file());
    }

    #[tokio::test]
    async fn burst_reports_saved_count() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(ScriptedCamera::jpeg(16, 16)));
        let router = control_router(Arc::clone(&ctx));

        let (status, _, body) = get(router.clone(), "/burst").await;
        let saved = std::fs::read_dir(dir.path().join("BeeSense")).unwrap().count();

        assert_eq!(status, StatusCode::OK);
        assert!(saved > 0);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            format!("Serie beendet, {saved} Fotos gespeichert")
        );

        let (_, _, body) = get(router, "/files").await;
        assert_eq!(String::from_utf8(body).unwrap(), format!("{saved} Dateien in BeeSense"));
    }

    #[tokio::test]
    async fn snapshot_returns_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(ScriptedCamera::rgb565(64, 48));
        let router = control_router(context(dir.path(), camera.clone()));

        let (status, content_type, body) = get(router, "/snapshot").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
        assert_eq!(camera.releases(), 1);
        // Snapshots are not persisted
        assert_eq!(std::fs::read_dir(dir.path().join("BeeSense")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn index_points_at_stream_port() {
        let dir = tempfile::tempdir().unwrap();
        let router = control_router(context(dir.path(), Arc::new(ScriptedCamera::rgb565(8, 8))));

        let (status, content_type, body) = get(router, "/").await;
        let page = String::from_utf8(body).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/html"));
        assert!(page.contains(":81/stream"));
        assert!(page.contains("/save"));
        assert!(page.contains("/detect"));
    }

    #[tokio::test]
    async fn stream_route_serves_multipart_with_cors() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = vec![50u8; 8 * 8 * 3];
        let jpeg = crate::convert::encode_jpeg(&rgb, 8, 8, 80).unwrap();
        let info = beecam_common::frame::FrameInfo {
            width: 8,
            height: 8,
            format: beecam_common::frame::PixelFormat::Jpeg,
            len: jpeg.len(),
        };
        let camera = Arc::new(ScriptedCamera::scripted(vec![Step::Frame(jpeg.clone(), info)]));
        let router = stream_router(context(dir.path(), camera.clone()));

        let response = router
            .oneshot(Request::builder().uri("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], STREAM_CONTENT_TYPE);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        // The script runs dry after one frame, which ends the body
        let wire = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(wire.ends_with(&jpeg));
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn stream_route_is_not_on_control_port() {
        let dir = tempfile::tempdir().unwrap();
        let router = control_router(context(dir.path(), Arc::new(ScriptedCamera::rgb565(8, 8))));
        let (status, _, _) = get(router, "/stream").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listener_serves_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let router = control_router(context(dir.path(), Arc::new(ScriptedCamera::rgb565(8, 8))));
        let listener = Listener::start("control", "127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();
        let addr = listener.local_addr();

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: node\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 200 OK"));

        listener.shutdown(Duration::from_secs(1)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
