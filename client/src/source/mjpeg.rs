use bytes::{Bytes, BytesMut};
use chrono::Utc;
use detect_snap_common::config::MAX_FPS;
use detect_snap_common::frame::Frame;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::FrameSource;

const DEFAULT_BOUNDARY: &str = "frame";
const MIN_POLL_FPS: f64 = 0.01;
const FALLBACK_POLL_FPS: f64 = 10.0;
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` body.
///
/// Feed it arbitrary chunks; it returns every complete JPEG part. A part is
/// only complete once the following boundary has been seen.
pub struct MjpegSplitter {
    boundary: Vec<u8>,
    /// Bare `<boundary>\r\n`, for cameras that declare a boundary already
    /// starting with `--` and then send it unprefixed. Dropped at the first
    /// delimiter match.
    fallback: Option<Vec<u8>>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MjpegSplitter {
    pub fn new(boundary: &str) -> Self {
        Self {
            boundary: format!("--{boundary}\r\n").into_bytes(),
            fallback: boundary
                .starts_with("--")
                .then(|| format!("{boundary}\r\n").into_bytes()),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    let literal = find_subsequence(&self.buffer, &self.boundary);
                    let found = match (literal, &self.fallback) {
                        (Some(pos), _) => Some(pos),
                        (None, Some(fallback)) => find_subsequence(&self.buffer, fallback),
                        (None, None) => None,
                    };
                    if let Some(pos) = found {
                        if let Some(fallback) = self.fallback.take() {
                            if literal.is_none() {
                                debug!("camera sends the declared boundary without the -- prefix");
                                self.boundary = fallback;
                            }
                        }
                        let _ = self.buffer.split_to(pos + self.boundary.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks
                        if self.buffer.len() > self.boundary.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.boundary.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        // Skip already-scanned bytes on the next push
                        self.jpeg_start = self.buffer.len().saturating_sub(self.boundary.len());
                        break;
                    };

                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if jpeg_end >= 2 && &self.buffer[jpeg_end - 2..jpeg_end] == b"\r\n" {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let mut part = self.buffer.split_to(jpeg_end + self.boundary.len());
                    part.truncate(end);
                    if !part.is_empty() {
                        parts.push(part.freeze());
                    }

                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

/// Extract the multipart boundary from a `Content-Type` header value.
/// Falls back to `frame`, which is what most MJPEG cameras use.
pub fn boundary_from_content_type(content_type: Option<&str>) -> String {
    content_type
        .and_then(|ct| {
            ct.split(';')
                .map(str::trim)
                .find_map(|param| param.strip_prefix("boundary="))
        })
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string())
}

/// Consume an MJPEG stream and publish every frame to `source`.
/// Reconnects with exponential backoff on failure and never returns.
pub async fn run_mjpeg_capture(stream_url: &str, source: Arc<FrameSource>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, &source).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
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

async fn consume_stream(url: &str, source: &FrameSource) -> Result<(), CaptureError> {
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

    let boundary = boundary_from_content_type(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );
    info!(status = %response.status(), boundary = %boundary, "connected to MJPEG stream");

    let mut splitter = MjpegSplitter::new(&boundary);
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(CaptureError::HttpStream)?;
        for jpeg in splitter.push(&chunk) {
            let seq = source.next_seq();
            debug!(seq, bytes = jpeg.len(), "new MJPEG frame");
            source.on_new_sample(Frame::jpeg(jpeg, Utc::now().timestamp_millis(), seq));
        }
    }

    Ok(())
}

/// Period between snapshot polls for a camera rate, clamped to
/// `[1 / MAX_FPS, 1 / MIN_POLL_FPS]` so it is never zero.
pub fn polling_interval(fps: f64) -> Duration {
    let fps = if fps.is_nan() {
        FALLBACK_POLL_FPS
    } else {
        fps.clamp(MIN_POLL_FPS, MAX_FPS)
    };
    Duration::from_secs_f64(1.0 / fps)
}

/// Polling fallback: periodically fetch single JPEG snapshots.
pub async fn run_polling_capture(frame_url: &str, source: Arc<FrameSource>, interval: Duration) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    info!(url = frame_url, ?interval, "polling camera snapshots");

    loop {
        ticker.tick().await;

        match client.get(frame_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(jpeg) => {
                    let seq = source.next_seq();
                    debug!(seq, bytes = jpeg.len(), "new snapshot frame");
                    source.on_new_sample(Frame::jpeg(jpeg, Utc::now().timestamp_millis(), seq));
                }
                Err(e) => {
                    warn!(error = %e, "failed to read camera snapshot body");
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "non-success response from camera");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
            }
        }
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, unused_addr};
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    fn part(boundary: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!("--{boundary}\r\nContent-Type: image/jpeg\r\n\r\n").into_bytes();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn stream_of(boundary: &str, bodies: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for body in bodies {
            out.extend(part(boundary, body));
        }
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out
    }

    #[test]
    fn splits_whole_stream() {
        let data = stream_of("frame", &[b"\xFF\xD8one", b"\xFF\xD8two"]);
        let mut splitter = MjpegSplitter::new("frame");
        let parts = splitter.push(&data);
        assert_eq!(
            parts,
            vec![
                Bytes::from_static(b"\xFF\xD8one"),
                Bytes::from_static(b"\xFF\xD8two")
            ]
        );
    }

    #[test]
    fn splits_across_tiny_chunks() {
        let data = stream_of("cam", &[b"first-jpeg", b"second-jpeg", b"third"]);
        let mut splitter = MjpegSplitter::new("cam");
        let mut parts = Vec::new();
        for chunk in data.chunks(3) {
            parts.extend(splitter.push(chunk));
        }
        assert_eq!(parts.len(), 3);
        assert_eq!(&parts[0][..], b"first-jpeg");
        assert_eq!(&parts[1][..], b"second-jpeg");
        assert_eq!(&parts[2][..], b"third");
    }

    #[test]
    fn incomplete_part_is_held_back() {
        let mut data = part("frame", b"done");
        data.extend(part("frame", b"pending"));
        let mut splitter = MjpegSplitter::new("frame");
        let parts = splitter.push(&data);
        assert_eq!(parts, vec![Bytes::from_static(b"done")]);

        let parts = splitter.push(b"--frame\r\n");
        assert_eq!(parts, vec![Bytes::from_static(b"pending")]);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut data = b"HTTP noise before the first boundary".to_vec();
        data.extend(stream_of("frame", &[b"jpeg"]));
        let mut splitter = MjpegSplitter::new("frame");
        assert_eq!(splitter.push(&data), vec![Bytes::from_static(b"jpeg")]);
    }

    #[test]
    fn boundary_parsing() {
        assert_eq!(
            boundary_from_content_type(Some("multipart/x-mixed-replace; boundary=myboundary")),
            "myboundary"
        );
        assert_eq!(
            boundary_from_content_type(Some("multipart/x-mixed-replace;boundary=\"--cam\"")),
            "--cam"
        );
        assert_eq!(boundary_from_content_type(Some("image/jpeg")), "frame");
        assert_eq!(boundary_from_content_type(None), "frame");
    }

    #[test]
    fn dashed_boundary_is_used_literally() {
        // Declared `--cam`, delimiter `----cam`.
        let data = stream_of("--cam", &[b"one", b"two"]);
        let mut splitter = MjpegSplitter::new("--cam");
        let mut parts = Vec::new();
        for chunk in data.chunks(5) {
            parts.extend(splitter.push(chunk));
        }
        assert_eq!(
            parts,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[test]
    fn dashed_boundary_sent_unprefixed_still_splits() {
        // Declared `--cam`, delimiter `--cam`.
        let data = stream_of("cam", &[b"one", b"two"]);
        let mut splitter = MjpegSplitter::new("--cam");
        let mut parts = Vec::new();
        for chunk in data.chunks(5) {
            parts.extend(splitter.push(chunk));
        }
        assert_eq!(
            parts,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[tokio::test]
    async fn mjpeg_stream_publishes_latest_frame() {
        let body = stream_of("cam", &[b"jpeg-1", b"jpeg-2"]);
        let app = Router::new().route(
            "/stream",
            get(move || {
                let body = body.clone();
                async move {
                    (
                        [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=cam")],
                        body,
                    )
                        .into_response()
                }
            }),
        );
        let base = serve(app).await;

        let source = FrameSource::new();
        consume_stream(&format!("{base}/stream"), &source).await.unwrap();

        let latest = source.latest().unwrap();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.payload_size(), b"jpeg-2".len());
    }

    #[tokio::test]
    async fn mjpeg_error_status_is_reported() {
        let app = Router::new().route(
            "/stream",
            get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        );
        let base = serve(app).await;

        let source = FrameSource::new();
        let err = consume_stream(&format!("{base}/stream"), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::HttpStatus(503)));
        assert!(source.latest().is_none());
    }

    #[tokio::test]
    async fn polling_publishes_snapshots() {
        let app = Router::new().route("/frame", get(|| async { b"snapshot".to_vec() }));
        let base = serve(app).await;

        let source = FrameSource::new();
        let url = format!("{base}/frame");
        let task = tokio::spawn(run_polling_capture_owned(url, Arc::clone(&source)));

        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = source.latest() {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        task.abort();
        assert_eq!(frame.payload_size(), b"snapshot".len());
    }

    #[test]
    fn polling_interval_follows_fps() {
        assert_eq!(polling_interval(10.0), Duration::from_millis(100));
        assert_eq!(polling_interval(0.5), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn polling_interval_is_never_zero() {
        for fps in [1e12, f64::INFINITY, f64::MAX] {
            let interval = polling_interval(fps);
            assert_eq!(interval, Duration::from_millis(1), "fps = {fps}");
            // Would panic on a zero period.
            let _ = tokio::time::interval(interval);
        }
    }

    #[test]
    fn polling_interval_bounds_low_and_invalid_rates() {
        assert_eq!(polling_interval(0.0), Duration::from_secs(100));
        assert_eq!(polling_interval(-3.0), Duration::from_secs(100));
        assert_eq!(polling_interval(1e-300), Duration::from_secs(100));
        assert_eq!(polling_interval(f64::NEG_INFINITY), Duration::from_secs(100));
        assert_eq!(polling_interval(f64::NAN), Duration::from_millis(100));
    }

    async fn run_polling_capture_owned(url: String, source: Arc<FrameSource>) {
        run_polling_capture(&url, source, Duration::from_millis(20)).await
    }

    #[tokio::test]
    async fn unreachable_camera_leaves_slot_empty() {
        let source = FrameSource::new();
        let err = consume_stream(&format!("http://{}/stream", unused_addr()), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::HttpConnect(_)));
        assert!(source.latest().is_none());
    }
}
