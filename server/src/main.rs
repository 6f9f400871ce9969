use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use detect_snap_common::config::{ServeConfig, ServerConfig};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const IMAGE_PART: &str = "image";
const OUTLINE: Rgb<u8> = Rgb([0, 200, 0]);
const OUTLINE_WIDTH: u32 = 4;
const RESPONSE_JPEG_QUALITY: u8 = 90;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    annotate: bool,
}

// ---------------------------------------------------------------------------
// Annotation
// ---------------------------------------------------------------------------

/// Draw a solid border around the image, clamped to its size.
fn outline(img: &mut RgbImage, width: u32, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    for y in 0..h {
        for x in 0..w {
            let edge = x < width || y < width || x + width >= w || y + width >= h;
            if edge {
                img.put_pixel(x, y, color);
            }
        }
    }
}

fn annotate(data: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let mut img = image::load_from_memory(data)?.to_rgb8();
    outline(&mut img, OUTLINE_WIDTH, OUTLINE);

    let (w, h) = img.dimensions();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, RESPONSE_JPEG_QUALITY).encode(
        img.as_raw(),
        w,
        h,
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// POST /detect (multipart, part `image`)
async fn detect(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let (data, mime) = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(IMAGE_PART) => {
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                match field.bytes().await {
                    Ok(data) => break (data, mime),
                    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
                }
            }
            Ok(Some(field)) => {
                debug!(name = ?field.name(), "skipping multipart field");
            }
            Ok(None) => {
                return (StatusCode::BAD_REQUEST, "missing 'image' part").into_response();
            }
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    };

    info!(bytes = data.len(), mime = %mime, annotate = state.annotate, "detect request");

    if !state.annotate {
        return ([(header::CONTENT_TYPE, mime)], data).into_response();
    }

    let result = tokio::task::spawn_blocking(move || annotate(&data)).await;
    match result {
        Ok(Ok(jpeg)) => {
            ([(header::CONTENT_TYPE, "image/jpeg")], Bytes::from(jpeg)).into_response()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "uploaded image could not be decoded");
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn app(config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        annotate: config.annotate,
    });
    Router::new()
        .route("/health", get(health))
        .route("/detect", post(detect))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match ServeConfig::load(&config_path) {
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

    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(bind = config.server.bind, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(
        bind = config.server.bind,
        annotate = config.server.annotate,
        "starting detect-snap echo server"
    );

    if let Err(e) = axum::serve(listener, app(&config.server)).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
