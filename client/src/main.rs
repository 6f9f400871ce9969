mod session;
mod source;
mod store;
mod submit;
mod terminal;
#[cfg(test)]
mod test_support;

use detect_snap_common::config::Config;
use session::SessionController;
use source::{mjpeg, FrameSource};
use std::path::PathBuf;
use std::sync::Arc;
use store::DirectoryStore;
use submit::SubmissionClient;
use terminal::Renderer;
use tokio::sync::mpsc;
use tracing::{error, info};

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
        .with_writer(std::io::stderr)
        .init();

    info!(
        camera = config.camera.url,
        mode = config.camera.mode,
        endpoint = config.endpoint.url,
        "starting detect-snap client"
    );

    let submitter = match SubmissionClient::new(&config.endpoint) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to set up submission client");
            std::process::exit(1);
        }
    };

    let store = Arc::new(DirectoryStore::new(&config.media));
    info!(dir = store.dir().display().to_string(), "media store ready");

    // Capture runs for the lifetime of the process; failures only mean no frames.
    let frames = FrameSource::new();
    let capture_source = Arc::clone(&frames);
    let camera = config.camera.clone();
    let capture = tokio::spawn(async move {
        match camera.mode.as_str() {
            "mjpeg" => mjpeg::run_mjpeg_capture(&camera.url, capture_source).await,
            "polling" => {
                let interval = mjpeg::polling_interval(camera.fps);
                mjpeg::run_polling_capture(&camera.url, capture_source, interval).await
            }
            other => {
                error!(mode = other, "unknown camera mode, no frames will be available");
            }
        }
    });
    tokio::spawn(async move {
        if let Err(e) = capture.await {
            error!(error = %e, "capture task failed, no frames will be available");
        }
    });

    let controller = SessionController::new(frames.reader(), submitter, store);
    let snapshots = controller.subscribe();
    let (intents, intent_rx) = mpsc::channel(16);

    let session = tokio::spawn(controller.run(intent_rx));
    tokio::spawn(terminal::render_loop(
        snapshots.clone(),
        Renderer::new(config.display.path.clone()),
    ));

    terminal::read_commands(intents, snapshots).await;

    // Dropping the intent sender stops the session loop.
    if let Err(e) = session.await {
        error!(error = %e, "session task failed");
    }
    info!("detect-snap client stopped");
}
