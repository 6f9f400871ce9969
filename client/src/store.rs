use chrono::Utc;
use detect_snap_common::config::MediaConfig;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::submit::DetectionImage;

/// Outcome of the runtime permission check that gates every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Authorized,
    Denied,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("media store access not authorized")]
    NotAuthorized,
    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent media store (the "photo library").
pub trait MediaStore: Send + Sync + 'static {
    fn authorization(&self) -> Authorization;

    /// Persist the image, returning where it ended up.
    fn save(&self, image: &DetectionImage) -> Result<PathBuf, SaveError>;
}

/// Saves detections as files in a local directory.
pub struct DirectoryStore {
    dir: PathBuf,
    authorized: bool,
}

impl DirectoryStore {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            authorized: config.authorized,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MediaStore for DirectoryStore {
    fn authorization(&self) -> Authorization {
        if !self.authorized {
            return Authorization::Denied;
        }
        match std::fs::create_dir_all(&self.dir) {
            Ok(()) => Authorization::Authorized,
            Err(e) => {
                debug!(
                    dir = self.dir.display().to_string(),
                    error = %e,
                    "media directory unavailable"
                );
                Authorization::Denied
            }
        }
    }

    fn save(&self, image: &DetectionImage) -> Result<PathBuf, SaveError> {
        if self.authorization() == Authorization::Denied {
            return Err(SaveError::NotAuthorized);
        }

        let ts = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let path = self
            .dir
            .join(format!("detection-{ts}.{}", extension_for(image.format())));
        std::fs::write(&path, image.bytes())?;

        info!(path = path.display().to_string(), bytes = image.bytes().len(), "detection saved");
        Ok(path)
    }
}

fn extension_for(format: Option<ImageFormat>) -> &'static str {
    format
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("jpg")
}
