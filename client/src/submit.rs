use bytes::Bytes;
use detect_snap_common::config::EndpointConfig;
use detect_snap_common::frame::{Frame, FrameError};
use image::{DynamicImage, ImageFormat};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PART_NAME: &str = "image";
const PART_FILE_NAME: &str = "frame.jpg";
const PART_MIME: &str = "image/jpeg";

/// The annotated image returned by the detection endpoint.
#[derive(Debug, Clone)]
pub struct DetectionImage {
    bytes: Bytes,
    image: Arc<DynamicImage>,
}

impl DetectionImage {
    /// Decode a response body. The format is sniffed from the bytes.
    pub fn decode(bytes: Bytes) -> Result<Self, image::ImageError> {
        let image = image::load_from_memory(&bytes)?;
        Ok(Self {
            bytes,
            image: Arc::new(image),
        })
    }

    /// The body exactly as the endpoint sent it.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[allow(dead_code)]
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn format(&self) -> Option<ImageFormat> {
        image::guess_format(&self.bytes).ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("frame could not be encoded: {0}")]
    Encoding(#[from] FrameError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response (HTTP {status}): {reason}")]
    InvalidResponse { status: u16, reason: String },
    #[error("submission task aborted before completing")]
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid bypass header {0:?}")]
    Header(String),
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// One remote round trip per call: frame in, annotated image out.
pub trait Submitter: Send + Sync + 'static {
    fn submit(
        &self,
        frame: Frame,
    ) -> impl Future<Output = Result<DetectionImage, SubmissionError>> + Send;
}

/// Uploads frames to the detection endpoint as `multipart/form-data`.
pub struct SubmissionClient {
    http: reqwest::Client,
    endpoint: String,
    bypass: Option<(HeaderName, HeaderValue)>,
}

impl SubmissionClient {
    pub fn new(config: &EndpointConfig) -> Result<Self, SetupError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        let http = builder.build().map_err(SetupError::Client)?;

        let bypass = if config.bypass_header.is_empty() {
            None
        } else {
            let name = HeaderName::from_bytes(config.bypass_header.as_bytes())
                .map_err(|_| SetupError::Header(config.bypass_header.clone()))?;
            let value = HeaderValue::from_str(&config.bypass_value)
                .map_err(|_| SetupError::Header(config.bypass_value.clone()))?;
            Some((name, value))
        };

        info!(endpoint = config.url, "submission client ready");

        Ok(Self {
            http,
            endpoint: config.url.clone(),
            bypass,
        })
    }
}

impl Submitter for SubmissionClient {
    async fn submit(&self, frame: Frame) -> Result<DetectionImage, SubmissionError> {
        let jpeg = frame.encode_jpeg()?;
        debug!(seq = frame.seq, bytes = jpeg.len(), "uploading frame");

        let part = Part::bytes(jpeg.to_vec())
            .file_name(PART_FILE_NAME)
            .mime_str(PART_MIME)?;
        let form = Form::new().part(PART_NAME, part);

        let mut request = self.http.post(&self.endpoint).multipart(form);
        if let Some((name, value)) = &self.bypass {
            request = request.header(name.clone(), value.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SubmissionError::InvalidResponse {
                status: status.as_u16(),
                reason: format!("endpoint returned {status}"),
            });
        }

        let body = response.bytes().await?;
        let detection =
            DetectionImage::decode(body).map_err(|e| SubmissionError::InvalidResponse {
                status: status.as_u16(),
                reason: e.to_string(),
            })?;

        debug!(
            seq = frame.seq,
            width = detection.width(),
            height = detection.height(),
            "detection received"
        );
        Ok(detection)
    }
}
