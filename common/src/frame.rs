use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageFormat, RgbImage};

/// JPEG quality used on the wire. Frames are uploaded at maximum quality.
pub const WIRE_JPEG_QUALITY: u8 = 100;

/// Pixel data carried inside a frame, as the capture device delivered it.
#[derive(Debug, Clone)]
pub enum FrameData {
    /// A JPEG sample (MJPEG stream part or snapshot response).
    Jpeg(Bytes),
    /// Packed 8-bit RGB, row-major, `width * height * 3` bytes.
    Rgb8 {
        width: u32,
        height: u32,
        pixels: Bytes,
    },
}

/// A camera frame: an immutable snapshot plus capture metadata.
///
/// Cloning is cheap; the pixel buffer is reference counted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: FrameData,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn jpeg(jpeg_data: impl Into<Bytes>, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data: FrameData::Jpeg(jpeg_data.into()),
            captured_at_ms,
            seq,
        }
    }

    pub fn rgb8(
        width: u32,
        height: u32,
        pixels: impl Into<Bytes>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Self {
        Self {
            data: FrameData::Rgb8 {
                width,
                height,
                pixels: pixels.into(),
            },
            captured_at_ms,
            seq,
        }
    }

    /// Wrap an in-memory image as an RGB8 frame.
    pub fn from_image(image: &DynamicImage, captured_at_ms: i64, seq: u64) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::rgb8(width, height, rgb.into_raw(), captured_at_ms, seq)
    }

    /// Capture time as a UTC timestamp.
    pub fn captured_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.captured_at_ms).unwrap_or_else(Utc::now)
    }

    /// Size of the stored pixel data in bytes.
    pub fn payload_size(&self) -> usize {
        match &self.data {
            FrameData::Jpeg(data) => data.len(),
            FrameData::Rgb8 { pixels, .. } => pixels.len(),
        }
    }

    /// Encode the frame for upload as a JPEG at [`WIRE_JPEG_QUALITY`].
    ///
    /// JPEG samples are checked by decoding and then passed through untouched,
    /// so a device frame is never re-compressed.
    pub fn encode_jpeg(&self) -> Result<Bytes, FrameError> {
        match &self.data {
            FrameData::Jpeg(data) => {
                image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                    .map_err(FrameError::Encoding)?;
                Ok(data.clone())
            }
            FrameData::Rgb8 {
                width,
                height,
                pixels,
            } => {
                let expected = *width as usize * *height as usize * 3;
                if pixels.len() != expected {
                    return Err(FrameError::BufferSize {
                        expected,
                        got: pixels.len(),
                    });
                }
                let mut buf = Vec::with_capacity(expected / 4);
                let mut encoder = JpegEncoder::new_with_quality(&mut buf, WIRE_JPEG_QUALITY);
                encoder
                    .encode(pixels, *width, *height, ExtendedColorType::Rgb8)
                    .map_err(FrameError::Encoding)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Decode the frame into an image.
    pub fn decode(&self) -> Result<DynamicImage, FrameError> {
        match &self.data {
            FrameData::Jpeg(data) => image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                .map_err(FrameError::Decode),
            FrameData::Rgb8 {
                width,
                height,
                pixels,
            } => {
                let expected = *width as usize * *height as usize * 3;
                RgbImage::from_raw(*width, *height, pixels.to_vec())
                    .map(DynamicImage::ImageRgb8)
                    .ok_or(FrameError::BufferSize {
                        expected,
                        got: pixels.len(),
                    })
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to encode frame as JPEG: {0}")]
    Encoding(image::ImageError),
    #[error("pixel buffer has {got} bytes, expected {expected}")]
    BufferSize { expected: usize, got: usize },
    #[error("failed to decode frame: {0}")]
    Decode(image::ImageError),
}
