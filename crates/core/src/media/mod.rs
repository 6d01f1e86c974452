//! FFmpeg-backed video I/O: probing, decoding driving videos into normalized
//! frames, and encoding predicted frames to MP4.

pub mod decoder;
pub mod encoder;
pub mod probe;

use std::path::Path;

use anyhow::{bail, Result};

pub use decoder::{normalized_frames, DrivingVideo, NormalizedFrames, VideoDecoder};
pub use encoder::{EncoderConfig, FrameSink, VideoEncoder};
pub use probe::{run_ffprobe, VideoStreamInfo};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Video,
}

impl UploadKind {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Image => IMAGE_EXTENSIONS,
            Self::Video => VIDEO_EXTENSIONS,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Image => "source image",
            Self::Video => "driving video",
        }
    }
}

/// Returns the lowercased extension of `file_name` if it is accepted for
/// `kind`.
pub fn validate_extension(file_name: &str, kind: UploadKind) -> Result<String> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension {
        Some(ext) if kind.extensions().contains(&ext.as_str()) => Ok(ext),
        Some(ext) => bail!(
            "unsupported {} type '.{ext}' (expected one of: {})",
            kind.label(),
            kind.extensions().join(", ")
        ),
        None => bail!(
            "{} '{file_name}' has no file extension (expected one of: {})",
            kind.label(),
            kind.extensions().join(", ")
        ),
    }
}

/// ISO-BMFF files start with a box whose type at bytes 4..8 is `ftyp`.
pub fn has_mp4_signature(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && &bytes[4..8] == b"ftyp"
}
