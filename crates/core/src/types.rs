use std::fmt;

use serde::{Deserialize, Serialize};

/// Target box every image and video frame is letterboxed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Bytes of one packed RGB24 frame at this size.
    pub fn rgb_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        Self::square(256)
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Motion-transfer switches forwarded to the animation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationOptions {
    /// Apply driving motion relative to the first driving frame instead of
    /// copying absolute keypoint positions.
    pub relative: bool,
    /// Rescale relative motion by the ratio of source and driving face areas.
    pub adapt_scale: bool,
}

impl Default for AnimationOptions {
    fn default() -> Self {
        Self {
            relative: true,
            adapt_scale: false,
        }
    }
}

/// Byte-level progress of a streaming download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// `None` when the server did not announce a content length.
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.downloaded as f64 / total as f64).clamp(0.0, 1.0)),
            None => None,
        }
    }
}
