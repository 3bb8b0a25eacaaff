use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata attached to every sensor message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    /// Capture time in nanoseconds.
    pub stamp_ns: i64,
    /// Coordinate frame the payload is expressed in.
    pub frame_id: String,
}

impl Header {
    pub fn new(stamp_ns: i64, frame_id: impl Into<String>) -> Self {
        Self {
            stamp_ns,
            frame_id: frame_id.into(),
        }
    }
}

/// Raw image message as delivered by the transport.
///
/// The payload is tightly packed (no row padding) and little-endian for
/// multi-byte encodings. `encoding` is kept as the transport's tag so that
/// unknown encodings survive until the consumer decides what to do with them.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageMessage {
    pub header: Header,
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: Vec<u8>,
}

impl ImageMessage {
    pub fn new(
        header: Header,
        width: u32,
        height: u32,
        encoding: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            header,
            width,
            height,
            encoding: encoding.into(),
            data,
        }
    }

    pub fn stamp(&self) -> Duration {
        Duration::from_nanos(self.header.stamp_ns.max(0) as u64)
    }
}

/// Known encoding tags.
pub mod encodings {
    pub const RGB8: &str = "rgb8";
    pub const BGR8: &str = "bgr8";
    pub const RGBA8: &str = "rgba8";
    pub const BGRA8: &str = "bgra8";
    pub const MONO8: &str = "mono8";
    pub const TYPE_32FC1: &str = "32FC1";
    pub const TYPE_16UC1: &str = "16UC1";
    pub const TYPE_8UC1: &str = "8UC1";
}

/// One-shot calibration message carrying the 3×3 intrinsic matrix (row-major).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    #[serde(flatten)]
    pub header: Header,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "K")]
    pub k: [f64; 9],
}

/// Which half of an RGB-D pair a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Color,
    Depth,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to open recording {path:?}")]
    Open { path: PathBuf },
    #[error("failed to decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
