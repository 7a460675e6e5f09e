//! Capture trait definitions
//!
//! Platform-agnostic types for acquiring a camera + microphone grant.

use super::device::Device;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kinds of tracks an acquisition asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// Kind of media a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Raw sample layout produced by a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TrackFormat {
    Video {
        width: u32,
        height: u32,
        fps: u32,
        /// FFmpeg pixel format name of each frame (e.g. "yuyv422", "mjpeg")
        pixel_format: String,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
}

impl TrackFormat {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackFormat::Video { .. } => TrackKind::Video,
            TrackFormat::Audio { .. } => TrackKind::Audio,
        }
    }
}

/// Information about a camera/webcam
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,
}

/// Why a device grant could not be obtained
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Camera access denied. Please allow camera permissions. ({0})")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl DeviceError {
    /// Classify a platform error message
    ///
    /// Platform capture APIs rarely expose a typed permission error, so the
    /// message text is the only signal available.
    pub fn from_platform(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("permission")
            || lower.contains("denied")
            || lower.contains("not authorized")
            || lower.contains("notallowed")
        {
            DeviceError::PermissionDenied(message)
        } else {
            DeviceError::DeviceUnavailable(message)
        }
    }
}

/// Source of device grants
///
/// Resolves once the platform grants or refuses access. Dropping the future
/// does not cancel the platform request, so callers that lose interest must
/// still stop whatever device comes back.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Device, DeviceError>;
}
