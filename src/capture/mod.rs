//! Camera and microphone capture
//!
//! This module provides device grants (`Device`), the handle that owns the
//! single held grant (`DeviceHandle`), the camera preview and the native
//! nokhwa/cpal backend.

pub mod device;
pub mod handle;
pub mod native;
pub mod preview;
pub mod traits;

pub use device::{Device, DeviceSummary, MediaSample, Track, TrackFeed, TrackSummary};
pub use handle::{Acquired, DeviceHandle};
pub use native::{get_cameras, NativeCaptureBackend};
pub use preview::{Preview, PreviewFrame};
pub use traits::{CameraInfo, CaptureBackend, DeviceError, MediaConstraints, TrackFormat, TrackKind};
