//! Ownership of the single held device grant
//!
//! `DeviceHandle` is the only place a `Device` lives once acquired. It also
//! keeps the "camera was left on" preference in step with explicit
//! acquire/release calls.

use super::device::{Device, DeviceSummary};
use super::preview::{Preview, PreviewFrame};
use super::traits::{CaptureBackend, DeviceError, MediaConstraints};
use crate::preferences::PreferenceStore;
use parking_lot::Mutex as ParkingMutex;
use std::sync::Arc;

/// Result of an acquisition that did not fail
#[derive(Debug, Clone)]
pub enum Acquired {
    /// A new grant is now held
    Fresh(DeviceSummary),
    /// A grant was already held; nothing was requested
    Existing(DeviceSummary),
    /// The grant arrived after a release (or after another grant won) and was stopped
    Discarded,
}

#[derive(Default)]
struct HandleState {
    held: Option<Device>,
    /// Bumped on every release so in-flight acquisitions can tell they are stale
    generation: u64,
}

pub struct DeviceHandle {
    backend: Arc<dyn CaptureBackend>,
    prefs: Arc<dyn PreferenceStore>,
    constraints: MediaConstraints,
    state: ParkingMutex<HandleState>,
    preview: Preview,
}

impl DeviceHandle {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        prefs: Arc<dyn PreferenceStore>,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            backend,
            prefs,
            constraints,
            state: ParkingMutex::new(HandleState::default()),
            preview: Preview::default(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held.is_some()
    }

    pub fn summary(&self) -> Option<DeviceSummary> {
        self.state.lock().held.as_ref().map(Device::summary)
    }

    /// Latest camera frame of the held device
    pub fn preview_frame(&self) -> Option<PreviewFrame> {
        self.preview.frame()
    }

    /// Run `f` against the held device, if any
    pub fn with_device<R>(&self, f: impl FnOnce(&Device) -> R) -> Option<R> {
        self.state.lock().held.as_ref().map(f)
    }

    /// Request a camera + microphone grant
    pub async fn acquire(&self) -> Result<Acquired, DeviceError> {
        let ticket = {
            let state = self.state.lock();
            if let Some(device) = &state.held {
                return Ok(Acquired::Existing(device.summary()));
            }
            state.generation
        };

        tracing::info!("Requesting capture device {:?}", self.constraints);
        let device = self.backend.acquire(self.constraints).await?;

        let adopted = {
            let mut state = self.state.lock();
            if state.generation != ticket || state.held.is_some() {
                Err(device)
            } else {
                let summary = device.summary();
                self.preview.attach(&device);
                state.held = Some(device);
                Ok(summary)
            }
        };

        match adopted {
            Ok(summary) => {
                self.persist(true);
                tracing::info!("Capture device {} acquired", summary.id);
                Ok(Acquired::Fresh(summary))
            }
            Err(late) => {
                tracing::info!("Discarding capture device {} granted after release", late.id());
                late.stop().await;
                Ok(Acquired::Discarded)
            }
        }
    }

    /// Stop the held device and remember that the camera is off
    ///
    /// Also invalidates any acquisition still in flight. Returns whether a
    /// device was actually released.
    pub async fn release(&self) -> bool {
        match self.take() {
            Some(device) => {
                device.stop().await;
                self.persist(false);
                true
            }
            None => false,
        }
    }

    /// Stop the held device without touching the preference
    ///
    /// Used when the app goes away with the camera still on, so the next
    /// launch brings it back.
    pub async fn shutdown(&self) -> bool {
        match self.take() {
            Some(device) => {
                device.stop().await;
                true
            }
            None => false,
        }
    }

    /// Reacquire the device at startup if it was left on
    ///
    /// Failures are logged and swallowed; there is no user action to report
    /// them to.
    pub async fn restore(&self) -> Option<DeviceSummary> {
        if !self.prefs.camera_on() {
            return None;
        }

        tracing::info!("Camera was left on, restoring");
        match self.acquire().await {
            Ok(Acquired::Fresh(summary)) | Ok(Acquired::Existing(summary)) => Some(summary),
            Ok(Acquired::Discarded) => None,
            Err(e) => {
                tracing::warn!("Failed to restore camera: {}", e);
                None
            }
        }
    }

    fn take(&self) -> Option<Device> {
        let mut state = self.state.lock();
        state.generation += 1;
        self.preview.detach();
        state.held.take()
    }

    fn persist(&self, on: bool) {
        if let Err(e) = self.prefs.set_camera_on(on) {
            tracing::warn!("Failed to save camera preference: {}", e);
        }
    }
}
