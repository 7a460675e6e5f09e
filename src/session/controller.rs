//! Session controller
//!
//! Drives the Idle/Previewing/Live state machine over the device handle, the
//! fragment encoder and the ingest transport.

use super::state::{Controls, SessionAction, SessionState, Transition};
use crate::capture::{Acquired, DeviceError, DeviceHandle, PreviewFrame};
use crate::encoder::{
    EncoderError, EncoderInput, EncodingSession, Fragment, FragmentCallback, FragmentEncoder,
};
use crate::transport::{TransportChannel, BINARY_STREAM_EVENT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use uuid::Uuid;

/// Failure of an attempted transition; the state is left as it was
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Snapshot of the session for the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub controls: Controls,
    /// A camera request is waiting on the platform
    pub acquiring: bool,
    /// Ingest connectivity, informational only
    pub connected: bool,
    pub last_error: Option<String>,
    pub device_id: Option<Uuid>,
    pub live_since: Option<DateTime<Utc>>,
    /// Fragments handed to the transport in the current (or last) live session
    pub fragments_forwarded: u64,
}

/// Events emitted by the controller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged(SessionStatus),
    /// A transition failed
    Error(String),
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    /// An acquisition is in flight
    acquiring: bool,
    /// The in-flight acquisition was cancelled by stopCamera or teardown
    cancelled: bool,
    /// Present iff Live
    encoding: Option<EncodingSession>,
    last_error: Option<String>,
    live_since: Option<DateTime<Utc>>,
}

pub struct SessionController {
    devices: DeviceHandle,
    encoder: FragmentEncoder,
    transport: Arc<dyn TransportChannel>,
    inner: Mutex<Inner>,
    forwarded: Arc<AtomicU64>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        devices: DeviceHandle,
        encoder: FragmentEncoder,
        transport: Arc<dyn TransportChannel>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            devices,
            encoder,
            transport,
            inner: Mutex::new(Inner::default()),
            forwarded: Arc::new(AtomicU64::new(0)),
            event_tx,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        self.snapshot(&inner)
    }

    /// Latest camera frame while a device is held
    pub fn preview_frame(&self) -> Option<PreviewFrame> {
        self.devices.preview_frame()
    }

    /// Idle → Previewing
    pub async fn start_camera(&self) -> Result<Transition, SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.acquiring || inner.state.next(SessionAction::StartCamera).is_none() {
                return Ok(self.unavailable(&inner, SessionAction::StartCamera));
            }
            inner.acquiring = true;
            inner.cancelled = false;
        }

        // Lock released: stopCamera may cancel while the platform prompts.
        let result = self.devices.acquire().await;

        let mut inner = self.inner.lock().await;
        inner.acquiring = false;
        if std::mem::take(&mut inner.cancelled) {
            if let Err(e) = result {
                tracing::info!("Cancelled camera request failed: {}", e);
            }
            return Ok(Transition::Unavailable);
        }

        match result {
            Ok(Acquired::Fresh(_)) | Ok(Acquired::Existing(_)) => {
                inner.last_error = None;
                Ok(self.enter(&mut inner, SessionState::Previewing))
            }
            // Only reachable when something else released mid-flight
            Ok(Acquired::Discarded) => Ok(Transition::Unavailable),
            Err(e) => Err(self.fail(&mut inner, SessionAction::StartCamera, e.into())),
        }
    }

    /// Previewing or Live → Idle
    ///
    /// From Live this first stops encoding. From Idle with a camera request in
    /// flight it cancels the request.
    pub async fn stop_camera(&self) -> Result<Transition, SessionError> {
        let mut inner = self.inner.lock().await;

        if inner.state.next(SessionAction::StopCamera).is_none() {
            if inner.acquiring && !inner.cancelled {
                inner.cancelled = true;
                self.devices.release().await;
                tracing::info!("Camera request cancelled");
                return Ok(Transition::Applied(inner.state));
            }
            return Ok(self.unavailable(&inner, SessionAction::StopCamera));
        }

        self.stop_encoding(&mut inner);
        self.devices.release().await;
        Ok(self.enter(&mut inner, SessionState::Idle))
    }

    /// Previewing → Live
    pub async fn go_live(&self) -> Result<Transition, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state.next(SessionAction::GoLive).is_none() {
            return Ok(self.unavailable(&inner, SessionAction::GoLive));
        }

        self.forwarded.store(0, Ordering::Relaxed);
        let started = match self.devices.with_device(EncoderInput::from_device) {
            Some(input) => self.encoder.start(input, self.forward_to_transport()).await,
            None => Err(EncoderError::NoActiveDevice),
        };

        match started {
            Ok(encoding) => {
                tracing::info!("Live: encoding session {}", encoding.id());
                inner.encoding = Some(encoding);
                inner.live_since = Some(Utc::now());
                inner.last_error = None;
                Ok(self.enter(&mut inner, SessionState::Live))
            }
            Err(e) => Err(self.fail(&mut inner, SessionAction::GoLive, e.into())),
        }
    }

    /// Live → Previewing; the device stays held
    pub async fn stop_live(&self) -> Result<Transition, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state.next(SessionAction::StopLive).is_none() {
            return Ok(self.unavailable(&inner, SessionAction::StopLive));
        }

        self.stop_encoding(&mut inner);
        Ok(self.enter(&mut inner, SessionState::Previewing))
    }

    /// Reacquire the camera if it was left on last time
    ///
    /// Failures are logged by the device handle and leave the session Idle.
    pub async fn restore(&self) -> SessionState {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Idle || inner.acquiring {
                return inner.state;
            }
            inner.acquiring = true;
            inner.cancelled = false;
        }

        let restored = self.devices.restore().await;

        let mut inner = self.inner.lock().await;
        inner.acquiring = false;
        let cancelled = std::mem::take(&mut inner.cancelled);
        if restored.is_some() && !cancelled && self.devices.is_held() {
            self.enter(&mut inner, SessionState::Previewing);
        }
        inner.state
    }

    /// Stop everything on the way out
    ///
    /// Releases the device without clearing the camera preference, so the
    /// next launch restores it.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.acquiring {
            inner.cancelled = true;
        }

        self.stop_encoding(&mut inner);
        self.devices.shutdown().await;

        if inner.state != SessionState::Idle {
            self.enter(&mut inner, SessionState::Idle);
        }
        tracing::info!("Session torn down");
    }

    fn forward_to_transport(&self) -> FragmentCallback {
        let transport = self.transport.clone();
        let forwarded = self.forwarded.clone();
        Box::new(move |fragment: Fragment| {
            if fragment.is_empty() {
                return;
            }
            tracing::debug!(
                "Forwarding fragment {} ({} bytes)",
                fragment.sequence(),
                fragment.len()
            );
            transport.send(BINARY_STREAM_EVENT, fragment.into_bytes());
            forwarded.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn stop_encoding(&self, inner: &mut MutexGuard<'_, Inner>) {
        if let Some(mut encoding) = inner.encoding.take() {
            encoding.stop();
        }
        inner.live_since = None;
    }

    fn enter(&self, inner: &mut MutexGuard<'_, Inner>, next: SessionState) -> Transition {
        debug_assert_eq!(next.holds_device(), self.devices.is_held());
        let previous = inner.state;
        inner.state = next;
        tracing::info!("Session {} -> {}", previous, next);

        let _ = self
            .event_tx
            .send(SessionEvent::StateChanged(self.snapshot(inner)));
        Transition::Applied(next)
    }

    fn unavailable(&self, inner: &Inner, action: SessionAction) -> Transition {
        tracing::debug!("{:?} unavailable while {}", action, inner.state);
        Transition::Unavailable
    }

    fn fail(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        action: SessionAction,
        error: SessionError,
    ) -> SessionError {
        let message = error.to_string();
        tracing::warn!("{:?} failed while {}: {}", action, inner.state, message);
        inner.last_error = Some(message.clone());
        let _ = self.event_tx.send(SessionEvent::Error(message));
        error
    }

    fn snapshot(&self, inner: &Inner) -> SessionStatus {
        let mut controls = inner.state.controls();
        if inner.acquiring {
            controls.start_camera = false;
            controls.stop_camera = !inner.cancelled;
        }

        SessionStatus {
            state: inner.state,
            controls,
            acquiring: inner.acquiring,
            connected: self.transport.is_connected(),
            last_error: inner.last_error.clone(),
            device_id: self.devices.summary().map(|s| s.id),
            live_since: inner.live_since,
            fragments_forwarded: self.forwarded.load(Ordering::Relaxed),
        }
    }
}
