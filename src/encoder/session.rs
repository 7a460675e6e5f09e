//! Time-sliced encoding sessions
//!
//! An `EncodingSession` drains whatever the encoder backend produced once
//! per interval and hands it to a registered callback as one `Fragment`.

use crate::capture::{Device, MediaSample, TrackFormat, TrackKind};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// How often a fragment is cut from the encoder output
pub const DEFAULT_FRAGMENT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Encoder unsupported: {0}")]
    EncoderUnsupported(String),

    #[error("No active capture device to encode")]
    NoActiveDevice,
}

/// Fixed container/codec pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            container: "webm".to_string(),
            video_codec: "vp8".to_string(),
            audio_codec: "opus".to_string(),
        }
    }
}

impl CodecConfig {
    /// MIME type of the produced stream, e.g. `video/webm; codecs=vp8,opus`
    pub fn mime_type(&self) -> String {
        format!(
            "video/{}; codecs={},{}",
            self.container, self.video_codec, self.audio_codec
        )
    }
}

/// One timed slice of encoded output
#[derive(Debug, Clone)]
pub struct Fragment {
    sequence: u64,
    data: Bytes,
}

impl Fragment {
    pub fn new(sequence: u64, data: Bytes) -> Self {
        Self { sequence, data }
    }

    /// Position in delivery order, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

pub type FragmentCallback = Box<dyn FnMut(Fragment) + Send>;

/// Running encoder output
pub trait EncodedStream: Send {
    /// Everything produced since the previous drain (possibly nothing)
    fn drain(&mut self) -> Bytes;

    /// Release the platform encoder. Must be safe to call more than once.
    fn close(&mut self);
}

/// One live track as the encoder sees it
pub struct TrackInput {
    pub format: TrackFormat,
    pub samples: broadcast::Receiver<MediaSample>,
}

/// Subscriptions to a device's live tracks
///
/// Taken while the device is borrowed; the encoder backend owns it from
/// then on and never touches the `Device` itself.
pub struct EncoderInput {
    pub device_id: Uuid,
    pub video: Option<TrackInput>,
    pub audio: Option<TrackInput>,
}

impl EncoderInput {
    pub fn from_device(device: &Device) -> Self {
        let input = |kind| {
            device.live_track(kind).map(|track| TrackInput {
                format: track.format().clone(),
                samples: track.subscribe(),
            })
        };
        Self {
            device_id: device.id(),
            video: input(TrackKind::Video),
            audio: input(TrackKind::Audio),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Platform encoder
///
/// Both calls may block (process spawn, capability probing); they are run
/// on the blocking pool.
pub trait EncoderBackend: Send + Sync {
    /// Fail with `EncoderUnsupported` if the codec pair cannot be produced
    fn check_support(&self, codec: &CodecConfig) -> Result<(), EncoderError>;

    /// Start encoding the given tracks
    fn open(
        &self,
        input: EncoderInput,
        codec: &CodecConfig,
    ) -> Result<Box<dyn EncodedStream>, EncoderError>;
}

/// Binds devices to an encoder backend with a fixed codec and interval
pub struct FragmentEncoder {
    backend: Arc<dyn EncoderBackend>,
    codec: CodecConfig,
    interval: Duration,
}

impl FragmentEncoder {
    pub fn new(backend: Arc<dyn EncoderBackend>, codec: CodecConfig, interval: Duration) -> Self {
        Self {
            backend,
            codec,
            interval,
        }
    }

    /// Start producing fragments from the device's live tracks into `callback`
    pub async fn start(
        &self,
        input: EncoderInput,
        callback: FragmentCallback,
    ) -> Result<EncodingSession, EncoderError> {
        if input.is_empty() {
            return Err(EncoderError::NoActiveDevice);
        }
        let device_id = input.device_id;

        let backend = self.backend.clone();
        let codec = self.codec.clone();
        let output = tokio::task::spawn_blocking(move || {
            backend.check_support(&codec)?;
            backend.open(input, &codec)
        })
        .await
        .map_err(|e| EncoderError::EncoderUnsupported(format!("Encoder start failed: {e}")))??;

        tracing::info!(
            "Encoding device {} as {} every {:?}",
            device_id,
            self.codec.mime_type(),
            self.interval
        );
        Ok(EncodingSession::spawn(output, callback, self.interval))
    }
}

/// An encoder bound to one device
pub struct EncodingSession {
    id: Uuid,
    callback: Arc<ParkingMutex<Option<FragmentCallback>>>,
    output: Arc<ParkingMutex<Option<Box<dyn EncodedStream>>>>,
    delivered: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
}

impl EncodingSession {
    fn spawn(output: Box<dyn EncodedStream>, callback: FragmentCallback, interval: Duration) -> Self {
        let callback = Arc::new(ParkingMutex::new(Some(callback)));
        let output = Arc::new(ParkingMutex::new(Some(output)));
        let delivered = Arc::new(AtomicU64::new(0));

        let ticker = tokio::spawn({
            let callback = callback.clone();
            let output = output.clone();
            let delivered = delivered.clone();
            async move {
                let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut sequence = 0u64;

                loop {
                    ticks.tick().await;

                    let data = match output.lock().as_mut() {
                        Some(stream) => stream.drain(),
                        None => break,
                    };
                    if data.is_empty() {
                        continue;
                    }

                    // Held for the whole call: stop() waits here before releasing anything.
                    let mut slot = callback.lock();
                    let Some(deliver) = slot.as_mut() else {
                        break;
                    };
                    deliver(Fragment::new(sequence, data));
                    sequence += 1;
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        Self {
            id: Uuid::new_v4(),
            callback,
            output,
            delivered,
            ticker: Some(ticker),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Fragments handed to the callback so far
    pub fn fragments_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Stop producing fragments
    ///
    /// Unregisters the callback first, so once this returns no fragment is
    /// delivered, then releases the platform encoder. Idempotent.
    pub fn stop(&mut self) {
        let was_running = self.callback.lock().take().is_some();

        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(mut stream) = self.output.lock().take() {
            stream.close();
        }

        if was_running {
            tracing::info!(
                "Encoding session {} stopped after {} fragments",
                self.id,
                self.fragments_delivered()
            );
        }
    }
}

impl Drop for EncodingSession {
    fn drop(&mut self) {
        self.stop();
    }
}
