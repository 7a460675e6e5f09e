//! In-process stand-ins for the platform collaborators

use crate::capture::{
    CaptureBackend, Device, DeviceError, MediaConstraints, Track, TrackFeed, TrackFormat,
};
use crate::encoder::{CodecConfig, EncodedStream, EncoderBackend, EncoderError, EncoderInput};
use crate::transport::TransportChannel;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

fn video_format() -> TrackFormat {
    TrackFormat::Video {
        width: 640,
        height: 480,
        fps: 30,
        pixel_format: "yuyv422".to_string(),
    }
}

fn audio_format() -> TrackFormat {
    TrackFormat::Audio {
        sample_rate: 48000,
        channels: 1,
    }
}

/// A device with one video and one audio track and no capture threads
pub fn fake_device() -> (Device, Vec<TrackFeed>) {
    let (video, video_feed) = Track::new(video_format());
    let (audio, audio_feed) = Track::new(audio_format());
    (Device::new(vec![video, audio]), vec![video_feed, audio_feed])
}

/// Capture backend with scripted failures and optionally delayed grants
#[derive(Default)]
pub struct FakeCaptureBackend {
    failures: ParkingMutex<VecDeque<DeviceError>>,
    gates: ParkingMutex<VecDeque<oneshot::Receiver<()>>>,
    acquisitions: AtomicUsize,
    feeds: ParkingMutex<Vec<TrackFeed>>,
}

impl FakeCaptureBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next acquisition fail
    pub fn fail_next(&self, error: DeviceError) {
        self.failures.lock().push_back(error);
    }

    /// Make the next acquisition wait until the returned sender fires
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().push_back(rx);
        tx
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Tracks handed out so far that are still live
    pub fn live_tracks(&self) -> usize {
        self.feeds.lock().iter().filter(|f| f.is_live()).count()
    }

    /// Push one frame into every live video track handed out so far
    pub fn push_video(&self, frame: Vec<u8>) {
        // fake_device() hands out feeds as [video, audio]
        for feed in self.feeds.lock().iter().step_by(2) {
            feed.push(frame.clone());
        }
    }

    /// End every track from the producer side, as an unplugged camera would
    pub fn end_tracks(&self) {
        for feed in self.feeds.lock().iter() {
            feed.end();
        }
    }

    pub async fn wait_for_acquisitions(&self, count: usize) {
        while self.acquisitions() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl CaptureBackend for FakeCaptureBackend {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<Device, DeviceError> {
        let gate = self.gates.lock().pop_front();
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (device, feeds) = fake_device();
        self.feeds.lock().extend(feeds);
        Ok(device)
    }
}

/// Encoder backend whose output is scripted chunk by chunk
pub struct ScriptedEncoderBackend {
    supported: bool,
    outputs: Arc<ParkingMutex<VecDeque<Bytes>>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl ScriptedEncoderBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            supported: true,
            outputs: Arc::new(ParkingMutex::new(VecDeque::new())),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            supported: false,
            outputs: Arc::new(ParkingMutex::new(VecDeque::new())),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Queue what the next drain returns (empty means "nothing this interval")
    pub fn push_output(&self, chunk: Vec<u8>) {
        self.outputs.lock().push_back(Bytes::from(chunk));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn all_closed(&self) -> bool {
        self.opens() == self.closes()
    }
}

struct ScriptedStream {
    outputs: Arc<ParkingMutex<VecDeque<Bytes>>>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl EncodedStream for ScriptedStream {
    fn drain(&mut self) -> Bytes {
        self.outputs.lock().pop_front().unwrap_or_default()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl EncoderBackend for ScriptedEncoderBackend {
    fn check_support(&self, codec: &CodecConfig) -> Result<(), EncoderError> {
        if self.supported {
            Ok(())
        } else {
            Err(EncoderError::EncoderUnsupported(codec.mime_type()))
        }
    }

    fn open(
        &self,
        _input: EncoderInput,
        _codec: &CodecConfig,
    ) -> Result<Box<dyn EncodedStream>, EncoderError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            outputs: self.outputs.clone(),
            closes: self.closes.clone(),
            closed: false,
        }))
    }
}

/// Transport that records every emitted event
pub struct RecordingTransport {
    sent: ParkingMutex<Vec<(String, Bytes)>>,
    connected: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: ParkingMutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<(String, Bytes)> {
        self.sent.lock().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl TransportChannel for RecordingTransport {
    fn send(&self, event: &str, payload: Bytes) {
        self.sent.lock().push((event.to_string(), payload));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
