//! Acquired device grants and their tracks

use super::traits::{TrackFormat, TrackKind};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Samples buffered per subscriber before the slowest one starts lagging
const TRACK_BUFFER: usize = 32;

/// One chunk of raw media (a video frame or a block of PCM samples)
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub captured_at: Instant,
}

/// A single video or audio track of a device grant
///
/// Once stopped a track can never produce samples again; a fresh grant is
/// required.
pub struct Track {
    id: Uuid,
    format: TrackFormat,
    live: Arc<AtomicBool>,
    samples: broadcast::Sender<MediaSample>,
    worker: ParkingMutex<Option<JoinHandle<()>>>,
}

/// Producer half of a track, handed to the platform capture thread
#[derive(Clone)]
pub struct TrackFeed {
    live: Arc<AtomicBool>,
    samples: broadcast::Sender<MediaSample>,
}

impl TrackFeed {
    /// A live feed with no track attached yet
    ///
    /// Capture threads start pushing before the track's format is known;
    /// `Track::from_feed` wraps the feed once it is.
    pub fn new() -> Self {
        let (samples, _) = broadcast::channel(TRACK_BUFFER);
        Self {
            live: Arc::new(AtomicBool::new(true)),
            samples,
        }
    }

    /// Whether the owning track is still live
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Publish a sample. Returns false once the track has been stopped.
    pub fn push(&self, data: impl Into<Bytes>) -> bool {
        if !self.is_live() {
            return false;
        }
        // No subscribers is fine: nobody is encoding yet.
        let _ = self.samples.send(MediaSample {
            data: data.into(),
            captured_at: Instant::now(),
        });
        true
    }

    /// Mark the track as ended from the producer side (device unplugged, stream error)
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl Default for TrackFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl Track {
    pub fn new(format: TrackFormat) -> (Self, TrackFeed) {
        let feed = TrackFeed::new();
        (Self::from_feed(format, &feed), feed)
    }

    pub fn from_feed(format: TrackFormat, feed: &TrackFeed) -> Self {
        Self {
            id: Uuid::new_v4(),
            format,
            live: feed.live.clone(),
            samples: feed.samples.clone(),
            worker: ParkingMutex::new(None),
        }
    }

    /// Attach the thread that feeds this track so stopping can wait for it
    pub fn attach_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.format.kind()
    }

    pub fn format(&self) -> &TrackFormat {
        &self.format
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.samples.subscribe()
    }

    /// Flip the liveness flag and hand back the worker to join
    fn halt(&self) -> Option<JoinHandle<()>> {
        self.live.store(false, Ordering::SeqCst);
        self.worker.lock().take()
    }
}

/// Serializable view of a track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: Uuid,
    pub kind: TrackKind,
    pub format: TrackFormat,
    pub live: bool,
}

/// Serializable view of a held device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub tracks: Vec<TrackSummary>,
}

/// One acquired capture device grant
pub struct Device {
    id: Uuid,
    acquired_at: DateTime<Utc>,
    tracks: Vec<Track>,
}

impl Device {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            id: Uuid::new_v4(),
            acquired_at: Utc::now(),
            tracks,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// First live track of the given kind
    pub fn live_track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == kind && t.is_live())
    }

    pub fn has_live_tracks(&self) -> bool {
        self.tracks.iter().any(Track::is_live)
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id,
            acquired_at: self.acquired_at,
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackSummary {
                    id: t.id,
                    kind: t.kind(),
                    format: t.format.clone(),
                    live: t.is_live(),
                })
                .collect(),
        }
    }

    /// Stop every track and wait for the capture threads to let go of the hardware
    pub async fn stop(self) {
        let workers: Vec<_> = self.tracks.iter().filter_map(Track::halt).collect();

        for worker in workers {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::warn!("Capture thread panicked while stopping"),
                Err(e) => tracing::warn!("Failed to join capture thread: {}", e),
            }
        }

        tracing::info!("Device {} stopped ({} tracks)", self.id, self.tracks.len());
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Threads notice the flag on their next iteration and release the hardware.
        for track in &self.tracks {
            track.live.store(false, Ordering::SeqCst);
        }
    }
}
