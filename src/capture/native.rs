//! Native camera + microphone capture
//!
//! The camera is driven by nokhwa and the microphone by cpal. Neither
//! handle is `Send` on every platform, so each lives on its own thread for
//! the whole life of the track and reports back once the hardware is open.

use super::device::{Device, Track, TrackFeed};
use super::traits::{CameraInfo, CaptureBackend, DeviceError, MediaConstraints, TrackFormat};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::time::Duration;
use tokio::sync::oneshot;

/// Consecutive frame errors tolerated before the camera is considered gone
const MAX_FRAME_ERRORS: u32 = 30;

/// Get list of available cameras
pub fn get_cameras() -> Vec<CameraInfo> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .map(|info| {
                let id = match info.index() {
                    CameraIndex::Index(i) => i.to_string(),
                    CameraIndex::String(s) => s.to_string(),
                };
                CameraInfo {
                    id,
                    name: info.human_name().to_string(),
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            Vec::new()
        }
    }
}

/// Capture backend using the system camera and default microphone
pub struct NativeCaptureBackend {
    camera_index: u32,
}

impl NativeCaptureBackend {
    pub fn new(camera_index: u32) -> Self {
        Self { camera_index }
    }
}

#[async_trait]
impl CaptureBackend for NativeCaptureBackend {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Device, DeviceError> {
        if !constraints.video && !constraints.audio {
            return Err(DeviceError::DeviceUnavailable(
                "No video or audio requested".to_string(),
            ));
        }

        let mut tracks = Vec::new();

        if constraints.video {
            tracks.push(open_camera(CameraIndex::Index(self.camera_index)).await?);
        }

        if constraints.audio {
            match open_microphone().await {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    // All or nothing: give the camera back before reporting.
                    Device::new(tracks).stop().await;
                    return Err(e);
                }
            }
        }

        Ok(Device::new(tracks))
    }
}

/// Spawn a capture thread and wait for it to report the opened format
async fn spawn_track<F>(name: &str, run: F) -> Result<Track, DeviceError>
where
    F: FnOnce(TrackFeed, oneshot::Sender<Result<TrackFormat, DeviceError>>) + Send + 'static,
{
    let feed = TrackFeed::new();
    let (ready_tx, ready_rx) = oneshot::channel();

    let thread_feed = feed.clone();
    let handle = std::thread::Builder::new()
        .name(format!("capture-{name}"))
        .spawn(move || run(thread_feed, ready_tx))
        .map_err(|e| DeviceError::DeviceUnavailable(format!("Failed to spawn {name} thread: {e}")))?;

    let format = match ready_rx.await {
        Ok(Ok(format)) => format,
        Ok(Err(e)) => {
            let _ = handle.join();
            return Err(e);
        }
        Err(_) => {
            let _ = handle.join();
            return Err(DeviceError::DeviceUnavailable(format!(
                "{name} capture thread exited before opening"
            )));
        }
    };

    let track = Track::from_feed(format, &feed);
    track.attach_worker(handle);
    Ok(track)
}

/// Map nokhwa FrameFormat to FFmpeg pixel format string
fn ffmpeg_pixel_format(format: FrameFormat) -> &'static str {
    match format {
        FrameFormat::YUYV => "yuyv422",
        FrameFormat::NV12 => "nv12",
        FrameFormat::RAWRGB => "rgb24",
        FrameFormat::GRAY => "gray",
        FrameFormat::MJPEG => "mjpeg",
        _ => {
            tracing::warn!("Unknown camera format {:?}, falling back to yuyv422", format);
            "yuyv422"
        }
    }
}

async fn open_camera(index: CameraIndex) -> Result<Track, DeviceError> {
    spawn_track("camera", move |feed, ready| {
        let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate);

        let mut camera = match Camera::new(index.clone(), format) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to open camera {:?}: {}", index, e);
                let _ = ready.send(Err(DeviceError::from_platform(e.to_string())));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            tracing::error!("Failed to open camera stream: {}", e);
            let _ = ready.send(Err(DeviceError::from_platform(e.to_string())));
            return;
        }

        let camera_format = camera.camera_format();
        let track_format = TrackFormat::Video {
            width: camera_format.resolution().width(),
            height: camera_format.resolution().height(),
            fps: camera_format.frame_rate(),
            pixel_format: ffmpeg_pixel_format(camera_format.format()).to_string(),
        };
        tracing::info!("Camera opened: {:?}", track_format);

        if ready.send(Ok(track_format)).is_err() {
            // Nobody is waiting for this camera any more.
            let _ = camera.stop_stream();
            return;
        }

        let mut frame_errors = 0;
        while feed.is_live() {
            // Blocks until the camera delivers the next frame
            match camera.frame() {
                Ok(frame) => {
                    frame_errors = 0;
                    if !feed.push(Bytes::copy_from_slice(frame.buffer())) {
                        break;
                    }
                }
                Err(e) => {
                    frame_errors += 1;
                    tracing::debug!("Failed to capture frame: {}", e);
                    if frame_errors >= MAX_FRAME_ERRORS {
                        tracing::warn!("Camera stopped delivering frames, ending video track");
                        feed.end();
                    }
                }
            }
        }

        if let Err(e) = camera.stop_stream() {
            tracing::warn!("Error stopping camera stream: {}", e);
        }
        tracing::info!("Camera capture thread stopped");
    })
    .await
}

/// Build an input stream that publishes interleaved f32 little-endian PCM
fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    feed: TrackFeed,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    let error_feed = feed.clone();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let bytes: Vec<u8> = data
                .iter()
                .flat_map(|&sample| sample.to_sample::<f32>().to_le_bytes())
                .collect();
            feed.push(bytes);
        },
        move |err| {
            tracing::error!("Microphone stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                error_feed.end();
            }
        },
        None,
    )
}

async fn open_microphone() -> Result<Track, DeviceError> {
    spawn_track("microphone", move |feed, ready| {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready.send(Err(DeviceError::DeviceUnavailable(
                    "No default input device".to_string(),
                )));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = match device.default_input_config() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready.send(Err(DeviceError::from_platform(format!(
                    "Failed to get audio config: {e}"
                ))));
                return;
            }
        };

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let stream = match sample_format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, feed.clone()),
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, feed.clone()),
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, feed.clone()),
            other => {
                let _ = ready.send(Err(DeviceError::DeviceUnavailable(format!(
                    "Unsupported microphone sample format {other:?}"
                ))));
                return;
            }
        };

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready.send(Err(DeviceError::from_platform(e.to_string())));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready.send(Err(DeviceError::from_platform(e.to_string())));
            return;
        }

        let track_format = TrackFormat::Audio {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };
        tracing::info!("Microphone opened: {} {:?}", device_name, track_format);

        if ready.send(Ok(track_format)).is_err() {
            return;
        }

        // Keep thread alive while the track is live
        while feed.is_live() {
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(stream);
        tracing::info!("Microphone capture thread stopped");
    })
    .await
}
