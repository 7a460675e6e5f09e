//! Camera preview
//!
//! Keeps the most recent video sample of the held device and turns it into
//! a browser-displayable image on request. Nothing is encoded unless the
//! webview asks for a frame.

use super::device::{Device, MediaSample};
use super::traits::{TrackFormat, TrackKind};
use anyhow::{bail, ensure, Context};
use parking_lot::Mutex as ParkingMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Samples older than this are not shown; the camera has stalled
pub const PREVIEW_MAX_AGE: Duration = Duration::from_secs(2);

/// An encoded preview image
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub mime_type: &'static str,
    pub data: Vec<u8>,
}

struct Latest {
    format: TrackFormat,
    sample: Option<MediaSample>,
}

#[derive(Default)]
pub struct Preview {
    latest: Arc<ParkingMutex<Option<Latest>>>,
    task: ParkingMutex<Option<JoinHandle<()>>>,
}

impl Preview {
    /// Follow the device's video track
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, device: &Device) {
        self.detach();

        let Some(track) = device.live_track(TrackKind::Video) else {
            tracing::debug!("Device {} has no video track to preview", device.id());
            return;
        };

        *self.latest.lock() = Some(Latest {
            format: track.format().clone(),
            sample: None,
        });

        let mut samples = track.subscribe();
        let latest = self.latest.clone();
        let task = tokio::spawn(async move {
            loop {
                match samples.recv().await {
                    Ok(sample) => {
                        let mut latest = latest.lock();
                        let Some(slot) = latest.as_mut() else {
                            break;
                        };
                        slot.sample = Some(sample);
                    }
                    // Only the newest frame matters.
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.task.lock() = Some(task);
    }

    /// Stop following and forget the last frame
    pub fn detach(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.latest.lock() = None;
    }

    /// The latest frame, encoded, if one arrived recently
    pub fn frame(&self) -> Option<PreviewFrame> {
        self.frame_at(Instant::now())
    }

    fn frame_at(&self, now: Instant) -> Option<PreviewFrame> {
        let (format, sample) = {
            let latest = self.latest.lock();
            let latest = latest.as_ref()?;
            (latest.format.clone(), latest.sample.clone()?)
        };

        if now.saturating_duration_since(sample.captured_at) > PREVIEW_MAX_AGE {
            return None;
        }

        match encode_frame(&format, &sample.data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!("Failed to encode preview frame: {:#}", e);
                None
            }
        }
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Encode one raw camera frame for display
pub fn encode_frame(format: &TrackFormat, data: &[u8]) -> anyhow::Result<PreviewFrame> {
    let TrackFormat::Video {
        width,
        height,
        pixel_format,
        ..
    } = format
    else {
        bail!("not a video track");
    };
    let (width, height) = (*width, *height);
    let pixels = width as usize * height as usize;

    let (color, raw) = match pixel_format.as_str() {
        "mjpeg" => {
            return Ok(PreviewFrame {
                mime_type: "image/jpeg",
                data: data.to_vec(),
            })
        }
        "rgb24" => {
            ensure!(data.len() >= pixels * 3, "short rgb24 frame");
            (png::ColorType::Rgb, data[..pixels * 3].to_vec())
        }
        "gray" => {
            ensure!(data.len() >= pixels, "short gray frame");
            (png::ColorType::Grayscale, data[..pixels].to_vec())
        }
        "yuyv422" => (png::ColorType::Rgb, yuyv_to_rgb(data, width, height)?),
        "nv12" => (png::ColorType::Rgb, nv12_to_rgb(data, width, height)?),
        other => bail!("cannot preview {other} frames"),
    };

    Ok(PreviewFrame {
        mime_type: "image/png",
        data: encode_png(width, height, color, &raw)?,
    })
}

fn encode_png(width: u32, height: u32, color: png::ColorType, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(color);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);
        let mut writer = encoder.write_header().context("PNG header")?;
        writer.write_image_data(raw).context("PNG data")?;
    }
    Ok(out)
}

/// BT.601 limited range
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure!(width % 2 == 0, "yuyv422 needs an even width");
    ensure!(data.len() >= pixels * 2, "short yuyv422 frame");

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    ensure!(w % 2 == 0 && h % 2 == 0, "nv12 needs even dimensions");
    ensure!(data.len() >= w * h * 3 / 2, "short nv12 frame");

    let (luma, chroma) = data.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let uv = (row / 2) * w + (col / 2) * 2;
            rgb.extend_from_slice(&yuv_to_rgb(luma[row * w + col], chroma[uv], chroma[uv + 1]));
        }
    }
    Ok(rgb)
}
