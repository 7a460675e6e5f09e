//! FFmpeg-based live webm encoder
//!
//! Raw camera frames are piped to FFmpeg's stdin and microphone PCM is fed
//! through a loopback TCP input. FFmpeg muxes a live webm stream to stdout,
//! which is buffered here until the session drains it.

use super::session::{CodecConfig, EncodedStream, EncoderBackend, EncoderError, EncoderInput};
use crate::capture::{MediaSample, TrackFormat};
use anyhow::{bail, Context};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// How long to wait for FFmpeg to connect to the audio socket
const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// FFmpeg encoder name for a codec
fn encoder_name(codec: &str) -> Option<&'static str> {
    match codec {
        "vp8" => Some("libvpx"),
        "vp9" => Some("libvpx-vp9"),
        "opus" => Some("libopus"),
        "vorbis" => Some("libvorbis"),
        _ => None,
    }
}

/// Whether `ffmpeg -encoders` output lists an encoder
fn has_encoder(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(name))
}

fn probe_encoders(ffmpeg: &Path) -> anyhow::Result<String> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .with_context(|| format!("failed to run {}", ffmpeg.display()))?;

    if !output.status.success() {
        bail!("{} -encoders exited with {}", ffmpeg.display(), output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Input arguments for the video track
fn video_input_args(format: &TrackFormat) -> Vec<String> {
    match format {
        // MJPEG frames carry their own dimensions
        TrackFormat::Video {
            fps, pixel_format, ..
        } if pixel_format == "mjpeg" => vec![
            "-f".into(),
            "mjpeg".into(),
            "-framerate".into(),
            fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
        ],
        TrackFormat::Video {
            width,
            height,
            fps,
            pixel_format,
        } => vec![
            "-f".into(),
            "rawvideo".into(),
            "-pixel_format".into(),
            pixel_format.clone(),
            "-video_size".into(),
            format!("{width}x{height}"),
            "-framerate".into(),
            fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
        ],
        TrackFormat::Audio { .. } => Vec::new(),
    }
}

/// Build the full FFmpeg command line
///
/// `audio_port` is the loopback port FFmpeg connects to for PCM input.
pub fn build_args(
    video: Option<&TrackFormat>,
    audio: Option<(&TrackFormat, u16)>,
    codec: &CodecConfig,
    cluster_time: Duration,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    let mut input = 0;
    let mut maps = Vec::new();

    if let Some(format) = video {
        args.extend(video_input_args(format));
        maps.push(format!("{input}:v"));
        input += 1;
    }

    if let Some((TrackFormat::Audio {
        sample_rate,
        channels,
    }, port)) = audio
    {
        args.extend([
            "-f".into(),
            "f32le".into(),
            "-ar".into(),
            sample_rate.to_string(),
            "-ac".into(),
            channels.to_string(),
            "-i".into(),
            format!("tcp://127.0.0.1:{port}"),
        ]);
        maps.push(format!("{input}:a"));
    }

    for map in maps {
        args.extend(["-map".into(), map]);
    }

    if let (Some(TrackFormat::Video { fps, .. }), Some(encoder)) =
        (video, encoder_name(&codec.video_codec))
    {
        args.extend([
            "-c:v".into(),
            encoder.into(),
            "-deadline".into(),
            "realtime".into(),
            "-cpu-used".into(),
            "8".into(),
            "-b:v".into(),
            "1500k".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-g".into(),
            (fps * 2).to_string(),
        ]);
    }

    if let (Some(_), Some(encoder)) = (audio, encoder_name(&codec.audio_codec)) {
        args.extend([
            "-c:a".into(),
            encoder.into(),
            "-b:a".into(),
            "96k".into(),
            // Opus only accepts a handful of rates; resample whatever the mic gives.
            "-ar".into(),
            "48000".into(),
        ]);
    }

    args.extend([
        "-f".into(),
        codec.container.clone(),
        "-live".into(),
        "1".into(),
        "-cluster_time_limit".into(),
        cluster_time.as_millis().to_string(),
        "pipe:1".into(),
    ]);
    args
}

/// Encoder backend that shells out to FFmpeg
pub struct FfmpegEncoderBackend {
    ffmpeg: PathBuf,
    cluster_time: Duration,
    encoders: OnceLock<Result<String, String>>,
}

impl FfmpegEncoderBackend {
    pub fn new(ffmpeg: impl Into<PathBuf>, cluster_time: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            cluster_time,
            encoders: OnceLock::new(),
        }
    }

    /// Run the encoder listing now so the first `check_support` does not wait on it
    pub fn warm_up(&self) {
        match self.encoders() {
            Ok(_) => tracing::info!("FFmpeg at {} is available", self.ffmpeg.display()),
            Err(e) => tracing::warn!("{}", e),
        }
    }

    fn encoders(&self) -> Result<&str, EncoderError> {
        self.encoders
            .get_or_init(|| probe_encoders(&self.ffmpeg).map_err(|e| format!("{e:#}")))
            .as_deref()
            .map_err(|e| EncoderError::EncoderUnsupported(format!("FFmpeg not available: {e}")))
    }
}

impl EncoderBackend for FfmpegEncoderBackend {
    fn check_support(&self, codec: &CodecConfig) -> Result<(), EncoderError> {
        if codec.container != "webm" {
            return Err(EncoderError::EncoderUnsupported(format!(
                "container {} is not supported",
                codec.container
            )));
        }

        let listing = self.encoders()?;
        for name in [&codec.video_codec, &codec.audio_codec] {
            let encoder = encoder_name(name).ok_or_else(|| {
                EncoderError::EncoderUnsupported(format!("codec {name} is not supported"))
            })?;
            if !has_encoder(listing, encoder) {
                return Err(EncoderError::EncoderUnsupported(format!(
                    "FFmpeg was built without {encoder}"
                )));
            }
        }
        Ok(())
    }

    fn open(
        &self,
        input: EncoderInput,
        codec: &CodecConfig,
    ) -> Result<Box<dyn EncodedStream>, EncoderError> {
        if input.is_empty() {
            return Err(EncoderError::NoActiveDevice);
        }
        let EncoderInput { video, audio, .. } = input;

        let unsupported = |what: &str, e: std::io::Error| {
            EncoderError::EncoderUnsupported(format!("{what}: {e}"))
        };

        let audio_listener = match audio {
            Some(_) => Some(
                TcpListener::bind("127.0.0.1:0")
                    .map_err(|e| unsupported("Failed to open audio socket", e))?,
            ),
            None => None,
        };
        let audio_port = match &audio_listener {
            Some(listener) => Some(
                listener
                    .local_addr()
                    .map_err(|e| unsupported("Failed to open audio socket", e))?
                    .port(),
            ),
            None => None,
        };

        let args = build_args(
            video.as_ref().map(|t| &t.format),
            audio.as_ref().zip(audio_port).map(|(t, port)| (&t.format, port)),
            codec,
            self.cluster_time,
        );

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(if video.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| unsupported("Failed to start FFmpeg", e))?;

        tracing::info!("Started FFmpeg live encoder: {}", args.join(" "));

        let running = Arc::new(AtomicBool::new(true));
        let buffer = Arc::new(ParkingMutex::new(Vec::new()));

        if let Some(stderr) = child.stderr.take() {
            let spawned = std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || log_stderr(stderr));
            if let Err(e) = spawned {
                tracing::warn!("Failed to watch FFmpeg stderr: {}", e);
            }
        }

        if let (Some(track), Some(stdin)) = (video, child.stdin.take()) {
            spawn_writer("ffmpeg-video", track.samples, running.clone(), move || Ok(stdin));
        }

        if let (Some(track), Some(listener)) = (audio, audio_listener) {
            let accept_running = running.clone();
            spawn_writer("ffmpeg-audio", track.samples, running.clone(), move || {
                accept_audio(listener, &accept_running)
            });
        }

        if let Some(mut stdout) = child.stdout.take() {
            let buffer = buffer.clone();
            let spawned = std::thread::Builder::new()
                .name("ffmpeg-output".into())
                .spawn(move || {
                    let mut chunk = [0u8; 32 * 1024];
                    loop {
                        match stdout.read(&mut chunk) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
                        }
                    }
                    tracing::debug!("FFmpeg output closed");
                });
            if let Err(e) = spawned {
                let _ = child.kill();
                let _ = child.wait();
                return Err(unsupported("Failed to read FFmpeg output", e));
            }
        }

        Ok(Box::new(FfmpegStream {
            child: Some(child),
            running,
            buffer,
        }))
    }
}

/// Forward FFmpeg's diagnostics to the log until the process exits
///
/// FFmpeg runs with `-loglevel error`, so anything printed here is a problem.
fn log_stderr(stderr: impl Read) -> usize {
    let mut lines = 0;
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::warn!("FFmpeg: {}", line);
        lines += 1;
    }
    lines
}

/// Wait for FFmpeg to connect to the audio input socket
fn accept_audio(listener: TcpListener, running: &AtomicBool) -> std::io::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + AUDIO_CONNECT_TIMEOUT;

    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "FFmpeg did not connect to the audio socket",
    ))
}

/// Copy a track's samples into an FFmpeg input until either side stops
fn spawn_writer<W, F>(
    name: &str,
    mut samples: broadcast::Receiver<MediaSample>,
    running: Arc<AtomicBool>,
    connect: F,
) where
    W: Write,
    F: FnOnce() -> std::io::Result<W> + Send + 'static,
{
    let thread_name = name.to_string();
    let spawned = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut sink = match connect() {
                Ok(sink) => sink,
                Err(e) => {
                    tracing::warn!("{} input unavailable: {}", thread_name, e);
                    return;
                }
            };

            let mut written: u64 = 0;
            while running.load(Ordering::SeqCst) {
                match samples.blocking_recv() {
                    Ok(sample) => {
                        if sink.write_all(&sample.data).is_err() {
                            break;
                        }
                        written += 1;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("{} fell behind, skipped {} samples", thread_name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("{} wrote {} samples", thread_name, written);
        });

    if let Err(e) = spawned {
        tracing::warn!("Failed to spawn {} writer: {}", name, e);
    }
}

struct FfmpegStream {
    child: Option<Child>,
    running: Arc<AtomicBool>,
    buffer: Arc<ParkingMutex<Vec<u8>>>,
}

impl EncodedStream for FfmpegStream {
    fn drain(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.buffer.lock()))
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            // The stream is live; there is no trailer worth waiting for.
            let _ = child.kill();
            match child.wait() {
                Ok(status) => tracing::info!("FFmpeg live encoder exited: {}", status),
                Err(e) => tracing::warn!("Failed to reap FFmpeg: {}", e),
            }
        }
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> TrackFormat {
        TrackFormat::Video {
            width: 1280,
            height: 720,
            fps: 30,
            pixel_format: "yuyv422".to_string(),
        }
    }

    fn audio() -> TrackFormat {
        TrackFormat::Audio {
            sample_rate: 44100,
            channels: 2,
        }
    }

    fn window(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    #[test]
    fn test_encoder_names() {
        assert_eq!(encoder_name("vp8"), Some("libvpx"));
        assert_eq!(encoder_name("opus"), Some("libopus"));
        assert_eq!(encoder_name("h264"), None);
    }

    #[test]
    fn test_has_encoder_matches_whole_name() {
        let listing = "Encoders:\n \
            V....D libvpx               libvpx VP8 (codec vp8)\n \
            V....D libvpx-vp9           libvpx VP9 (codec vp9)\n \
            A....D libopus              libopus Opus (codec opus)\n";
        assert!(has_encoder(listing, "libvpx"));
        assert!(has_encoder(listing, "libopus"));
        assert!(!has_encoder(listing, "libvorbis"));
        assert!(!has_encoder("V....D libvpx-vp9 only", "libvpx"));
    }

    #[test]
    fn test_args_for_video_and_audio() {
        let args = build_args(
            Some(&video()),
            Some((&audio(), 40123)),
            &CodecConfig::default(),
            Duration::from_millis(100),
        );

        assert_eq!(window(&args, "-pixel_format").as_deref(), Some("yuyv422"));
        assert_eq!(window(&args, "-video_size").as_deref(), Some("1280x720"));
        assert!(args.contains(&"pipe:0".to_string()));
        assert!(args.contains(&"tcp://127.0.0.1:40123".to_string()));
        assert!(args.contains(&"0:v".to_string()));
        assert!(args.contains(&"1:a".to_string()));
        assert_eq!(window(&args, "-c:v").as_deref(), Some("libvpx"));
        assert_eq!(window(&args, "-c:a").as_deref(), Some("libopus"));
        assert_eq!(window(&args, "-g").as_deref(), Some("60"));
        assert_eq!(window(&args, "-cluster_time_limit").as_deref(), Some("100"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_args_for_audio_only() {
        let args = build_args(
            None,
            Some((&audio(), 5000)),
            &CodecConfig::default(),
            Duration::from_millis(100),
        );

        assert!(!args.contains(&"pipe:0".to_string()));
        assert!(args.contains(&"0:a".to_string()));
        assert!(window(&args, "-c:v").is_none());
    }

    #[test]
    fn test_args_for_mjpeg_camera() {
        let mjpeg = TrackFormat::Video {
            width: 1920,
            height: 1080,
            fps: 30,
            pixel_format: "mjpeg".to_string(),
        };
        let args = build_args(Some(&mjpeg), None, &CodecConfig::default(), Duration::from_millis(100));

        assert_eq!(window(&args, "-f").as_deref(), Some("mjpeg"));
        assert!(window(&args, "-pixel_format").is_none());
    }

    #[test]
    fn test_missing_ffmpeg_is_unsupported() {
        let backend = FfmpegEncoderBackend::new(
            "/nonexistent/ffmpeg-for-tests",
            Duration::from_millis(100),
        );
        let err = backend.check_support(&CodecConfig::default()).unwrap_err();
        assert!(matches!(err, EncoderError::EncoderUnsupported(_)));
    }

    #[test]
    fn test_stderr_lines_are_logged() {
        let stderr = std::io::Cursor::new(
            "Unknown encoder 'libvpx'\n\n[tcp @ 0x1] Connection refused\n",
        );
        assert_eq!(log_stderr(stderr), 2);
    }

    #[test]
    fn test_warm_up_caches_missing_ffmpeg() {
        let backend = FfmpegEncoderBackend::new(
            "/nonexistent/ffmpeg-for-tests",
            Duration::from_millis(100),
        );
        backend.warm_up();
        assert!(backend.encoders.get().is_some_and(Result::is_err));
    }

    #[test]
    fn test_non_webm_container_is_unsupported() {
        let backend = FfmpegEncoderBackend::new("ffmpeg", Duration::from_millis(100));
        let codec = CodecConfig {
            container: "mp4".to_string(),
            ..CodecConfig::default()
        };
        assert!(matches!(
            backend.check_support(&codec),
            Err(EncoderError::EncoderUnsupported(_))
        ));
    }
}
