//! Live encoding
//!
//! - `FragmentEncoder` / `EncodingSession`: fixed-interval fragment delivery
//! - `FfmpegEncoderBackend`: webm (vp8 + opus) through an FFmpeg child process

pub mod ffmpeg;
pub mod session;

pub use ffmpeg::FfmpegEncoderBackend;
pub use session::{
    CodecConfig, EncodedStream, EncoderBackend, EncoderError, EncoderInput, EncodingSession,
    Fragment, FragmentCallback, FragmentEncoder, TrackInput, DEFAULT_FRAGMENT_INTERVAL,
};
