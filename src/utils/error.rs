//! Error types and handling
//!
//! Common error types used across the application.

use crate::capture::DeviceError;
use crate::config::ConfigError;
use crate::encoder::EncoderError;
use crate::session::SessionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

impl From<SessionError> for AppError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Device(e) => AppError::Device(e),
            SessionError::Encoder(e) => AppError::Encoder(e),
        }
    }
}

/// Error response for frontend
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Device(DeviceError::PermissionDenied(_)) => "PERMISSION_DENIED",
            AppError::Device(DeviceError::DeviceUnavailable(_)) => "DEVICE_UNAVAILABLE",
            AppError::Encoder(EncoderError::EncoderUnsupported(_)) => "ENCODER_UNSUPPORTED",
            AppError::Encoder(EncoderError::NoActiveDevice) => "NO_ACTIVE_DEVICE",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        AppError::from(error).into()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
