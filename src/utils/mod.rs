//! Shared helpers

pub mod error;

pub use error::{AppError, AppResult, ErrorResponse};
