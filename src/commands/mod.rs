//! Tauri command handlers
//!
//! This module contains all the IPC command handlers that can be called
//! from the frontend via Tauri's invoke system.

pub mod session;
