//! Broadcast session Tauri commands

use crate::capture::{get_cameras as list_cameras, CameraInfo};
use crate::session::{Outcome, SessionController, SessionStatus, Transition};
use crate::utils::error::ErrorResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tauri::State;

/// Application state for the broadcast session
pub struct BroadcastState {
    pub controller: Arc<SessionController>,
}

impl BroadcastState {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

/// What the frontend gets back from every action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub outcome: Outcome,
    #[serde(flatten)]
    pub status: SessionStatus,
}

async fn respond(controller: &SessionController, transition: Transition) -> ActionResponse {
    ActionResponse {
        outcome: transition.outcome(),
        status: controller.status().await,
    }
}

/// Turn the camera on (Idle → Previewing)
#[tauri::command]
pub async fn start_camera(state: State<'_, BroadcastState>) -> Result<ActionResponse, ErrorResponse> {
    let transition = state.controller.start_camera().await?;
    Ok(respond(&state.controller, transition).await)
}

/// Turn the camera off, ending the broadcast if live
#[tauri::command]
pub async fn stop_camera(state: State<'_, BroadcastState>) -> Result<ActionResponse, ErrorResponse> {
    let transition = state.controller.stop_camera().await?;
    Ok(respond(&state.controller, transition).await)
}

/// Start broadcasting (Previewing → Live)
#[tauri::command]
pub async fn go_live(state: State<'_, BroadcastState>) -> Result<ActionResponse, ErrorResponse> {
    let transition = state.controller.go_live().await?;
    Ok(respond(&state.controller, transition).await)
}

/// Stop broadcasting, keep the preview (Live → Previewing)
#[tauri::command]
pub async fn stop_live(state: State<'_, BroadcastState>) -> Result<ActionResponse, ErrorResponse> {
    let transition = state.controller.stop_live().await?;
    Ok(respond(&state.controller, transition).await)
}

#[tauri::command]
pub async fn get_session_status(
    state: State<'_, BroadcastState>,
) -> Result<SessionStatus, ErrorResponse> {
    Ok(state.controller.status().await)
}

/// Get list of available cameras
#[tauri::command]
pub async fn get_cameras() -> Result<Vec<CameraInfo>, String> {
    tokio::task::spawn_blocking(list_cameras)
        .await
        .map_err(|e| e.to_string())
}
