//! Livecast - camera to ingest server, live.
//!
//! This is the main library crate for the Livecast application.
//! It provides the Tauri application setup and the broadcast session backend.

pub mod capture;
pub mod commands;
pub mod config;
pub mod encoder;
pub mod preferences;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

use capture::{DeviceHandle, NativeCaptureBackend};
use commands::session::BroadcastState;
use config::AppConfig;
use encoder::{CodecConfig, FfmpegEncoderBackend, FragmentEncoder};
use preferences::{JsonPreferenceStore, MemoryPreferenceStore, PreferenceStore};
use session::{SessionController, SessionEvent};
use std::sync::Arc;
use tauri::http::{header, HeaderValue, Response, StatusCode};
use tauri::{AppHandle, Emitter, Manager, RunEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::SocketIoChannel;

/// Frontend event carrying a `SessionStatus`
pub const STATE_EVENT: &str = "session://state";
/// Frontend event carrying an error message
pub const ERROR_EVENT: &str = "session://error";
/// Frontend event carrying ingest connectivity
pub const CONNECTION_EVENT: &str = "session://connection";
/// URI scheme serving the latest camera frame
pub const PREVIEW_SCHEME: &str = "preview";

/// Initialize the application
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livecast=debug,livecast_lib=debug,tauri=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Livecast v{}", env!("CARGO_PKG_VERSION"));

    tauri::Builder::default()
        .register_asynchronous_uri_scheme_protocol(PREVIEW_SCHEME, |ctx, _request, responder| {
            let app = ctx.app_handle().clone();
            tauri::async_runtime::spawn_blocking(move || responder.respond(preview_response(&app)));
        })
        .invoke_handler(tauri::generate_handler![
            commands::session::start_camera,
            commands::session::stop_camera,
            commands::session::go_live,
            commands::session::stop_live,
            commands::session::get_session_status,
            commands::session::get_cameras,
        ])
        .setup(|app| {
            let config = AppConfig::from_env()?;
            tracing::info!("Configuration: {:?}", config);

            let prefs: Arc<dyn PreferenceStore> = match app.path().app_config_dir() {
                Ok(dir) => {
                    let store = JsonPreferenceStore::in_dir(&dir);
                    tracing::debug!("Preferences at {}", store.path().display());
                    Arc::new(store)
                }
                Err(e) => {
                    tracing::warn!("No config directory ({}), camera preference will not persist", e);
                    Arc::new(MemoryPreferenceStore::default())
                }
            };

            let devices = DeviceHandle::new(
                Arc::new(NativeCaptureBackend::new(config.camera_index)),
                prefs,
                config.media_constraints(),
            );
            let ffmpeg = Arc::new(FfmpegEncoderBackend::new(
                config.ffmpeg_path.clone(),
                config.fragment_interval,
            ));
            tauri::async_runtime::spawn_blocking({
                let ffmpeg = ffmpeg.clone();
                move || ffmpeg.warm_up()
            });
            let encoder = FragmentEncoder::new(ffmpeg, CodecConfig::default(), config.fragment_interval);

            // The socket task needs a runtime context to spawn into.
            let transport = Arc::new(tauri::async_runtime::block_on(async {
                SocketIoChannel::connect(config.socket_config())
            }));
            let connectivity = transport.subscribe();

            let controller = Arc::new(SessionController::new(devices, encoder, transport));
            app.manage(BroadcastState::new(controller.clone()));

            forward_events(app.handle().clone(), controller.clone());
            forward_connectivity(app.handle().clone(), connectivity);

            tauri::async_runtime::spawn(async move {
                let state = controller.restore().await;
                tracing::info!("Session starts {}", state);
            });

            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                let state = app.state::<BroadcastState>();
                tauri::async_runtime::block_on(state.controller.teardown());
            }
        });
}

/// Latest camera frame, or 204 when there is nothing to show
fn preview_response(app: &AppHandle) -> Response<Vec<u8>> {
    let frame = app
        .try_state::<BroadcastState>()
        .and_then(|state| state.controller.preview_frame());

    let mut response = match frame {
        Some(frame) => {
            let mut response = Response::new(frame.data);
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(frame.mime_type));
            response
        }
        None => {
            let mut response = Response::new(Vec::new());
            *response.status_mut() = StatusCode::NO_CONTENT;
            response
        }
    };
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Relay controller events to the webview
fn forward_events(app: AppHandle, controller: Arc<SessionController>) {
    let mut events = controller.subscribe();
    tauri::async_runtime::spawn(async move {
        loop {
            let result = match events.recv().await {
                Ok(SessionEvent::StateChanged(status)) => app.emit(STATE_EVENT, status),
                Ok(SessionEvent::Error(message)) => app.emit(ERROR_EVENT, message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} session events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(e) = result {
                tracing::warn!("Failed to emit session event: {}", e);
            }
        }
    });
}

fn forward_connectivity(app: AppHandle, mut connected: watch::Receiver<bool>) {
    tauri::async_runtime::spawn(async move {
        while connected.changed().await.is_ok() {
            let now = *connected.borrow_and_update();
            if let Err(e) = app.emit(CONNECTION_EVENT, now) {
                tracing::warn!("Failed to emit connection event: {}", e);
            }
        }
    });
}
