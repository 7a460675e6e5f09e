//! Application configuration.
//!
//! Configuration is loaded from environment variables. The ingest cookie is
//! redacted in Debug output.

use crate::capture::MediaConstraints;
use crate::transport::{IngestEndpoint, SocketIoConfig};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default ingest server base URL.
pub const DEFAULT_INGEST_URL: &str = "http://localhost:5000";

/// Default fragment interval in milliseconds.
pub const DEFAULT_FRAGMENT_INTERVAL_MS: u64 = 100;

/// Default first reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;

/// Default reconnect delay cap in milliseconds.
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

/// Default outbound fragment queue length.
pub const DEFAULT_SEND_QUEUE: usize = 64;

#[derive(Clone)]
pub struct AppConfig {
    /// Ingest endpoint derived from LIVECAST_INGEST_URL.
    pub ingest: IngestEndpoint,

    /// Cookie sent with the ingest connection (credentialed connect).
    pub ingest_cookie: Option<String>,

    /// How often a fragment is cut from the encoder.
    pub fragment_interval: Duration,

    /// Camera to open (nokhwa index).
    pub camera_index: u32,

    /// Whether to capture the microphone alongside the camera.
    pub capture_audio: bool,

    /// FFmpeg binary used for encoding.
    pub ffmpeg_path: PathBuf,

    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,

    /// Outbound fragments buffered while the socket is busy.
    pub send_queue: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("ingest", &self.ingest)
            .field(
                "ingest_cookie",
                &self.ingest_cookie.as_ref().map(|_| "[REDACTED]"),
            )
            .field("fragment_interval", &self.fragment_interval)
            .field("camera_index", &self.camera_index)
            .field("capture_audio", &self.capture_audio)
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("reconnect_initial", &self.reconnect_initial)
            .field("reconnect_max", &self.reconnect_max)
            .field("send_queue", &self.send_queue)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid ingest URL: {0}")]
    InvalidIngestUrl(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        Some(value) => value.trim().parse().map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            reason: format!("got '{}': {}", value, e),
        }),
        None => Ok(default),
    }
}

fn positive_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let value: u64 = parse_var(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(Duration::from_millis(value))
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let ingest_url = vars
            .get("LIVECAST_INGEST_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_INGEST_URL.to_string());
        let ingest = IngestEndpoint::parse(&ingest_url).map_err(ConfigError::InvalidIngestUrl)?;

        let ingest_cookie = vars
            .get("LIVECAST_INGEST_COOKIE")
            .filter(|c| !c.trim().is_empty())
            .cloned();

        let fragment_interval = positive_ms(
            vars,
            "LIVECAST_FRAGMENT_INTERVAL_MS",
            DEFAULT_FRAGMENT_INTERVAL_MS,
        )?;

        let camera_index = parse_var(vars, "LIVECAST_CAMERA_INDEX", 0u32)?;
        let capture_audio = parse_var(vars, "LIVECAST_CAPTURE_AUDIO", true)?;

        let ffmpeg_path = vars
            .get("LIVECAST_FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));

        let reconnect_initial = positive_ms(
            vars,
            "LIVECAST_RECONNECT_INITIAL_MS",
            DEFAULT_RECONNECT_INITIAL_MS,
        )?;
        let reconnect_max =
            positive_ms(vars, "LIVECAST_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?;
        if reconnect_max < reconnect_initial {
            return Err(ConfigError::InvalidValue {
                name: "LIVECAST_RECONNECT_MAX_MS".to_string(),
                reason: format!(
                    "must not be below LIVECAST_RECONNECT_INITIAL_MS ({}ms)",
                    reconnect_initial.as_millis()
                ),
            });
        }

        Ok(AppConfig {
            ingest,
            ingest_cookie,
            fragment_interval,
            camera_index,
            capture_audio,
            ffmpeg_path,
            reconnect_initial,
            reconnect_max,
            send_queue: DEFAULT_SEND_QUEUE,
        })
    }

    /// Settings for the ingest socket
    pub fn socket_config(&self) -> SocketIoConfig {
        SocketIoConfig {
            endpoint: self.ingest.clone(),
            cookie: self.ingest_cookie.clone(),
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
            queue_capacity: self.send_queue,
        }
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: true,
            audio: self.capture_audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = AppConfig::from_vars(&HashMap::new()).unwrap();

        assert_eq!(
            config.ingest.url,
            "ws://localhost:5000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(config.fragment_interval, Duration::from_millis(100));
        assert_eq!(config.camera_index, 0);
        assert!(config.capture_audio);
        assert!(config.ingest_cookie.is_none());
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = AppConfig::from_vars(&vars(&[
            ("LIVECAST_INGEST_URL", "https://ingest.example.com/live"),
            ("LIVECAST_INGEST_COOKIE", "session=abc"),
            ("LIVECAST_FRAGMENT_INTERVAL_MS", "250"),
            ("LIVECAST_CAMERA_INDEX", "2"),
            ("LIVECAST_CAPTURE_AUDIO", "false"),
        ]))
        .unwrap();

        assert_eq!(config.ingest.namespace, "/live");
        assert_eq!(config.ingest_cookie.as_deref(), Some("session=abc"));
        assert_eq!(config.fragment_interval, Duration::from_millis(250));
        assert_eq!(config.camera_index, 2);
        assert!(!config.capture_audio);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("LIVECAST_INGEST_URL", "nonsense")])),
            Err(ConfigError::InvalidIngestUrl(_))
        ));
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("LIVECAST_FRAGMENT_INTERVAL_MS", "0")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("LIVECAST_CAMERA_INDEX", "front")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            AppConfig::from_vars(&vars(&[
                ("LIVECAST_RECONNECT_INITIAL_MS", "5000"),
                ("LIVECAST_RECONNECT_MAX_MS", "1000"),
            ])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_derived_settings() {
        let config = AppConfig::from_vars(&vars(&[
            ("LIVECAST_INGEST_COOKIE", "session=abc"),
            ("LIVECAST_CAPTURE_AUDIO", "false"),
            ("LIVECAST_RECONNECT_INITIAL_MS", "200"),
        ]))
        .unwrap();

        let socket = config.socket_config();
        assert_eq!(socket.endpoint, config.ingest);
        assert_eq!(socket.cookie.as_deref(), Some("session=abc"));
        assert_eq!(socket.reconnect_initial, Duration::from_millis(200));
        assert_eq!(socket.queue_capacity, DEFAULT_SEND_QUEUE);

        let constraints = config.media_constraints();
        assert!(constraints.video);
        assert!(!constraints.audio);
    }

    #[test]
    fn test_debug_redacts_cookie() {
        let config =
            AppConfig::from_vars(&vars(&[("LIVECAST_INGEST_COOKIE", "session=secret")])).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
