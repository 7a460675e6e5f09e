//! Outbound connection to the ingest server

pub mod packet;
pub mod socketio;

use bytes::Bytes;

pub use socketio::{IngestEndpoint, SocketIoChannel, SocketIoConfig};

/// Event name every encoded fragment is emitted under
pub const BINARY_STREAM_EVENT: &str = "binarystream";

/// Persistent duplex channel able to emit named binary events
///
/// `send` never blocks and never reports failure; delivery is best-effort.
pub trait TransportChannel: Send + Sync {
    fn send(&self, event: &str, payload: Bytes);

    /// For display only
    fn is_connected(&self) -> bool;
}
