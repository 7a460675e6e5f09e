//! engine.io v4 / socket.io v5 framing over websocket text frames
//!
//! Only the subset a publishing client needs: the open handshake,
//! heartbeats, namespace connect/disconnect and outbound binary events.

use serde::Deserialize;

/// engine.io pong, sent in reply to every server ping
pub const PONG: &str = "3";

/// Handshake data the server sends in its open packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledged
    Connected,
    /// Namespace connect refused, with the server's reason
    ConnectError(String),
    /// Server-side namespace disconnect
    Disconnect,
    /// Inbound event payload (ignored by the publisher)
    Event(String),
    Unknown(String),
}

/// Strip a leading `/namespace,` from a socket.io packet body
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(i) => &body[i + 1..],
            None => "",
        }
    } else {
        body
    }
}

/// Parse one websocket text frame
pub fn parse(frame: &str) -> Packet {
    let mut chars = frame.chars();
    let Some(kind) = chars.next() else {
        return Packet::Unknown(String::new());
    };
    let rest = chars.as_str();

    match kind {
        '0' => match serde_json::from_str(rest) {
            Ok(info) => Packet::Open(info),
            Err(_) => Packet::Unknown(frame.to_string()),
        },
        '1' => Packet::Close,
        '2' => Packet::Ping,
        '3' => Packet::Pong,
        '6' => Packet::Noop,
        '4' => {
            let mut inner = rest.chars();
            let Some(socket_kind) = inner.next() else {
                return Packet::Unknown(frame.to_string());
            };
            let body = strip_namespace(inner.as_str());
            match socket_kind {
                '0' => Packet::Connected,
                '1' => Packet::Disconnect,
                '2' => Packet::Event(body.to_string()),
                '4' => Packet::ConnectError(body.to_string()),
                _ => Packet::Unknown(frame.to_string()),
            }
        }
        _ => Packet::Unknown(frame.to_string()),
    }
}

/// `/` for the default namespace is implicit on the wire
fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" {
        String::new()
    } else {
        format!("{namespace},")
    }
}

/// Packet joining a namespace
pub fn connect_packet(namespace: &str) -> String {
    format!("40{}", namespace_prefix(namespace))
}

/// Text header of a binary event carrying one attachment
///
/// The attachment itself follows as the next binary websocket frame.
pub fn binary_event_header(namespace: &str, event: &str) -> String {
    let args = serde_json::json!([event, { "_placeholder": true, "num": 0 }]);
    format!("451-{}{}", namespace_prefix(namespace), args)
}
