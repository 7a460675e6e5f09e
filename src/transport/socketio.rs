//! socket.io publisher over a websocket-only connection
//!
//! One long-lived connection per process. It reconnects on its own with
//! exponential backoff; callers only ever see `send` and `is_connected`.

use super::packet::{self, OpenInfo, Packet, PONG};
use super::TransportChannel;
use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// How long the server gets to complete the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where to connect: websocket URL plus socket.io namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestEndpoint {
    pub url: String,
    pub namespace: String,
}

impl IngestEndpoint {
    /// Derive the endpoint from an `http(s)://` or `ws(s)://` base URL
    ///
    /// The base URL's path selects the namespace, as socket.io clients do.
    pub fn parse(base: &str) -> Result<Self, String> {
        let (scheme, rest) = base
            .split_once("://")
            .ok_or_else(|| format!("'{base}' is missing a scheme"))?;

        let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(format!("unsupported scheme '{other}'")),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(format!("'{base}' has no host"));
        }

        let path = path.split(['?', '#']).next().unwrap_or("");
        let namespace = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            ns => ns.to_string(),
        };

        Ok(Self {
            url: format!("{ws_scheme}://{authority}/socket.io/?EIO=4&transport=websocket"),
            namespace,
        })
    }
}

/// Connection settings for the ingest socket
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    pub endpoint: IngestEndpoint,
    /// Sent as the `Cookie` header on every connect
    pub cookie: Option<String>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Outbound events buffered before new ones are dropped
    pub queue_capacity: usize,
}

struct Outbound {
    event: String,
    payload: Bytes,
}

/// Fire-and-forget socket.io event publisher
pub struct SocketIoChannel {
    outbound: mpsc::Sender<Outbound>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SocketIoChannel {
    /// Start connecting in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: SocketIoConfig) -> Self {
        let (outbound, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (connected_tx, connected) = watch::channel(false);
        let task = tokio::spawn(run(config, rx, connected_tx));
        Self {
            outbound,
            connected,
            task,
        }
    }

    /// Watch connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

impl TransportChannel for SocketIoChannel {
    fn send(&self, event: &str, payload: Bytes) {
        if !*self.connected.borrow() {
            tracing::trace!("Ingest disconnected, dropping {} ({} bytes)", event, payload.len());
            return;
        }
        let outbound = Outbound {
            event: event.to_string(),
            payload,
        };
        if let Err(e) = self.outbound.try_send(outbound) {
            tracing::debug!("Dropping outbound event: {}", e);
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Next reconnect delay
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

async fn run(
    config: SocketIoConfig,
    mut outbound: mpsc::Receiver<Outbound>,
    connected: watch::Sender<bool>,
) {
    let mut delay = config.reconnect_initial;

    loop {
        match open(&config).await {
            Ok(socket) => {
                tracing::info!("Connected to ingest at {}", config.endpoint.url);
                match session(socket, &config.endpoint.namespace, &mut outbound, &connected).await
                {
                    Ok(()) => tracing::info!("Ingest connection closed"),
                    Err(e) => tracing::warn!("Ingest connection lost: {:#}", e),
                }
                if *connected.borrow() {
                    delay = config.reconnect_initial;
                }
            }
            Err(e) => tracing::warn!("Failed to connect to ingest {}: {:#}", config.endpoint.url, e),
        }

        connected.send_replace(false);

        // Stale media is worthless once the connection dropped.
        while outbound.try_recv().is_ok() {}

        tracing::debug!("Reconnecting to ingest in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = next_backoff(delay, config.reconnect_max);
    }
}

async fn open(config: &SocketIoConfig) -> anyhow::Result<Socket> {
    let mut request = config
        .endpoint
        .url
        .as_str()
        .into_client_request()
        .context("invalid ingest URL")?;

    if let Some(cookie) = &config.cookie {
        let value = HeaderValue::from_str(cookie).context("invalid cookie header")?;
        request.headers_mut().insert(header::COOKIE, value);
    }

    let (socket, _response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| anyhow!("websocket handshake timed out"))??;
    Ok(socket)
}

async fn read_open(stream: &mut SplitStream<Socket>) -> anyhow::Result<OpenInfo> {
    while let Some(message) = stream.next().await {
        if let Message::Text(text) = message? {
            if let Packet::Open(info) = packet::parse(&text) {
                return Ok(info);
            }
        }
    }
    bail!("connection closed before engine.io open")
}

async fn session(
    socket: Socket,
    namespace: &str,
    outbound: &mut mpsc::Receiver<Outbound>,
    connected: &watch::Sender<bool>,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();

    // engine.io open packet, then join the namespace
    let open = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_open(&mut stream))
        .await
        .map_err(|_| anyhow!("engine.io open timed out"))??;

    // Without a ping for this long the server is gone
    let heartbeat = Duration::from_millis(open.ping_interval + open.ping_timeout);

    sink.send(Message::Text(packet::connect_packet(namespace)))
        .await?;

    // Only inbound frames push the deadline out; outbound traffic does not.
    let idle = tokio::time::sleep(heartbeat);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => bail!("no ping from server in {:?}", heartbeat),
            message = stream.next() => {
                let Some(message) = message else {
                    return Ok(());
                };
                let message = message?;
                idle.as_mut().reset(tokio::time::Instant::now() + heartbeat);

                match message {
                    Message::Text(text) => match packet::parse(&text) {
                        Packet::Ping => sink.send(Message::Text(PONG.to_string())).await?,
                        Packet::Connected => {
                            tracing::info!("Joined ingest namespace {} (sid {})", namespace, open.sid);
                            connected.send_replace(true);
                        }
                        Packet::ConnectError(reason) => bail!("namespace connect refused: {}", reason),
                        Packet::Disconnect | Packet::Close => return Ok(()),
                        other => tracing::trace!("Ignoring ingest packet {:?}", other),
                    },
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            next = outbound.recv() => {
                let Some(event) = next else {
                    return Ok(());
                };
                if !*connected.borrow() {
                    continue;
                }
                sink.send(Message::Text(packet::binary_event_header(namespace, &event.event)))
                    .await?;
                sink.send(Message::Binary(event.payload.to_vec())).await?;
                tracing::trace!("Sent {} ({} bytes)", event.event, event.payload.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_http_base() {
        let endpoint = IngestEndpoint::parse("http://localhost:5000").unwrap();
        assert_eq!(
            endpoint.url,
            "ws://localhost:5000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(endpoint.namespace, "/");
    }

    #[test]
    fn test_endpoint_from_https_base_with_namespace() {
        let endpoint = IngestEndpoint::parse("https://ingest.example.com/live/").unwrap();
        assert_eq!(
            endpoint.url,
            "wss://ingest.example.com/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(endpoint.namespace, "/live");
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        assert!(IngestEndpoint::parse("localhost:5000").is_err());
        assert!(IngestEndpoint::parse("ftp://host").is_err());
        assert!(IngestEndpoint::parse("http:///path").is_err());
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let max = Duration::from_secs(10);
        assert_eq!(
            next_backoff(Duration::from_millis(500), max),
            Duration::from_secs(1)
        );
        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(max, max), max);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let channel = SocketIoChannel::connect(SocketIoConfig {
            // Port 9 on loopback: nothing listens, connect fails fast
            endpoint: IngestEndpoint::parse("http://127.0.0.1:9").unwrap(),
            cookie: None,
            reconnect_initial: Duration::from_secs(60),
            reconnect_max: Duration::from_secs(60),
            queue_capacity: 4,
        });

        assert!(!channel.is_connected());
        channel.send("binarystream", Bytes::from_static(b"frag"));
        assert_eq!(channel.outbound.capacity(), 4);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_while_sending() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Joins the namespace, then never pings again
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s","pingInterval":200,"pingTimeout":100}"#.to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if matches!(&message, Message::Text(text) if text.as_str() == "40") {
                    ws.send(Message::Text(r#"40{"sid":"x"}"#.to_string()))
                        .await
                        .unwrap();
                    break;
                }
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        let channel = SocketIoChannel::connect(SocketIoConfig {
            endpoint: IngestEndpoint::parse(&format!("http://{addr}")).unwrap(),
            cookie: None,
            reconnect_initial: Duration::from_secs(60),
            reconnect_max: Duration::from_secs(60),
            queue_capacity: 4,
        });

        let mut connected = channel.subscribe();
        tokio::time::timeout(Duration::from_secs(5), connected.wait_for(|c| *c))
            .await
            .expect("never joined the namespace")
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while channel.is_connected() && tokio::time::Instant::now() < deadline {
            channel.send("binarystream", Bytes::from_static(b"frag"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(!channel.is_connected());
        server.abort();
    }
}
