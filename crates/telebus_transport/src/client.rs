//! WebSocket client transport
//!
//! `WsTransport` keeps one lazily opened connection to the broker and runs
//! one request at a time over it. Any I/O failure drops the connection; the
//! next call reconnects. Replies are matched on `request_id`, so a reply to
//! a request the caller already gave up on (timeout) is skipped rather than
//! mistaken for the current one.
//!
//! Failure classification:
//! - refused/reset connections, socket errors, a closed socket → `Transient`
//! - TLS rejection (bad certificate either way), a broker `error` reply,
//!   a malformed URL → `Permanent`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use telebus_client::{BrokerTransport, TransportError};
use telebus_protocol::{Ack, DEFAULT_MAX_ENVELOPE_BYTES, HealthStatus};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{WebSocketStream, client_async_with_config};
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::message::{ClientMessage, ServerMessage};
use crate::server::{Io, ws_config};
use crate::tls;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Connection = WebSocketStream<Box<dyn Io>>;

pub struct WsTransport {
    url: Url,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    connect_timeout: Duration,
    max_envelope_bytes: usize,
    connection: Mutex<Option<Connection>>,
    next_request_id: AtomicU64,
}

impl WsTransport {
    /// `url` is `ws://host:port` or, with [`WsTransport::with_tls`],
    /// `wss://host:port`.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::Permanent(format!("invalid broker url '{url}': {e}")))?;
        if url.host_str().is_none() {
            return Err(TransportError::Permanent(format!(
                "broker url '{url}' has no host"
            )));
        }
        Ok(Self {
            url,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            connection: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Wrap connections in TLS, verifying the broker as `server_name`.
    pub fn with_tls(
        mut self,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, TransportError> {
        let name =
            tls::server_name(server_name).map_err(|e| TransportError::Permanent(e.to_string()))?;
        self.tls = Some((tls::connector(config), name));
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_envelope_bytes(mut self, max: usize) -> Self {
        self.max_envelope_bytes = max;
        self
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| {
                TransportError::Transient(format!(
                    "connect to {} timed out after {} ms",
                    self.url,
                    self.connect_timeout.as_millis()
                ))
            })?
    }

    async fn open(&self) -> Result<Connection, TransportError> {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(80);
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Transient(format!("connect {host}:{port}: {e}")))?;

        let io: Box<dyn Io> = match &self.tls {
            Some((connector, name)) => Box::new(
                connector
                    .connect(name.clone(), tcp)
                    .await
                    .map_err(|e| classify_io("TLS handshake", e))?,
            ),
            None => Box::new(tcp),
        };

        let (ws, _response) = client_async_with_config(
            self.url.as_str(),
            io,
            Some(ws_config(self.max_envelope_bytes)),
        )
        .await
        .map_err(|e| classify_ws("WebSocket handshake", e))?;
        info!(url = %self.url, "connected to broker");
        Ok(ws)
    }

    async fn call(
        &self,
        build: impl FnOnce(u64) -> ClientMessage,
    ) -> Result<ServerMessage, TransportError> {
        let mut guard = self.connection.lock().await;
        let request = build(self.next_request_id.fetch_add(1, Ordering::Relaxed));

        let result = match guard.as_mut() {
            Some(ws) => exchange(ws, &request).await,
            None => {
                let mut ws = self.connect().await?;
                let result = exchange(&mut ws, &request).await;
                *guard = Some(ws);
                result
            }
        };
        if result.is_err() {
            // drop the socket; the next call reconnects
            *guard = None;
        }
        result
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url.as_str())
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn publish(&self, envelope: Vec<u8>) -> Result<Ack, TransportError> {
        match self
            .call(|request_id| ClientMessage::Publish {
                request_id,
                envelope,
            })
            .await?
        {
            ServerMessage::Ack { ack, .. } => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn health(&self) -> Result<HealthStatus, TransportError> {
        match self
            .call(|request_id| ClientMessage::Health { request_id })
            .await?
        {
            ServerMessage::Health { status, .. } => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

async fn exchange(
    ws: &mut Connection,
    request: &ClientMessage,
) -> Result<ServerMessage, TransportError> {
    let text = serde_json::to_string(request)
        .map_err(|e| TransportError::Permanent(format!("cannot encode request: {e}")))?;
    ws.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| classify_ws("send", e))?;

    let request_id = request.request_id();
    while let Some(frame) = ws.next().await {
        let text = match frame.map_err(|e| classify_ws("receive", e))? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let reply: ServerMessage = serde_json::from_str(text.as_str())
            .map_err(|e| TransportError::Permanent(format!("unreadable broker reply: {e}")))?;
        match reply.request_id() {
            Some(id) if id == request_id => return Ok(reply),
            None => return Ok(reply),
            Some(stale) => debug!(stale, request_id, "skipping reply to an abandoned request"),
        }
    }
    Err(TransportError::Transient("connection closed by broker".to_string()))
}

fn unexpected(reply: ServerMessage) -> TransportError {
    match reply {
        ServerMessage::Error { message, .. } => TransportError::Permanent(message),
        other => TransportError::Permanent(format!("unexpected broker reply: {other:?}")),
    }
}

// rustls reports certificate and protocol failures as InvalidData.
fn classify_io(context: &str, e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        TransportError::Permanent(format!("{context}: {e}"))
    } else {
        TransportError::Transient(format!("{context}: {e}"))
    }
}

fn classify_ws(context: &str, e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Io(io) => classify_io(context, io),
        tungstenite::Error::Url(_) | tungstenite::Error::Capacity(_) => {
            TransportError::Permanent(format!("{context}: {e}"))
        }
        other => TransportError::Transient(format!("{context}: {other}")),
    }
}
