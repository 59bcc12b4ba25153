//! WebSocket server
//!
//! Accepts TCP connections, optionally wraps them in mutual TLS, upgrades to
//! WebSocket and translates JSON `ClientMessage`s into broker calls:
//! - each connection gets a uuid `conn_id` and its own send loop fed by an
//!   unbounded channel
//! - every `publish` runs on its own task, so one slow WAL append does not
//!   hold up the rest of the connection
//! - replies echo the request's `request_id`; unparseable input gets an
//!   `error` reply and the connection stays open
//!
//! Authentication happens entirely in the TLS layer. A peer that fails the
//! client certificate check never reaches the WebSocket handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use telebus_broker::Broker;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

use crate::message::{ClientMessage, ServerMessage, ws_message_limit};

/// Plain TCP or TLS, behind one type.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn ws_config(max_envelope_bytes: usize) -> WebSocketConfig {
    let limit = ws_message_limit(max_envelope_bytes);
    WebSocketConfig::default()
        .max_message_size(Some(limit))
        .max_frame_size(Some(limit))
}

/// Bind `addr` and serve until the task is dropped.
pub async fn start_websocket_server(
    addr: &str,
    broker: Arc<Broker>,
    tls: Option<TlsAcceptor>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    serve(listener, broker, tls).await;
    Ok(())
}

/// Serve connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, tls: Option<TlsAcceptor>) {
    match listener.local_addr() {
        Ok(local) => {
            let scheme = if tls.is_some() { "wss" } else { "ws" };
            info!("telebus broker listening on {scheme}://{local}");
        }
        Err(e) => warn!(error = %e, "listener has no local address"),
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let broker = broker.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, broker, tls).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    tls: Option<TlsAcceptor>,
) {
    let conn_id = Uuid::new_v4().to_string();

    let io: Box<dyn Io> = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Box::new(tls_stream),
            Err(e) => {
                warn!(%conn_id, %peer, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };

    let ws_stream =
        match accept_async_with_config(io, Some(ws_config(broker.max_envelope_bytes()))).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%conn_id, %peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };
    debug!(%conn_id, %peer, "connection open");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_loop = {
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(%conn_id, error = %e, "send failed");
                    break;
                }
            }
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%conn_id, error = %e, "read failed");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => handle_text(text.as_str(), &conn_id, &broker, &tx),
            WsMessage::Binary(_) => reply(
                &tx,
                &ServerMessage::Error {
                    request_id: None,
                    message: "binary frames are not supported".to_string(),
                },
            ),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    // In-flight publish tasks hold their own sender clones; the send loop
    // ends once they have all replied.
    drop(tx);
    let _ = send_loop.await;
    debug!(%conn_id, %peer, "connection closed");
}

fn handle_text(
    text: &str,
    conn_id: &str,
    broker: &Arc<Broker>,
    tx: &mpsc::UnboundedSender<WsMessage>,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Publish {
            request_id,
            envelope,
        }) => {
            let broker = broker.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let ack = broker.publish(&envelope).await;
                reply(&tx, &ServerMessage::Ack { request_id, ack });
            });
        }
        Ok(ClientMessage::Health { request_id }) => {
            let status = broker.health();
            reply(tx, &ServerMessage::Health { request_id, status });
        }
        Err(e) => {
            warn!(
                %conn_id,
                error = %e,
                "invalid client message: {}",
                text.chars().take(100).collect::<String>()
            );
            reply(
                tx,
                &ServerMessage::Error {
                    request_id: None,
                    message: format!("invalid message: {e}"),
                },
            );
        }
    }
}

fn reply(tx: &mpsc::UnboundedSender<WsMessage>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            // A closed channel means the peer is gone; nothing left to tell it.
            let _ = tx.send(WsMessage::Text(text.into()));
        }
        Err(e) => warn!(error = %e, "failed to encode server message"),
    }
}
