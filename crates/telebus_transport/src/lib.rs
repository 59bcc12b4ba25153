//! telebus_transport
//!
//! Wire plumbing between agents and the broker:
//! - `message`: JSON request/reply messages
//! - `tls`: mutual TLS configuration from PEM files
//! - `server`: the broker's WebSocket server
//! - `client`: `WsTransport`, the agent's `BrokerTransport` over WebSocket
//! - `loopback`: an in-process `BrokerTransport`

pub mod client;
pub mod loopback;
pub mod message;
pub mod server;
pub mod tls;

pub use client::WsTransport;
pub use loopback::LoopbackTransport;
pub use message::{ClientMessage, ServerMessage};
pub use server::{ServerError, serve, start_websocket_server};
pub use tls::TlsError;

#[cfg(test)]
mod tests;
