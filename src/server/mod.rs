// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! WebSocket transport in front of the session layer.
//!
//! One accepted socket maps to exactly one [`Session`]. The socket is
//! split into a reader loop, which feeds raw text frames to dispatch, and
//! a writer task draining the session's outbound channel. When either
//! side of the socket goes away the session closes and every worker it
//! owns is torn down.

use std::env;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::ConnectionState;
use crate::session::Session;

/// Listen address configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Reads `OFFWORKER_HOST` and `OFFWORKER_PORT`, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("OFFWORKER_HOST").unwrap_or(defaults.host),
            port: env::var("OFFWORKER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    /// Applies command line arguments on top of the configuration.
    ///
    /// A single argument overrides the port; two arguments override host
    /// and port. A port that does not parse is an error rather than a
    /// silent fallback.
    pub fn with_args(mut self, args: &[String]) -> Result<Self, std::num::ParseIntError> {
        match args {
            [] => {}
            [port] => self.port = port.parse()?,
            [host, port, ..] => {
                self.host = host.clone();
                self.port = port.parse()?;
            }
        }
        Ok(self)
    }
}

/// A bound listener ready to accept client connections.
pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(Self { listener })
    }

    /// The actual bound address, useful when the configured port is 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, one task per socket.
    pub async fn serve(self) -> anyhow::Result<()> {
        info!("Server listens on port {}.", self.local_addr()?.port());
        loop {
            let (stream, addr) = self.listener.accept().await?;
            tokio::spawn(handle_connection(stream, addr));
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let (outbound, mut outbound_rx) = unbounded_channel::<String>();
    let session = Session::new(outbound);
    session
        .inner()
        .send(ConnectionState::Message, json!("Hello from server!"));

    let writer = tokio::spawn(async move {
        while let Some(encoded) = outbound_rx.recv().await {
            if sink.send(Message::Text(encoded)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => session.handle_message(&text).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => session.handle_message(&text).await,
                Err(_) => debug!("Dropping non-UTF-8 binary frame from {}", addr),
            },
            // tungstenite queues the pong reply itself.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("Socket error from {}: {}", addr, e);
                break;
            }
        }
    }

    session.close();
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start_server() -> SocketAddr {
        let config = ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    async fn next_text<S>(socket: &mut S) -> String
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return text;
            }
        }
    }

    #[test]
    fn test_args_override_port_then_host_and_port() {
        let config = ServerConfig::default().with_args(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);

        let config = ServerConfig::default()
            .with_args(&["9001".to_owned()])
            .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9001);

        let config = ServerConfig::default()
            .with_args(&["127.0.0.1".to_owned(), "9001".to_owned()])
            .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn test_unparsable_port_argument_is_an_error() {
        assert!(ServerConfig::default()
            .with_args(&["not-a-port".to_owned()])
            .is_err());
    }

    #[tokio::test]
    async fn test_connection_is_greeted() {
        let addr = start_server().await;
        let (mut socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        let hello = protocol::decode(&next_text(&mut socket).await).unwrap();
        assert_eq!(hello.state, ConnectionState::Message);
        assert_eq!(hello.data, json!("Hello from server!"));
    }

    #[tokio::test]
    async fn test_buffer_round_trip_over_the_socket() {
        let addr = start_server().await;
        let (mut socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let _hello = next_text(&mut socket).await;

        let buffer_id = "11111111-2222-3333-4444-555555555555";
        let create = protocol::encode(
            ConnectionState::CreateBuffer,
            json!({ "id": buffer_id, "size": 64 }),
            Value::Null,
        )
        .unwrap();
        socket.send(Message::Text(create)).await.unwrap();

        let ready = protocol::decode(&next_text(&mut socket).await).unwrap();
        assert_eq!(ready.state, ConnectionState::BufferReady);
        assert_eq!(ready.data, json!(buffer_id));

        let acquire = protocol::encode(
            ConnectionState::AcquireLockWithSync,
            json!(buffer_id),
            Value::Null,
        )
        .unwrap();
        socket.send(Message::Text(acquire)).await.unwrap();

        let granted = protocol::decode(&next_text(&mut socket).await).unwrap();
        assert_eq!(granted.state, ConnectionState::GetLockWithSync);
        assert_eq!(granted.data, json!(buffer_id));
    }
}
