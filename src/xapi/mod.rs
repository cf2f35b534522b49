//! Async client for the xStation xAPI (command + streaming sockets).
//!
//! This module is organized by concern:
//! - [`framing`] - Delimiter-less JSON framing over a byte stream
//! - [`session`] - Connection, login, and reconnection state machine
//! - [`subscription`] - Stream channel subscribe operations
//! - [`handler`] - Incoming push classification and fan-out
//! - [`trading`] - Open/close position and history RPC operations

pub mod framing;
mod handler;
mod session;
mod subscription;
mod trading;

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

use crate::config::XapiConfig;
use crate::{Result, XapiError};

pub use framing::{FrameBuffer, FrameReader, FrameWriter, FramedConnection};
pub use handler::{
    ObserverId, ObserverRegistry, StreamEvent, StreamObserver, StreamRouter, parse_stream_message,
};
pub use session::{Session, SessionStatus, StreamReader, retry};
pub use subscription::{subscribe, symbol_channels};
pub use trading::{
    close_position, historical_candles, margin, open_position, server_time, wait_for_closed_trade,
    wait_for_open_trade,
};

/// Any bidirectional byte stream a framed connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Type-erased socket handed out by a [`Connector`].
pub type BoxedStream = Box<dyn Transport>;

/// Which of the two broker sockets to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Request/response socket.
    Command,
    /// Push socket.
    Stream,
}

impl Endpoint {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Command => "command",
            Endpoint::Stream => "stream",
        }
    }
}

/// Opens raw sockets to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a fresh connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::ConnectionFailure`] if the socket or handshake
    /// cannot be established.
    async fn connect(&self, endpoint: Endpoint) -> Result<BoxedStream>;
}

/// Production [`Connector`]: TCP plus TLS to the configured host.
pub struct BrokerConnector {
    host: String,
    command_port: u16,
    stream_port: u16,
    tls: tokio_rustls::TlsConnector,
}

impl BrokerConnector {
    #[must_use]
    pub fn new(config: &XapiConfig, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            host: config.host.clone(),
            command_port: config.command_port,
            stream_port: config.stream_port,
            tls: tokio_rustls::TlsConnector::from(tls_config),
        }
    }

    fn port(&self, endpoint: Endpoint) -> u16 {
        match endpoint {
            Endpoint::Command => self.command_port,
            Endpoint::Stream => self.stream_port,
        }
    }
}

#[async_trait]
impl Connector for BrokerConnector {
    async fn connect(&self, endpoint: Endpoint) -> Result<BoxedStream> {
        let port = self.port(endpoint);
        let tcp = TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|source| XapiError::ConnectionFailure {
                endpoint: endpoint.as_str(),
                source,
            })?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| XapiError::Tls(format!("invalid server name {}: {e}", self.host)))?;
        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|source| XapiError::ConnectionFailure {
                endpoint: endpoint.as_str(),
                source,
            })?;

        info!(host = %self.host, port, endpoint = endpoint.as_str(), "TLS handshake completed");
        Ok(Box::new(stream))
    }
}
