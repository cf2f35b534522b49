//! Crate-level error types.
//!
//! [`XapiError`] unifies every failure source (configuration, sockets, TLS,
//! framing, broker rejections) behind a single enum so callers can match on
//! the variant they care about while still using `?` for propagation.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, XapiError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum XapiError {
    /// Configuration was missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(String),

    /// A socket could not be established (TCP connect or TLS handshake).
    #[error("connection failure ({endpoint}): {source}")]
    ConnectionFailure {
        endpoint: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A socket read or write failed on an established connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The operation needs a connection that is not currently open.
    #[error("{0} connection is not open")]
    NotConnected(&'static str),

    /// Bytes on the wire did not form a JSON document.
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// A read did not complete within the configured timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// JSON serialization or deserialization of a typed payload failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker rejected the login.
    #[error("login rejected: {0}")]
    AuthFailure(String),

    /// A streaming subscription was attempted before a stream session id was issued.
    #[error("no stream session id; log in before subscribing")]
    MissingStreamSession,

    /// The broker answered a command with `status: false`.
    #[error("command {command} failed: [{code}] {description}")]
    CommandFailure {
        command: &'static str,
        code: String,
        description: String,
    },

    /// An expected field was missing from a broker payload.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// A bounded retry loop gave up.
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    /// The stream socket could not be restored; the owning slot stops.
    #[error("stream lost: {0}")]
    StreamLost(String),

    /// The closed-trade store could not persist a record.
    #[error("trade store error: {0}")]
    Store(String),

    /// The owning slot was cancelled while the operation was running.
    #[error("cancelled")]
    Cancelled,
}

impl XapiError {
    /// Returns `true` for errors that must stop the whole process rather
    /// than a single slot.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::AuthFailure(_))
    }

    /// Returns `true` if the error means the underlying socket can no longer
    /// be trusted and must be re-established.
    #[must_use]
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::ProtocolFailure(_)
                | Self::Timeout(_)
                | Self::NotConnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        let exhausted = XapiError::RetriesExhausted {
            operation: "connect",
            attempts: 6,
        };
        assert!(exhausted.is_fatal());
        assert!(XapiError::AuthFailure("bad password".into()).is_fatal());
        assert!(!XapiError::ConnectionClosed.is_fatal());
        assert!(!XapiError::DataUnavailable("profit".into()).is_fatal());
    }

    #[test]
    fn broken_connection_classification() {
        assert!(XapiError::ProtocolFailure("garbage".into()).is_connection_broken());
        assert!(XapiError::Timeout(Duration::from_secs(1)).is_connection_broken());
        let rejected = XapiError::CommandFailure {
            command: "tradeTransaction",
            code: "BE005".into(),
            description: "market closed".into(),
        };
        assert!(!rejected.is_connection_broken());
        assert_eq!(
            rejected.to_string(),
            "command tradeTransaction failed: [BE005] market closed"
        );
    }
}
