//! Error types untuk client dan server.
//!
//! Taxonomy:
//! - Connection: connect/accept gagal
//! - Io: send/receive gagal
//! - Shutdown: gagal saat menutup socket/listener (non-fatal, hanya dilaporkan)

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failure reported through a client's `ErrorOccurred` notification.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connecting to the remote host failed.
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Host name did not resolve to any address.
    #[error("no address found for {host}:{port}")]
    Unresolved { host: String, port: u16 },

    /// The client was built from a socket and has no target to connect to.
    #[error("client has no target address")]
    NoTarget,

    /// An operation was issued on a client without a live socket.
    #[error("client is not connected")]
    NotConnected,

    /// The client was closed and cannot be reused.
    #[error("client is closed")]
    Closed,

    /// Send failed.
    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    /// Receive failed.
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    /// Requested receive size does not fit the receive buffer.
    #[error("receive of {requested} bytes exceeds buffer capacity {capacity}")]
    BufferTooSmall { requested: usize, capacity: usize },

    /// A receive of zero bytes was requested.
    #[error("receive target must be at least one byte")]
    EmptyReceive,

    /// The operation was still pending when the client was closed.
    #[error("operation aborted by close")]
    Aborted,

    /// The completion driver could not be started or has stopped.
    #[error("completion driver unavailable: {0}")]
    Driver(#[source] io::Error),

    /// Closing the socket failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl ClientError {
    /// Whether this failure happened while establishing a connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::Unresolved { .. } | ClientError::NoTarget
        )
    }
}

/// Failure while stopping a socket or listener.
#[derive(Debug, Error)]
#[error("shutdown of {what} failed: {source}")]
pub struct ShutdownError {
    pub what: &'static str,
    #[source]
    pub source: io::Error,
}

impl ShutdownError {
    pub fn new(what: &'static str, source: io::Error) -> Self {
        Self { what, source }
    }
}

/// Failure reported by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listening socket failed.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `start()` was called twice, or after `close()`.
    #[error("server already started or closed")]
    AlreadyStarted,

    /// Accepting a connection failed; the accept loop ends.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Poll registration or thread spawn failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stopping the listener failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let err = ClientError::Connect {
            host: "127.0.0.1".into(),
            port: 1,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.is_connection_error());
        assert!(!ClientError::Aborted.is_connection_error());
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_shutdown_error_wraps_transparently() {
        let err: ClientError =
            ShutdownError::new("socket", io::Error::from(io::ErrorKind::NotConnected)).into();
        assert!(err.to_string().starts_with("shutdown of socket failed"));
    }
}
