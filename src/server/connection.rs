//! Handle untuk satu koneksi yang di-accept.
//!
//! Dimiliki sepenuhnya oleh task yang di-dispatch; socket ditutup saat
//! handle di-drop setelah semua handler selesai.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Weak;
use std::time::{Duration, Instant};

use tracing::debug;

use super::Shared;
use crate::error::ShutdownError;
use crate::socket;

/// One accepted connection, passed to every `handle_client` subscriber.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    connected_since: Instant,
    server: Weak<Shared>,
}

impl Connection {
    /// Wrap an accepted socket. The stream is switched back to blocking
    /// mode for the handler.
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        server: Weak<Shared>,
    ) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        Ok(Self {
            stream,
            peer,
            connected_since: Instant::now(),
            server,
        })
    }

    /// Blocking stream. `Read` and `Write` are implemented for `&TcpStream`.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Independent handle to the same socket.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_since(&self) -> Instant {
        self.connected_since
    }

    pub fn age(&self) -> Duration {
        self.connected_since.elapsed()
    }

    /// Connections currently in flight on the owning server, `None` once
    /// the server is gone.
    pub fn in_flight(&self) -> Option<usize> {
        self.server.upgrade().map(|shared| shared.in_flight())
    }

    /// Shut the socket down both ways before the handle is dropped.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        socket::shutdown_both(&self.stream).map_err(|e| ShutdownError::new("connection", e))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(peer = %self.peer, age_ms = self.age().as_millis() as u64, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("connected_since", &self.connected_since)
            .finish()
    }
}
