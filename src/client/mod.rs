//! Async TCP client dengan notifikasi berbasis callback.
//!
//! - `connect` blocking, `connect_async`/`send`/`receive` langsung return
//! - Completion berjalan di thread driver, bukan thread pemanggil
//! - Semua kegagalan dilaporkan lewat event `error`, tidak pernah di-return

mod buffer;
mod driver;

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use buffer::{CompletionBuffer, RoundOutcome, DEFAULT_CAPACITY};

use crate::encoding::Encoding;
use crate::error::{ClientError, ShutdownError};
use crate::event::Event;
use crate::socket::{self, set_recv_buffer};
use driver::{Driver, Op};

/// Default target host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default target port.
pub const DEFAULT_PORT: u16 = 65432;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the buffer allocated for each `receive`.
    pub receive_buffer_capacity: usize,
    /// Decoder for received bytes.
    pub receive_encoding: Encoding,
    /// Kernel receive buffer (`SO_RCVBUF`) applied on connect, unix only.
    pub socket_recv_buffer: Option<usize>,
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            receive_buffer_capacity: DEFAULT_CAPACITY,
            receive_encoding: Encoding::Ascii,
            socket_recv_buffer: None,
            nodelay: true,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_receive_buffer_capacity(mut self, capacity: usize) -> Self {
        self.receive_buffer_capacity = capacity;
        self
    }

    pub fn with_receive_encoding(mut self, encoding: Encoding) -> Self {
        self.receive_encoding = encoding;
        self
    }

    pub fn with_socket_recv_buffer(mut self, bytes: usize) -> Self {
        self.socket_recv_buffer = Some(bytes);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Notifications raised by an [`AsyncClient`].
#[derive(Debug, Default)]
pub struct ClientEvents {
    pub connected: Event<()>,
    /// Byte count the OS reported for one send.
    pub sent: Event<usize>,
    /// Full accumulated text of one receive.
    pub received: Event<String>,
    pub error: Event<ClientError>,
}

/// State shared between the client and its completion driver.
pub(crate) struct Shared {
    pub(crate) events: ClientEvents,
    socket: Mutex<Option<TcpStream>>,
    target: Option<(String, u16)>,
    config: ClientConfig,
}

impl Shared {
    /// Apply socket options and make `stream` the client's socket.
    pub(crate) fn install(&self, stream: TcpStream) -> Result<(), ClientError> {
        let configure = || -> io::Result<()> {
            stream.set_nonblocking(true)?;
            stream.set_nodelay(self.config.nodelay)?;
            if let Some(bytes) = self.config.socket_recv_buffer {
                set_recv_buffer(&stream, bytes)?;
            }
            Ok(())
        };
        configure().map_err(|source| {
            let (host, port) = self.target.clone().unwrap_or_default();
            ClientError::Connect { host, port, source }
        })?;

        if let Ok(peer) = stream.peer_addr() {
            info!(%peer, "client connected");
        }
        *self.socket.lock() = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket
            .lock()
            .as_ref()
            .map_or(false, |s| s.peer_addr().is_ok())
    }

    /// Clone the socket handle for one operation. A failed clone is an I/O
    /// failure of that operation.
    fn operation_socket(
        &self,
        on_err: fn(io::Error) -> ClientError,
    ) -> Result<TcpStream, ClientError> {
        match self.socket.lock().as_ref() {
            Some(stream) => stream.try_clone().map_err(on_err),
            None => Err(ClientError::NotConnected),
        }
    }
}

/// TCP client whose operations complete through [`ClientEvents`].
///
/// Operations issued back to back carry no ordering guarantee between
/// each other; notifications fire on the client's driver thread.
pub struct AsyncClient {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
    closed: AtomicBool,
}

impl AsyncClient {
    /// Unconnected client targeting `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(ClientConfig::new(host, port))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let target = Some((config.host.clone(), config.port));
        Self::build(target, config)
    }

    /// Wrap an already connected socket. The client has no target, so
    /// `connect` on it only reports [`ClientError::NoTarget`] once the
    /// socket is gone.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::from_stream_with_config(stream, ClientConfig::default())
    }

    pub fn from_stream_with_config(stream: TcpStream, config: ClientConfig) -> Self {
        let client = Self::build(None, config);
        if let Err(err) = client.shared.install(stream) {
            warn!(error = %err, "wrapped socket could not be configured");
        }
        client
    }

    fn build(target: Option<(String, u16)>, config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                events: ClientEvents::default(),
                socket: Mutex::new(None),
                target,
                config,
            }),
            driver: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &ClientEvents {
        &self.shared.events
    }

    pub fn host(&self) -> Option<&str> {
        self.shared.target.as_ref().map(|(host, _)| host.as_str())
    }

    pub fn port(&self) -> Option<u16> {
        self.shared.target.as_ref().map(|(_, port)| *port)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Derived from the socket on every call.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Blocking connect. Raises `connected` or `error`.
    pub fn connect(&self) {
        if self.is_connected() {
            return;
        }
        let (host, port) = match self.target() {
            Ok(target) => target,
            Err(err) => return self.report(err),
        };

        debug!(%host, port, "connecting");
        match TcpStream::connect((host.as_str(), port)) {
            Ok(stream) => match self.shared.install(stream) {
                Ok(()) => self.shared.events.connected.emit(&()),
                Err(err) => self.report(err),
            },
            Err(source) => self.report(ClientError::Connect { host, port, source }),
        }
    }

    /// Non-blocking connect; completion raises `connected` or `error`.
    pub fn connect_async(&self) {
        if self.is_connected() {
            return;
        }
        match self.target() {
            Ok((host, port)) => self.submit(Op::Connect { host, port }),
            Err(err) => self.report(err),
        }
    }

    /// Encode `data` and issue one non-blocking send of the whole sequence.
    ///
    /// `sent` carries whatever count the OS reported for that single write;
    /// a partial write is not retried.
    pub fn send(&self, data: &str, encoding: Encoding) {
        let bytes = encoding.encode(data);
        match self.operation_socket(ClientError::Send) {
            Ok(stream) => self.submit(Op::Send { stream, bytes }),
            Err(err) => self.report(err),
        }
    }

    /// Start a receive chain configured for `target`-byte rounds.
    ///
    /// Rounds shorter than `target` re-issue into the same buffer. The first
    /// full round ends the chain and raises `received` with all accumulated
    /// text, provided that text is at least `target` characters long.
    /// A chain whose last round is short never completes until `close`.
    pub fn receive(&self, target: usize) {
        let buffer = match CompletionBuffer::new(
            self.shared.config.receive_buffer_capacity,
            target,
            self.shared.config.receive_encoding,
        ) {
            Ok(buffer) => buffer,
            Err(err) => return self.report(err),
        };

        match self.operation_socket(ClientError::Receive) {
            Ok(stream) => self.submit(Op::Receive { stream, buffer }),
            Err(err) => self.report(err),
        }
    }

    /// Close the socket. No-op when not connected. Pending operations are
    /// aborted and each raises `error`. The client is terminal afterwards.
    pub fn close(&self) {
        if !self.is_connected() {
            return;
        }
        self.closed.store(true, Ordering::Release);

        let stream = self.shared.socket.lock().take();
        if let Some(stream) = stream {
            if let Err(e) = socket::shutdown_both(&stream) {
                self.report(ShutdownError::new("client socket", e).into());
            }
            drop(stream);
        }

        if let Some(driver) = self.driver.lock().as_ref() {
            if let Err(e) = driver.submit(Op::AbortAll) {
                warn!(error = %e, "could not abort pending operations");
            }
        }
        info!("client closed");
    }

    fn target(&self) -> Result<(String, u16), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.shared.target.clone().ok_or(ClientError::NoTarget)
    }

    fn operation_socket(
        &self,
        on_err: fn(io::Error) -> ClientError,
    ) -> Result<TcpStream, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.shared.operation_socket(on_err)
    }

    fn submit(&self, op: Op) {
        let mut driver = self.driver.lock();
        if driver.is_none() {
            match Driver::spawn(Arc::clone(&self.shared)) {
                Ok(spawned) => *driver = Some(spawned),
                Err(e) => {
                    drop(driver);
                    return self.report(ClientError::Driver(e));
                }
            }
        }

        let result = match driver.as_ref() {
            Some(d) => d.submit(op),
            None => return,
        };
        drop(driver);
        if let Err(e) = result {
            self.report(ClientError::Driver(e));
        }
    }

    fn report(&self, err: ClientError) {
        debug!(error = %err, "client operation failed");
        self.shared.events.error.emit(&err);
    }
}

impl Default for AsyncClient {
    fn default() -> Self {
        Self::with_config(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn count<T: 'static>(event: &Event<T>) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        event.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        counter
    }

    #[test]
    fn test_defaults() {
        let client = AsyncClient::default();
        assert_eq!(client.host(), Some(DEFAULT_HOST));
        assert_eq!(client.port(), Some(DEFAULT_PORT));
        assert_eq!(client.config().receive_buffer_capacity, DEFAULT_CAPACITY);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_close_unconnected_is_noop() {
        let client = AsyncClient::new("127.0.0.1", 1);
        let errors = count(&client.events().error);
        client.close();
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_twice_fires_connected_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = AsyncClient::new("127.0.0.1", port);
        let connected = count(&client.events().connected);
        let errors = count(&client.events().error);

        client.connect();
        client.connect();
        client.connect_async();

        assert!(client.is_connected());
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_refused_reports_error() {
        // Port dari listener yang sudah ditutup
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = AsyncClient::new("127.0.0.1", port);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.events().error.subscribe(move |err: &ClientError| {
            let _ = tx.lock().send(err.is_connection_error());
        });

        client.connect();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_send_without_socket_reports_not_connected() {
        let client = AsyncClient::new("127.0.0.1", 1);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.events().error.subscribe(move |err: &ClientError| {
            let _ = tx
                .lock()
                .send(matches!(err, ClientError::NotConnected));
        });

        client.send("hello", Encoding::Ascii);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(true));
    }

    #[test]
    fn test_oversized_receive_reports_error() {
        let client = AsyncClient::with_config(
            ClientConfig::new("127.0.0.1", 1).with_receive_buffer_capacity(8),
        );
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.events().error.subscribe(move |err: &ClientError| {
            let _ = tx
                .lock()
                .send(matches!(err, ClientError::BufferTooSmall { requested: 9, capacity: 8 }));
        });

        client.receive(9);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(true));
    }

    #[test]
    fn test_from_stream_has_no_target() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let client = AsyncClient::from_stream(stream);
        assert!(client.is_connected());
        assert_eq!(client.host(), None);

        client.close();
        assert!(!client.is_connected());
    }
}
