//! TCP server: accept loop + dispatch per koneksi.
//!
//! Dua strategi dispatch, dipilih saat konstruksi:
//! - `Unbounded`: satu thread baru per koneksi
//! - `Bounded`: worker pool; accept ditahan selama pool penuh, koneksi
//!   baru menunggu di backlog OS

mod connection;
mod pool;

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

pub use connection::Connection;
pub use pool::{Permit, PoolGauge, WorkerPool};

use crate::error::{ServerError, ShutdownError};
use crate::event::Event;
use crate::socket;

/// Default bind address.
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// Default bind port.
pub const DEFAULT_PORT: u16 = 42069;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 128;

/// How accepted connections are handed to `handle_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// Spawn a thread per connection, no bound.
    #[default]
    Unbounded,
    /// Run handlers on a pool of `max_workers` threads; accept only while
    /// a worker is free.
    Bounded { max_workers: usize },
}

impl DispatchStrategy {
    /// Bounded pool sized to the available parallelism.
    pub fn bounded_default() -> Self {
        let max_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        DispatchStrategy::Bounded { max_workers }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub strategy: DispatchStrategy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            strategy: DispatchStrategy::Unbounded,
        }
    }
}

impl ServerConfig {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// State shared by the server, its accept loop and dispatched handlers.
pub(crate) struct Shared {
    handle_client: Event<Connection>,
    active: AtomicUsize,
    closing: AtomicBool,
}

impl Shared {
    pub(crate) fn in_flight(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Counts one dispatched connection for as long as it lives.
struct ActiveGuard {
    shared: Arc<Shared>,
}

impl ActiveGuard {
    fn new(shared: &Arc<Shared>) -> (Self, usize) {
        let now = shared.active.fetch_add(1, Ordering::AcqRel) + 1;
        (
            Self {
                shared: Arc::clone(shared),
            },
            now,
        )
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Capacity reserved for the next accepted connection.
enum Slot {
    Unbounded,
    Pooled(Permit),
}

/// Dispatch strategy, owned by the accept loop.
enum Acceptor {
    SpawnPerConnection,
    Pooled(WorkerPool),
}

impl Acceptor {
    fn new(strategy: DispatchStrategy) -> io::Result<Self> {
        match strategy {
            DispatchStrategy::Unbounded => Ok(Acceptor::SpawnPerConnection),
            DispatchStrategy::Bounded { max_workers } => {
                let max_workers = max_workers.max(1);
                WorkerPool::new(max_workers).map(Acceptor::Pooled)
            }
        }
    }

    /// Block until a connection may be accepted. `None` once closed.
    fn reserve(&self) -> Option<Slot> {
        match self {
            Acceptor::SpawnPerConnection => Some(Slot::Unbounded),
            Acceptor::Pooled(pool) => pool.acquire().map(Slot::Pooled),
        }
    }

    fn dispatch(&self, slot: Slot, shared: &Arc<Shared>, conn: Connection) -> io::Result<()> {
        let (guard, in_flight) = ActiveGuard::new(shared);
        info!(peer = %conn.peer_addr(), in_flight, "client connected");

        match (self, slot) {
            (Acceptor::Pooled(pool), Slot::Pooled(permit)) => {
                // Panic di handler ditangkap oleh worker
                pool.execute(permit, move || serve(&guard.shared, conn));
                Ok(())
            }
            _ => {
                let name = format!("netkit-conn-{}", conn.peer_addr());
                thread::Builder::new().name(name).spawn(move || {
                    let peer = conn.peer_addr();
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| serve(&guard.shared, conn)));
                    if let Err(payload) = result {
                        error!(
                            %peer,
                            panic = pool::panic_message(&*payload),
                            "connection handler panicked"
                        );
                    }
                })?;
                Ok(())
            }
        }
    }
}

/// Run every `handle_client` subscriber, then drop (close) the connection.
fn serve(shared: &Shared, conn: Connection) {
    shared.handle_client.emit(&conn);
}

struct Running {
    waker: Waker,
    thread: JoinHandle<()>,
}

/// TCP server dispatching each accepted connection to `handle_client`.
pub struct Server {
    shared: Arc<Shared>,
    config: ServerConfig,
    listener: Option<TcpListener>,
    acceptor: Option<Acceptor>,
    gate: Option<PoolGauge>,
    running: Option<Running>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Server that binds `config.address:config.port` on `start`.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let acceptor = Acceptor::new(config.strategy)?;
        Ok(Self::build(config, None, acceptor))
    }

    /// Server over an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        strategy: DispatchStrategy,
    ) -> Result<Self, ServerError> {
        let mut config = ServerConfig::default().with_strategy(strategy);
        if let Ok(addr) = listener.local_addr() {
            config.address = addr.ip();
            config.port = addr.port();
        }
        let acceptor = Acceptor::new(strategy)?;
        Ok(Self::build(config, Some(listener), acceptor))
    }

    fn build(config: ServerConfig, listener: Option<TcpListener>, acceptor: Acceptor) -> Self {
        let gate = match &acceptor {
            Acceptor::Pooled(pool) => Some(pool.gauge()),
            Acceptor::SpawnPerConnection => None,
        };
        Self {
            shared: Arc::new(Shared {
                handle_client: Event::new(),
                active: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
            }),
            config,
            listener,
            acceptor: Some(acceptor),
            gate,
            running: None,
            local_addr: None,
        }
    }

    /// Fired once per accepted connection, on the thread that serves it.
    pub fn handle_client(&self) -> &Event<Connection> {
        &self.shared.handle_client
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connections dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(false, |r| !r.thread.is_finished())
    }

    /// Start listening and spawn the accept loop. Returns once the loop
    /// thread is running.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        self.try_start().map_err(|e| {
            error!(error = %e, "server start failed");
            e
        })
    }

    fn try_start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.acceptor.is_none() || self.shared.closing.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyStarted);
        }

        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let addr = self.config.socket_addr();
                TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?
            }
        };
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let mut listener = MioTcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let acceptor = self.acceptor.take().ok_or(ServerError::AlreadyStarted)?;
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("netkit-accept".into())
            .spawn(move || accept_loop(poll, listener, acceptor, shared))?;

        self.running = Some(Running { waker, thread });
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, strategy = ?self.config.strategy, "server listening");
        Ok(local_addr)
    }

    /// Stop the listener and wait for the accept loop to exit. Connections
    /// already dispatched keep running. The server cannot be restarted.
    pub fn close(&mut self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(gate) = &self.gate {
            gate.close();
        }
        self.listener = None;
        self.acceptor = None;

        if let Some(running) = self.running.take() {
            if let Err(e) = running.waker.wake() {
                let err = ShutdownError::new("listener", e);
                error!(error = %err, "could not stop accept loop");
                return;
            }
            if running.thread.thread().id() != thread::current().id()
                && running.thread.join().is_err()
            {
                error!("accept loop panicked");
            }
        }
        info!("server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(mut poll: Poll, listener: MioTcpListener, acceptor: Acceptor, shared: Arc<Shared>) {
    debug!("accept loop started");
    match run_accept(&mut poll, &listener, &acceptor, &shared) {
        Ok(()) => debug!("accept loop stopped"),
        Err(e) => error!(error = %e, "accept loop failed, no further connections accepted"),
    }
}

fn run_accept(
    poll: &mut Poll,
    listener: &MioTcpListener,
    acceptor: &Acceptor,
    shared: &Arc<Shared>,
) -> Result<(), ServerError> {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut reserved: Option<Slot> = None;

    loop {
        if shared.closing.load(Ordering::Acquire) {
            return Ok(());
        }

        // Pesan kapasitas dulu, baru accept
        let slot = match reserved.take() {
            Some(slot) => slot,
            None => match acceptor.reserve() {
                Some(slot) => slot,
                None => return Ok(()),
            },
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                let stream = socket::into_std(stream);
                let conn = match Connection::new(stream, peer, Arc::downgrade(shared)) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping connection");
                        reserved = Some(slot);
                        continue;
                    }
                };
                acceptor.dispatch(slot, shared, conn)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                reserved = Some(slot);
                if !wait_for_listener(poll, &mut events)? {
                    return Ok(());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => reserved = Some(slot),
            Err(e) => return Err(ServerError::Accept(e)),
        }
    }
}

/// Block until the listener is readable. `false` when woken for close.
fn wait_for_listener(poll: &mut Poll, events: &mut Events) -> io::Result<bool> {
    loop {
        match poll.poll(events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if events.iter().any(|event| event.token() == WAKER_TOKEN) {
            return Ok(false);
        }
        if !events.is_empty() {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        let expected: SocketAddr = "127.0.0.1:42069".parse().unwrap();
        assert_eq!(config.socket_addr(), expected);
        assert_eq!(config.strategy, DispatchStrategy::Unbounded);
        assert!(matches!(
            DispatchStrategy::bounded_default(),
            DispatchStrategy::Bounded { max_workers } if max_workers > 0
        ));
    }

    #[test]
    fn test_start_twice_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut server = Server::from_listener(listener, DispatchStrategy::Unbounded).unwrap();
        let addr = server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        server.close();
        assert!(!server.is_running());
    }

    #[test]
    fn test_bind_conflict_reports_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut server = Server::new(ServerConfig::new(DEFAULT_ADDRESS, port)).unwrap();
        assert!(matches!(server.start(), Err(ServerError::Bind { .. })));
    }

    #[test]
    fn test_close_without_start_is_quiet() {
        let mut server = Server::new(
            ServerConfig::default().with_strategy(DispatchStrategy::Bounded { max_workers: 2 }),
        )
        .unwrap();
        server.close();
        server.close();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
    }

    #[test]
    fn test_close_unblocks_saturated_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut server = Server::from_listener(
            listener,
            DispatchStrategy::Bounded { max_workers: 1 },
        )
        .unwrap();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let rx = parking_lot::Mutex::new(rx);
        // Handler menahan satu-satunya worker sampai test selesai
        server.handle_client().subscribe(move |_conn| {
            let _ = rx.lock().recv_timeout(std::time::Duration::from_secs(5));
        });
        let addr = server.start().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(100));
        server.close();
        assert!(!server.is_running());
        drop(tx);
    }
}
