//! Completion driver: satu thread per client yang menjalankan `mio::Poll`.
//!
//! Operasi dikirim lewat channel, lalu poll dibangunkan dengan `Waker`.
//! Setiap operasi membawa state-nya sendiri (clone socket + buffer), jadi
//! beberapa operasi bisa in-flight bersamaan tanpa berbagi field client.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::vec;
use std::thread::{self, JoinHandle};

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use super::buffer::{CompletionBuffer, RoundOutcome};
use super::Shared;
use crate::error::ClientError;
use crate::socket::{into_mio, into_std};

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 64;

/// Work submitted to the driver.
pub(crate) enum Op {
    Connect { host: String, port: u16 },
    Send { stream: TcpStream, bytes: Vec<u8> },
    Receive { stream: TcpStream, buffer: CompletionBuffer },
    /// Fail every pending operation with `ClientError::Aborted`.
    AbortAll,
    Stop,
}

/// Handle to a running driver thread. Dropping it stops the thread.
pub(crate) struct Driver {
    tx: Sender<Op>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Driver {
    pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("netkit-client-io".into())
            .spawn(move || {
                debug!("completion driver started");
                if let Err(e) = Reactor::new(poll, rx, shared).run() {
                    warn!(error = %e, "completion driver stopped on poll error");
                }
                debug!("completion driver stopped");
            })?;

        Ok(Self {
            tx,
            waker,
            thread: Some(thread),
        })
    }

    pub(crate) fn submit(&self, op: Op) -> io::Result<()> {
        self.tx
            .send(op)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "driver thread exited"))?;
        self.waker.wake()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let _ = self.submit(Op::Stop);
        if let Some(handle) = self.thread.take() {
            // Client terakhir bisa di-drop dari handler yang berjalan di thread driver
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

enum Pending {
    Connect {
        source: MioTcpStream,
        host: String,
        port: u16,
        /// Resolved addresses not tried yet.
        remaining: vec::IntoIter<SocketAddr>,
    },
    Send {
        source: MioTcpStream,
        bytes: Vec<u8>,
    },
    Receive {
        source: MioTcpStream,
        buffer: CompletionBuffer,
    },
}

impl Pending {
    fn source(&mut self) -> &mut MioTcpStream {
        match self {
            Pending::Connect { source, .. }
            | Pending::Send { source, .. }
            | Pending::Receive { source, .. } => source,
        }
    }
}

/// State that lives on the driver thread only.
struct Reactor {
    poll: Poll,
    rx: Receiver<Op>,
    shared: Arc<Shared>,
    pending: HashMap<Token, Pending>,
    next_token: usize,
}

impl Reactor {
    fn new(poll: Poll, rx: Receiver<Op>, shared: Arc<Shared>) -> Self {
        Self {
            poll,
            rx,
            shared,
            pending: HashMap::new(),
            next_token: 1,
        }
    }

    fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.abort_all();
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        if !self.drain_submissions() {
                            self.abort_all();
                            return Ok(());
                        }
                    }
                    token => self.progress(token),
                }
            }
        }
    }

    /// Returns `false` once the driver has been told to stop.
    fn drain_submissions(&mut self) -> bool {
        while let Ok(op) = self.rx.try_recv() {
            match op {
                Op::Connect { host, port } => self.start_connect(host, port),
                Op::Send { stream, bytes } => {
                    let register = into_mio(stream).map(|source| Pending::Send { source, bytes });
                    self.register(register, Interest::WRITABLE, ClientError::Send);
                }
                Op::Receive { stream, buffer } => {
                    let register =
                        into_mio(stream).map(|source| Pending::Receive { source, buffer });
                    self.register(register, Interest::READABLE, ClientError::Receive);
                }
                Op::AbortAll => self.abort_all(),
                Op::Stop => return false,
            }
        }
        true
    }

    fn start_connect(&mut self, host: String, port: u16) {
        match resolve(&host, port) {
            Ok(addrs) => self.connect_next(host, port, addrs, None),
            Err(err) => self.shared.events.error.emit(&err),
        }
    }

    /// Try the next resolved address, like `TcpStream::connect` does for
    /// the blocking path. The last failure is reported once none is left.
    fn connect_next(
        &mut self,
        host: String,
        port: u16,
        mut addrs: vec::IntoIter<SocketAddr>,
        mut last_err: Option<io::Error>,
    ) {
        while let Some(addr) = addrs.next() {
            match MioTcpStream::connect(addr) {
                Ok(source) => {
                    trace!(%addr, "connect in progress");
                    let pending = Pending::Connect {
                        source,
                        host,
                        port,
                        remaining: addrs,
                    };
                    let token = self.next_token();
                    return self.insert(token, pending, Interest::WRITABLE);
                }
                Err(e) => last_err = Some(e),
            }
        }

        let source = last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address left to try")
        });
        self.shared
            .events
            .error
            .emit(&ClientError::Connect { host, port, source });
    }

    fn register(
        &mut self,
        pending: io::Result<Pending>,
        interest: Interest,
        on_err: fn(io::Error) -> ClientError,
    ) {
        match pending {
            Ok(pending) => {
                let token = self.next_token();
                self.insert(token, pending, interest);
            }
            Err(e) => self.shared.events.error.emit(&on_err(e)),
        }
    }

    fn insert(&mut self, token: Token, mut pending: Pending, interest: Interest) {
        // Registrasi langsung menghasilkan event kalau socket sudah ready
        if let Err(e) = self
            .poll
            .registry()
            .register(pending.source(), token, interest)
        {
            let err = match pending {
                Pending::Connect { host, port, .. } => ClientError::Connect {
                    host,
                    port,
                    source: e,
                },
                Pending::Send { .. } => ClientError::Send(e),
                Pending::Receive { .. } => ClientError::Receive(e),
            };
            self.shared.events.error.emit(&err);
            return;
        }
        trace!(token = token.0, "operation registered");
        self.pending.insert(token, pending);
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1).max(1);
        token
    }

    fn progress(&mut self, token: Token) {
        let Some(mut pending) = self.pending.remove(&token) else {
            return;
        };

        let mut connected = false;
        let mut retry = None;
        let keep = match &mut pending {
            Pending::Connect {
                source,
                host,
                port,
                remaining,
            } => match connect_state(source) {
                Ok(false) => true,
                Ok(true) => {
                    let _ = self.poll.registry().deregister(source);
                    connected = true;
                    false
                }
                Err(e) => {
                    let _ = self.poll.registry().deregister(source);
                    let rest = std::mem::replace(remaining, Vec::new().into_iter());
                    retry = Some((std::mem::take(host), *port, rest, e));
                    false
                }
            },
            Pending::Send { source, bytes } => match source.write(&bytes[..]) {
                // Satu write saja, tanpa retry untuk partial send
                Ok(n) => {
                    let _ = self.poll.registry().deregister(source);
                    self.shared.events.sent.emit(&n);
                    false
                }
                Err(ref e) if would_block(e) => true,
                Err(e) => {
                    let _ = self.poll.registry().deregister(source);
                    self.shared.events.error.emit(&ClientError::Send(e));
                    false
                }
            },
            Pending::Receive { source, buffer } => {
                let (keep, outcome) = read_rounds(source, buffer);
                if !keep {
                    let _ = self.poll.registry().deregister(source);
                }
                match outcome {
                    Some(Ok(text)) => {
                        debug!(
                            rounds = buffer.rounds(),
                            bytes = buffer.bytes_read(),
                            "receive complete"
                        );
                        self.shared.events.received.emit(&text);
                    }
                    Some(Err(e)) => self.shared.events.error.emit(&ClientError::Receive(e)),
                    None => {}
                }
                keep
            }
        };

        if keep {
            self.pending.insert(token, pending);
        } else if connected {
            self.finish_connect(pending);
        } else if let Some((host, port, rest, e)) = retry {
            drop(pending);
            debug!(%host, port, error = %e, "connect attempt failed");
            self.connect_next(host, port, rest, Some(e));
        }
    }

    fn finish_connect(&mut self, pending: Pending) {
        let Pending::Connect { source, .. } = pending else {
            return;
        };

        let stream = into_std(source);
        match self.shared.install(stream) {
            Ok(()) => self.shared.events.connected.emit(&()),
            Err(err) => self.shared.events.error.emit(&err),
        }
    }

    fn abort_all(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        debug!(count = self.pending.len(), "aborting pending operations");
        for (_, mut pending) in self.pending.drain() {
            let _ = self.poll.registry().deregister(pending.source());
            self.shared.events.error.emit(&ClientError::Aborted);
        }
    }
}

/// Run read rounds until the socket would block or the chain ends.
///
/// Returns whether the operation stays registered and, if it ended, its
/// result (`None` when it ended without a notification).
fn read_rounds(
    source: &mut MioTcpStream,
    buffer: &mut CompletionBuffer,
) -> (bool, Option<io::Result<String>>) {
    loop {
        match source.read(buffer.window()) {
            Ok(n) => match buffer.complete_round(n) {
                // EOF: tidak akan ada event lagi, chain diparkir sampai close
                RoundOutcome::Pending if n == 0 => return (true, None),
                RoundOutcome::Pending => continue,
                RoundOutcome::Complete(text) => return (false, Some(Ok(text))),
                RoundOutcome::Dropped => {
                    debug!(
                        size = buffer.size(),
                        bytes = buffer.bytes_read(),
                        "full round below configured size, receive dropped"
                    );
                    return (false, None);
                }
            },
            Err(ref e) if would_block(e) => return (true, None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (false, Some(Err(e))),
        }
    }
}

/// `Ok(true)` once connected, `Ok(false)` while still in progress.
fn connect_state(source: &MioTcpStream) -> io::Result<bool> {
    if let Some(e) = source.take_error()? {
        return Err(e);
    }
    match source.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(ref e) if would_block(e) => Ok(false),
        Err(e) => Err(e),
    }
}

#[inline]
fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn resolve(host: &str, port: u16) -> Result<vec::IntoIter<SocketAddr>, ClientError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ClientError::Connect {
            host: host.to_string(),
            port,
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ClientError::Unresolved {
            host: host.to_string(),
            port,
        });
    }
    Ok(addrs.into_iter())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_keeps_every_address() {
        let addrs: Vec<_> = resolve("127.0.0.1", 9).unwrap().collect();
        assert_eq!(addrs, vec!["127.0.0.1:9".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_resolve_localhost_yields_loopback() {
        let addrs: Vec<_> = resolve("localhost", 9).unwrap().collect();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }
}
