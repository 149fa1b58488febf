//! TCP relay server for the casper daemon.
//!
//! The server is a single task driving a fixed-order tick:
//!
//! ```text
//!          ┌───────────────────────────────────────────────┐
//!          │ wait ≤ 1s for readiness (listener + clients)  │◀──┐
//!          └──────────────────────┬────────────────────────┘   │
//!                                 ▼                            │
//!   accept ─▶ read ready clients ─▶ relay frames ─▶ stream log ─▶ probe + sweep
//! ```
//!
//! All connection state lives in one [`Registry`] owned by the server, so no
//! locking is needed: every mutation happens on the loop between waits.
//! Shutdown is requested through a `CancellationToken`; the loop observes it
//! at the readiness wait and tears the registry down itself.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failing client is disconnected; only a failed readiness wait stops the loop

mod connection;

pub use connection::{is_transient, Connection, ConnectionError, ReadOutcome};

use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use casper_protocol::{FrameCodec, DEFAULT_BUFFER_CAPACITY};

use crate::registry::{ConnHandle, Registry};
use crate::tailer::LogTailer;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 8080;

/// Default maximum number of concurrent clients
pub const DEFAULT_MAX_CLIENTS: usize = 10;

/// Upper bound on one readiness wait; housekeeping runs at least this often
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Pending-connection queue length (platform maximum)
const LISTEN_BACKLOG: u32 = libc::SOMAXCONN as u32;

/// Event-loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_clients: usize,
    /// Per-connection receive buffer, frame header included
    pub buffer_capacity: usize,
    /// File whose appended bytes are streamed to every client
    pub tail_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_clients: DEFAULT_MAX_CLIENTS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            tail_path: None,
        }
    }
}

/// Summary returned when the loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that were still open and got closed
    pub closed: usize,
}

/// What the readiness wait observed.
#[derive(Default)]
struct Readiness {
    accepted: Option<io::Result<(TcpStream, SocketAddr)>>,
    /// Readable connections, in registry order
    readable: Vec<ConnHandle>,
}

impl Readiness {
    fn is_empty(&self) -> bool {
        self.accepted.is_none() && self.readable.is_empty()
    }
}

/// TCP relay server.
///
/// Owns the listener, the connection registry and the optional log tailer.
pub struct DaemonServer {
    listener: TcpListener,
    registry: Registry<Connection>,
    codec: FrameCodec,
    tailer: Option<LogTailer>,
    config: ServerConfig,
    cancel_token: CancellationToken,
    /// Set while the listener is left out of the readiness set
    deferring: bool,
    /// Listener stays out of the readiness set until then after an accept error
    accept_paused_until: Option<Instant>,
}

impl DaemonServer {
    /// Binds the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(
        config: ServerConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_addr;
        let setup = |e: io::Error| ServerError::SocketSetup {
            addr,
            error: e.to_string(),
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(setup)?;
        socket.set_reuseaddr(true).map_err(setup)?;
        socket.bind(addr).map_err(setup)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(setup)?;

        let tailer = config
            .tail_path
            .as_deref()
            .and_then(|path| match LogTailer::open(path) {
                Ok(tailer) => {
                    info!(path = %path.display(), "Tailing log file");
                    Some(tailer)
                }
                Err(e) => {
                    warn!(error = %e, "Log tailing disabled");
                    None
                }
            });

        info!(
            addr = %listener.local_addr().map_err(setup)?,
            max_clients = config.max_clients,
            "Daemon server listening"
        );

        Ok(Self {
            listener,
            registry: Registry::new(config.max_clients),
            codec: FrameCodec::for_capacity(config.buffer_capacity),
            tailer,
            config,
            cancel_token,
            deferring: false,
            accept_paused_until: None,
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::SocketSetup {
                addr: self.config.bind_addr,
                error: e.to_string(),
            })
    }

    /// Number of registered clients.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs the event loop until the cancellation token fires.
    ///
    /// # Errors
    /// `ServerError::Wait` if the readiness wait itself fails. Client
    /// failures never end the loop.
    pub async fn run(mut self) -> Result<ShutdownReport, ServerError> {
        let cancel_token = self.cancel_token.clone();

        loop {
            let ready = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                ready = self.wait_ready() => ready,
            };

            match ready {
                Ok(ready) => self.tick(ready).await,
                Err(e) => {
                    error!(error = %e, "Readiness wait failed");
                    self.shutdown();
                    return Err(ServerError::Wait(e.to_string()));
                }
            }
        }

        Ok(self.shutdown())
    }

    /// Waits up to one tick for the listener or any client to become ready.
    async fn wait_ready(&self) -> io::Result<Readiness> {
        let accepting = self.accepting(Instant::now());
        let ready = poll_fn(|cx| self.poll_ready(cx, accepting));

        match timeout(TICK_INTERVAL, ready).await {
            Ok(result) => result,
            Err(_) => Ok(Readiness::default()),
        }
    }

    /// Whether the listener joins the next readiness wait.
    fn accepting(&self, now: Instant) -> bool {
        !self.registry.is_full() && self.accept_paused_until.map_or(true, |until| now >= until)
    }

    fn poll_ready(&self, cx: &mut Context<'_>, accepting: bool) -> Poll<io::Result<Readiness>> {
        let mut ready = Readiness::default();

        if accepting {
            if let Poll::Ready(result) = self.listener.poll_accept(cx) {
                ready.accepted = Some(result);
            }
        }

        for (handle, conn) in self.registry.iter() {
            match conn.stream().poll_read_ready(cx) {
                Poll::Ready(Ok(())) => ready.readable.push(handle),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    }

    async fn tick(&mut self, ready: Readiness) {
        if let Some(accepted) = ready.accepted {
            self.accept(accepted);
        }
        self.read_ready(&ready.readable);
        self.relay_frames().await;
        self.stream_log().await;
        self.sweep();
    }

    fn accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                // a persistent failure (EMFILE) would otherwise be ready on every wait
                error!(error = %e, "Failed to accept connection, pausing accepts for one tick");
                self.accept_paused_until = Some(Instant::now() + TICK_INTERVAL);
                return;
            }
        };
        self.accept_paused_until = None;

        let conn = Connection::new(stream, peer, self.config.buffer_capacity);
        match self.registry.register(conn) {
            Ok(handle) => {
                info!(
                    peer = %peer,
                    handle = %handle,
                    clients = self.registry.len(),
                    "Client connected"
                );
                if self.registry.is_full() {
                    warn!(
                        max = self.registry.capacity(),
                        "Maximum clients reached, deferring new connections"
                    );
                    self.deferring = true;
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "Rejected connection"),
        }
    }

    fn read_ready(&mut self, readable: &[ConnHandle]) {
        for &handle in readable {
            let Some(conn) = self.registry.get_mut(handle) else {
                continue;
            };

            match conn.fill() {
                Ok(ReadOutcome::Data(n)) => {
                    trace!(
                        peer = %conn.peer(),
                        bytes = n,
                        buffered = conn.buffered(),
                        "Received data"
                    );
                }
                Ok(ReadOutcome::Transient) => {}
                Ok(ReadOutcome::BufferFull) => {
                    debug!(peer = %conn.peer(), "Receive buffer full, deferring read");
                }
                Ok(ReadOutcome::Closed) => self.disconnect(handle, "closed by peer"),
                Err(e) => {
                    warn!(peer = %conn.peer(), error = %e, "Read failed");
                    self.disconnect(handle, "read error");
                }
            }
        }
    }

    /// Extracts every complete frame and fans each one out as it is parsed.
    async fn relay_frames(&mut self) {
        let mut codec = self.codec;

        for sender in self.registry.handles() {
            loop {
                let frame = match self.registry.get_mut(sender) {
                    Some(conn) if conn.is_alive() && conn.has_header() => {
                        match conn.next_frame(&mut codec) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(
                                    peer = %conn.peer(),
                                    error = %e,
                                    "Malformed frame, disconnecting client"
                                );
                                conn.mark_dead();
                                None
                            }
                        }
                    }
                    _ => None,
                };

                let Some(payload) = frame else {
                    break;
                };
                self.broadcast(sender, &payload).await;
            }
        }
    }

    /// Sends `payload` to every live client except `sender`.
    ///
    /// Only the payload bytes are written, without a length header. Frame
    /// boundaries are honored when parsing a sender's input, but receivers
    /// see consecutive messages as one continuous byte stream.
    async fn broadcast(&mut self, sender: ConnHandle, payload: &[u8]) {
        let mut delivered = 0usize;

        for handle in self.registry.handles() {
            if handle == sender {
                continue;
            }
            let Some(conn) = self.registry.get_mut(handle) else {
                continue;
            };
            if !conn.is_alive() {
                continue;
            }

            match conn.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(peer = %conn.peer(), error = %e, "Failed to relay message");
                    conn.mark_dead();
                }
            }
        }

        debug!(bytes = payload.len(), delivered, "Relayed message");
    }

    async fn stream_log(&mut self) {
        let Some(tailer) = self.tailer.as_mut() else {
            return;
        };

        let chunk = match tailer.poll() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Log tailing disabled");
                self.tailer = None;
                return;
            }
        };

        for handle in self.registry.handles() {
            let Some(conn) = self.registry.get_mut(handle) else {
                continue;
            };
            if !conn.is_alive() {
                continue;
            }
            if let Err(e) = conn.send(&chunk).await {
                debug!(peer = %conn.peer(), error = %e, "Failed to stream log bytes");
                conn.mark_dead();
            }
        }

        trace!(bytes = chunk.len(), "Streamed log bytes");
    }

    /// Probes every client and removes the ones marked dead this tick.
    fn sweep(&mut self) {
        for handle in self.registry.handles() {
            let Some(conn) = self.registry.get_mut(handle) else {
                continue;
            };
            if !conn.is_alive() {
                continue;
            }
            if let Err(e) = conn.probe() {
                debug!(peer = %conn.peer(), error = %e, "Write probe failed");
                conn.mark_dead();
            }
        }

        let dead: Vec<ConnHandle> = self
            .registry
            .iter()
            .filter(|(_, conn)| !conn.is_alive())
            .map(|(handle, _)| handle)
            .collect();
        for handle in dead {
            self.disconnect(handle, "connection error");
        }

        if self.deferring && !self.registry.is_full() {
            info!(clients = self.registry.len(), "Accepting new connections again");
            self.deferring = false;
        }
    }

    fn disconnect(&mut self, handle: ConnHandle, reason: &'static str) {
        if let Some(conn) = self.registry.unregister(handle) {
            info!(
                peer = %conn.peer(),
                reason,
                clients = self.registry.len(),
                "Client disconnected"
            );
        }
    }

    /// Closes every connection and empties the registry.
    fn shutdown(&mut self) -> ShutdownReport {
        let connections = self.registry.drain();
        let closed = connections.len();
        for conn in connections {
            debug!(peer = %conn.peer(), "Closing connection");
        }
        self.tailer = None;

        info!(closed, "Server shutdown complete");
        ShutdownReport { closed }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {addr}: {error}")]
    SocketSetup { addr: SocketAddr, error: String },

    #[error("Readiness wait failed: {0}")]
    Wait(String),
}
