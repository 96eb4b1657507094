//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Fairness
//!
//! Each readable connection gets exactly one `read` per iteration. Readiness
//! is edge-triggered, so a connection that just produced data may still have
//! more queued in the kernel (or a pending EOF) without a new event coming.
//! Such connections are carried over to the next iteration, which then polls
//! without blocking, until their read would block.
//!
//! ## Shutdown
//!
//! Once the registry's termination flag is set the listener is dropped, so
//! no new connection is accepted. Open sessions then either run until they
//! log out or disconnect (`Drain`), or are closed at once (`Force`). The loop
//! returns when no session is left.

use crate::config::{Config, ShutdownPolicy};
use crate::runtime::connection::{Flow, Session, SessionSettings, State};
use crate::runtime::registry::{SessionInfo, SessionRegistry};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Per-connection state for the mio backend.
///
/// Wraps the mio `TcpStream` together with the protocol session it drives.
struct MioConnection {
    stream: TcpStream,
    peer: SocketAddr,
    session: Session,
    /// Interest currently registered with the poll instance.
    interest: Interest,
    /// Set after LOGOUT; the connection closes once its output is flushed.
    closing: bool,
}

/// Readiness of one token, copied out of the event list.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// The dispatcher: owns the listener, the poll instance and every connection.
pub(crate) struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    connections: Slab<MioConnection>,
    registry: Arc<SessionRegistry>,
    settings: SessionSettings,
    /// Read window for a single `read` call.
    scratch: Vec<u8>,
    /// Connections that may still have unread data.
    carry_over: Vec<usize>,
    max_connections: usize,
    poll_timeout: Duration,
    shutdown_policy: ShutdownPolicy,
    drain_timeout: Option<Duration>,
    shutdown_started: Option<Instant>,
}

impl Dispatcher {
    /// Create a dispatcher serving `listener`.
    pub(crate) fn new(
        mut listener: TcpListener,
        config: &Config,
        registry: Arc<SessionRegistry>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener: Some(listener),
            connections: Slab::with_capacity(config.max_connections.min(1024)),
            registry,
            settings: SessionSettings::new(config.upload_dir.clone(), config.max_line_length),
            scratch: vec![0u8; config.buffer_size],
            carry_over: Vec::new(),
            max_connections: config.max_connections,
            poll_timeout: config.poll_timeout,
            shutdown_policy: config.shutdown_policy,
            drain_timeout: config.drain_timeout,
            shutdown_started: None,
        })
    }

    /// Run until shutdown has been requested and every session is gone.
    ///
    /// Whatever ends the loop, all remaining sessions are closed and removed
    /// from the registry before returning, so drain waiters are released.
    pub(crate) fn run(mut self) -> io::Result<()> {
        let result = self.dispatch();
        if let Err(ref e) = result {
            error!(error = %e, "Dispatcher failed");
        }
        self.close_all("dispatcher stopped");
        info!("Dispatcher stopped");
        result
    }

    fn dispatch(&mut self) -> io::Result<()> {
        let mut ready: Vec<Ready> = Vec::with_capacity(self.events.capacity());

        loop {
            if self.registry.is_terminating() && self.advance_shutdown() {
                return Ok(());
            }

            let timeout = if self.carry_over.is_empty() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };

            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            ready.clear();
            ready.extend(self.events.iter().map(|event| Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            }));

            let carried = std::mem::take(&mut self.carry_over);

            for event in &ready {
                match event.token {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => self.handle_connection_event(conn_id, *event),
                }
            }

            for conn_id in carried {
                let notified = ready
                    .iter()
                    .any(|event| event.token == Token(conn_id) && event.readable);
                if !notified {
                    self.handle_connection_event(
                        conn_id,
                        Ready {
                            token: Token(conn_id),
                            readable: true,
                            writable: false,
                        },
                    );
                }
            }
        }
    }

    /// Step the shutdown sequence. Returns `true` once the loop may exit.
    fn advance_shutdown(&mut self) -> bool {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            self.shutdown_started = Some(Instant::now());
            info!(
                open_sessions = self.connections.len(),
                policy = ?self.shutdown_policy,
                "Shutdown requested, no longer accepting connections"
            );

            if self.shutdown_policy == ShutdownPolicy::Force {
                self.close_all("forced shutdown");
            }
        }

        if let (Some(limit), Some(started)) = (self.drain_timeout, self.shutdown_started) {
            if !self.connections.is_empty() && started.elapsed() >= limit {
                warn!(
                    open_sessions = self.connections.len(),
                    "Drain timeout elapsed, closing remaining sessions"
                );
                self.close_all("drain timeout");
            }
        }

        self.connections.is_empty()
    }

    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();

                    let descriptor = match stream.local_addr() {
                        Ok(local) => format!("local={},remote={}", local, peer),
                        Err(_) => format!("remote={}", peer),
                    };
                    let mut session = Session::new(conn_id, self.settings.clone());
                    session.greet(&descriptor);

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    let mut conn = MioConnection {
                        stream,
                        peer,
                        session,
                        interest: Interest::READABLE,
                        closing: false,
                    };

                    if let Err(e) = flush_output(self.poll.registry(), conn_id, &mut conn) {
                        debug!(peer = %peer, error = %e, "Failed to send greeting");
                        let _ = self.poll.registry().deregister(&mut conn.stream);
                        continue;
                    }

                    entry.insert(conn);
                    self.registry.insert(conn_id, SessionInfo::new(peer));

                    info!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: Ready) {
        if let Err(e) = self.try_connection_event(conn_id, event) {
            match e.kind() {
                io::ErrorKind::ConnectionAborted => {
                    debug!(conn_id, "Session finished");
                }
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                    debug!(conn_id, error = %e, "Client disconnected");
                }
                _ => {
                    warn!(conn_id, error = %e, "Connection error");
                }
            }
            self.close_connection(conn_id, "connection ended");
        }
    }

    fn try_connection_event(&mut self, conn_id: usize, event: Ready) -> io::Result<()> {
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.readable {
            self.handle_readable(conn_id)?;
        }

        if event.writable {
            self.handle_writable(conn_id)?;
        }

        Ok(())
    }

    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        if conn.closing {
            return Ok(());
        }

        let n = match conn.stream.read(&mut self.scratch) {
            Ok(0) => {
                if conn.session.state() == State::Upload {
                    if let Some(upload) = conn.session.upload() {
                        warn!(
                            conn_id,
                            file = %upload.file_name,
                            received = upload.bytes_received,
                            size = upload.file_size,
                            "Client disconnected during upload"
                        );
                    }
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                self.carry_over.push(conn_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.carry_over.push(conn_id);

        let flow = conn.session.feed(&self.scratch[..n])?;

        if let Some(name) = conn.session.take_new_login() {
            self.registry.set_login(conn_id, name);
        }

        if flow == Flow::Close {
            conn.closing = true;
        }

        flush_output(self.poll.registry(), conn_id, conn)?;

        if conn.closing && !conn.session.has_pending_output() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client logged out",
            ));
        }

        Ok(())
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        flush_output(self.poll.registry(), conn_id, conn)?;

        if conn.closing && !conn.session.has_pending_output() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client logged out",
            ));
        }

        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize, reason: &str) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.registry.remove(conn_id);

            debug!(
                conn_id,
                peer = %conn.peer,
                name = conn.session.name().unwrap_or_default(),
                state = %conn.session.state(),
                uploads = conn.session.uploads_completed(),
                reason,
                "Connection closed"
            );
        }
    }

    fn close_all(&mut self, reason: &str) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            self.close_connection(conn_id, reason);
        }
        self.carry_over.clear();
    }
}

/// Write as much pending output as the socket accepts, then register the
/// interest matching what is left.
fn flush_output(registry: &Registry, conn_id: usize, conn: &mut MioConnection) -> io::Result<()> {
    while conn.session.has_pending_output() {
        match conn.stream.write(conn.session.pending_output()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.session.consume_output(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let wanted = match (conn.closing, conn.session.has_pending_output()) {
        (true, _) => Interest::WRITABLE,
        (false, true) => Interest::READABLE | Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    };

    if wanted != conn.interest {
        registry.reregister(&mut conn.stream, Token(conn_id), wanted)?;
        conn.interest = wanted;
    }

    Ok(())
}
