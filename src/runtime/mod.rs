//! Server runtime.
//!
//! A single dispatcher thread runs a mio event loop (epoll on Linux, kqueue
//! on macOS) over the listener and every client socket:
//! - `Session`: per-connection protocol state machine
//! - `SessionRegistry`: live sessions shared with the controlling thread
//! - `Dispatcher`: the event loop routing readiness to sessions
//!
//! The controlling thread only talks to the dispatcher through the registry:
//! it raises the termination flag and waits for the registry to drain.

mod connection;
mod event_loop;
mod registry;

pub use connection::{Flow, ReadMode, Session, SessionError, SessionSettings, State, Upload};
pub use registry::{SessionInfo, SessionRegistry};

use crate::config::{Config, ConfigError};
use event_loop::Dispatcher;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::info;

/// Errors raised while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A bound, not yet running server.
pub struct Server {
    listener: mio::net::TcpListener,
    local_addr: SocketAddr,
    config: Config,
    registry: Arc<SessionRegistry>,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let addr = config.socket_addr()?;
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Server listening");

        Ok(Self {
            listener: mio::net::TcpListener::from_std(listener),
            local_addr,
            config,
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the dispatcher on the current thread until shutdown completes.
    pub fn run(self) -> io::Result<()> {
        Dispatcher::new(self.listener, &self.config, self.registry)?.run()
    }

    /// Run the dispatcher on its own thread.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let registry = Arc::clone(&self.registry);
        let local_addr = self.local_addr;
        let dispatcher = Dispatcher::new(self.listener, &self.config, self.registry)?;

        let thread = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || dispatcher.run())?;

        Ok(ServerHandle {
            registry,
            local_addr,
            thread,
        })
    }
}

/// Handle to a server running on a dispatcher thread.
pub struct ServerHandle {
    registry: Arc<SessionRegistry>,
    local_addr: SocketAddr,
    thread: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting connections, wait for every session to end, and join
    /// the dispatcher thread.
    pub fn shutdown(self) -> io::Result<()> {
        info!(
            open_sessions = self.registry.len(),
            "Shutting down, waiting for sessions to drain"
        );
        self.registry.await_drain();

        let result = self
            .thread
            .join()
            .map_err(|_| io::Error::other("dispatcher thread panicked"))?;

        info!("Server terminated");
        result
    }
}

/// Create a non-blocking TCP listener bound to `addr`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
