//! Session registry shared between the dispatcher and the controlling thread.
//!
//! The dispatcher owns every connection outright; the registry only mirrors
//! which sessions are alive so that another thread can observe them and wait
//! for them to go away during shutdown.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Summary of one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    /// Login name, once the client has logged in.
    pub name: Option<String>,
}

impl SessionInfo {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            connected_at: Utc::now(),
            name: None,
        }
    }
}

/// Registry of live sessions plus the shutdown handshake.
///
/// Entries are keyed by the connection id the dispatcher uses as its poll
/// token. Each id is inserted once on accept and removed once on close.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<usize, SessionInfo>,
    terminate: AtomicBool,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly accepted session.
    pub fn insert(&self, id: usize, info: SessionInfo) {
        let previous = self.sessions.insert(id, info);
        debug_assert!(previous.is_none(), "session {id} registered twice");
    }

    /// Attach the login name to a session.
    pub fn set_login(&self, id: usize, name: &str) {
        if let Some(mut info) = self.sessions.get_mut(&id) {
            info.name = Some(name.to_string());
        }
    }

    /// Remove a closed session, waking drain waiters once none are left.
    pub fn remove(&self, id: usize) -> Option<SessionInfo> {
        let removed = self.sessions.remove(&id).map(|(_, info)| info);
        if self.sessions.is_empty() {
            let _guard = self.drain_lock.lock();
            self.drained.notify_all();
        }
        removed
    }

    pub fn get(&self, id: usize) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|info| info.clone())
    }

    pub fn contains(&self, id: usize) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of all live sessions, ordered by id.
    pub fn snapshot(&self) -> Vec<(usize, SessionInfo)> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        sessions.sort_by_key(|(id, _)| *id);
        sessions
    }

    /// Ask the dispatcher to stop accepting connections.
    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Request shutdown and block until every session has been removed.
    pub fn await_drain(&self) {
        self.request_shutdown();
        let mut guard = self.drain_lock.lock();
        while !self.sessions.is_empty() {
            self.drained.wait(&mut guard);
        }
    }

    /// Like [`await_drain`](Self::await_drain) but gives up after `timeout`.
    ///
    /// Returns `true` if the registry drained in time.
    pub fn await_drain_timeout(&self, timeout: Duration) -> bool {
        self.request_shutdown();
        let deadline = Instant::now() + timeout;
        let mut guard = self.drain_lock.lock();
        while !self.sessions.is_empty() {
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                return self.sessions.is_empty();
            }
        }
        true
    }
}
