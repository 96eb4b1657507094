//! Per-connection protocol state machine.
//!
//! A `Session` owns everything about one client except the socket: the
//! incremental read buffer, the queue of replies not yet written, the login
//! name and the progress of the current upload. The dispatcher feeds it the
//! bytes of each read and writes out whatever it queued.
//!
//! ```text
//! Connected --LOGIN--> Wait --UPLOAD--> Upload --all bytes--> Wait
//!                       |
//!                       +--LOGOUT--> Logout
//! ```
//!
//! `Connected` and `Wait` consume CRLF-framed message lines. `Upload`
//! consumes raw bytes until the announced size is reached; anything past it
//! stays buffered and is framed as the next message.

use crate::protocol::{self, DecodeError, Kind, Message};
use crate::upload::UploadSink;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Greeting sent, waiting for LOGIN.
    Connected,
    /// Logged in, waiting for UPLOAD or LOGOUT.
    Wait,
    /// Receiving the raw bytes of an upload.
    Upload,
    /// Logged out; the connection closes once replies are flushed.
    Logout,
}

impl State {
    /// Whether the protocol allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::Connected, State::Wait)
                | (State::Wait, State::Upload)
                | (State::Wait, State::Logout)
                | (State::Upload, State::Wait)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Connected => "CONNECTED",
            State::Wait => "WAIT",
            State::Upload => "UPLOAD",
            State::Logout => "LOGOUT",
        };
        f.write_str(name)
    }
}

/// How the bytes currently buffered must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// CRLF-terminated message lines.
    Line,
    /// Raw upload payload, `remaining` bytes still expected.
    Raw { remaining: u64 },
    /// Nothing more is read.
    Closed,
}

/// Outcome of feeding input to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the connection open.
    Continue,
    /// The client logged out; close after flushing pending replies.
    Close,
}

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A message line grew past the configured limit without a terminator.
    #[error("message line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    /// Writing upload data to its destination failed.
    #[error("upload of '{file}' failed: {source}")]
    Upload {
        file: String,
        #[source]
        source: io::Error,
    },
}

impl From<SessionError> for io::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::LineTooLong { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
            SessionError::Upload { source, .. } => source,
        }
    }
}

/// Settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Where uploads are stored; `None` discards the payload.
    pub upload_dir: Option<Arc<Path>>,
    /// Longest accepted message line, terminator excluded.
    pub max_line_length: usize,
}

impl SessionSettings {
    pub fn new(upload_dir: Option<PathBuf>, max_line_length: usize) -> Self {
        Self {
            upload_dir: upload_dir.map(Arc::from),
            max_line_length,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new(None, 1024)
    }
}

/// Progress of the upload in flight.
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub file_size: u64,
    pub bytes_received: u64,
    sink: UploadSink,
}

impl Upload {
    pub fn remaining(&self) -> u64 {
        self.file_size - self.bytes_received
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.file_size
    }
}

/// Protocol state of one client connection.
///
/// Replies accumulate in an unbounded output buffer: a client that keeps
/// sending without reading its replies grows it without limit.
#[derive(Debug)]
pub struct Session {
    id: usize,
    state: State,
    name: Option<String>,
    upload: Option<Upload>,
    uploads_completed: u64,
    new_login: bool,
    read_buf: BytesMut,
    write_buf: BytesMut,
    settings: SessionSettings,
}

impl Session {
    /// Create a session for connection `id`.
    pub fn new(id: usize, settings: SessionSettings) -> Self {
        Self {
            id,
            state: State::Connected,
            name: None,
            upload: None,
            uploads_completed: 0,
            new_login: false,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            settings,
        }
    }

    /// Queue the greeting that opens the conversation.
    pub fn greet(&mut self, descriptor: &str) {
        self.reply(Kind::Helo, &[descriptor]);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Login name, once logged in.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The upload in flight, if any.
    pub fn upload(&self) -> Option<&Upload> {
        self.upload.as_ref()
    }

    /// Number of uploads finished on this connection.
    pub fn uploads_completed(&self) -> u64 {
        self.uploads_completed
    }

    /// Returns the login name exactly once after a successful LOGIN.
    pub fn take_new_login(&mut self) -> Option<&str> {
        if std::mem::take(&mut self.new_login) {
            self.name.as_deref()
        } else {
            None
        }
    }

    pub fn read_mode(&self) -> ReadMode {
        match self.state {
            State::Connected | State::Wait => ReadMode::Line,
            State::Upload => ReadMode::Raw {
                remaining: self.upload.as_ref().map_or(0, Upload::remaining),
            },
            State::Logout => ReadMode::Closed,
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Replies waiting to be written to the socket.
    pub fn pending_output(&self) -> &[u8] {
        &self.write_buf
    }

    pub fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Drop `n` bytes of pending output after they were written.
    pub fn consume_output(&mut self, n: usize) {
        self.write_buf.advance(n);
    }

    /// Append freshly read bytes and process every complete unit of input.
    pub fn feed(&mut self, input: &[u8]) -> Result<Flow, SessionError> {
        self.read_buf.extend_from_slice(input);
        self.process()
    }

    fn process(&mut self) -> Result<Flow, SessionError> {
        loop {
            match self.read_mode() {
                ReadMode::Closed => return Ok(Flow::Close),
                ReadMode::Line => {
                    let Some(line_end) = protocol::find_crlf(&self.read_buf) else {
                        if self.read_buf.len() > self.settings.max_line_length + 1 {
                            return Err(SessionError::LineTooLong {
                                limit: self.settings.max_line_length,
                            });
                        }
                        return Ok(Flow::Continue);
                    };
                    let line = self.read_buf.split_to(line_end + 2);
                    let msg = protocol::decode_bytes(&line[..line_end]);
                    self.handle_message(msg);
                }
                ReadMode::Raw { remaining } => {
                    if self.read_buf.is_empty() || remaining == 0 {
                        return Ok(Flow::Continue);
                    }
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(self.read_buf.len());
                    let chunk = self.read_buf.split_to(take);
                    self.handle_chunk(&chunk)?;
                }
            }
        }
    }

    fn handle_message(&mut self, msg: Result<Message, DecodeError>) {
        if let Ok(ref msg) = msg {
            trace!(conn_id = self.id, state = %self.state, %msg, "Received message");
        }
        match self.state {
            State::Connected => self.on_connected(msg),
            State::Wait => self.on_wait(msg),
            State::Upload | State::Logout => {}
        }
    }

    fn on_connected(&mut self, msg: Result<Message, DecodeError>) {
        match msg {
            Ok(msg) if msg.kind() == Kind::Login => match msg.param(0) {
                Some(name) => {
                    let name = name.to_string();
                    self.reply(Kind::Success, &[Kind::Login.as_ref(), &name]);
                    info!(conn_id = self.id, name = %name, "Client logged in");
                    self.name = Some(name);
                    self.new_login = true;
                    self.transition(State::Wait);
                }
                None => self.fail(Kind::Login, "LOGIN without a name"),
            },
            Ok(msg) => self.fail(Kind::Login, format_args!("expected LOGIN, got {}", msg.kind())),
            Err(e) => self.fail(Kind::Login, e),
        }
    }

    fn on_wait(&mut self, msg: Result<Message, DecodeError>) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => return self.fail(Kind::Upload, e),
        };

        match msg.kind() {
            Kind::Upload => match parse_upload(&msg) {
                Some((file_name, file_size)) => self.start_upload(file_name, file_size),
                None => self.fail(Kind::Upload, "expected a file name and a size"),
            },
            Kind::Logout => {
                info!(
                    conn_id = self.id,
                    name = self.name.as_deref().unwrap_or_default(),
                    uploads = self.uploads_completed,
                    "Client logged out"
                );
                self.transition(State::Logout);
            }
            Kind::Login => self.fail(Kind::Login, "already logged in"),
            other => self.fail(Kind::Upload, format_args!("unexpected {}", other)),
        }
    }

    fn start_upload(&mut self, file_name: &str, file_size: u64) {
        let sink = match UploadSink::open(self.settings.upload_dir.as_deref(), file_name) {
            Ok(sink) => sink,
            Err(e) => return self.fail(Kind::Upload, e),
        };

        debug!(
            conn_id = self.id,
            file = file_name,
            size = file_size,
            path = ?sink.path(),
            "Upload accepted"
        );

        self.upload = Some(Upload {
            file_name: file_name.to_string(),
            file_size,
            bytes_received: 0,
            sink,
        });
        self.reply(Kind::Ackn, &[file_name]);
        self.transition(State::Upload);

        if file_size == 0 {
            // Nothing to receive; an empty upload completes right away.
            if let Err(e) = self.handle_chunk(&[]) {
                self.upload = None;
                self.transition(State::Wait);
                self.fail(Kind::Upload, e);
            }
        }
    }

    fn handle_chunk(&mut self, chunk: &[u8]) -> Result<(), SessionError> {
        let Some(upload) = self.upload.as_mut() else {
            return Ok(());
        };

        debug_assert!(chunk.len() as u64 <= upload.remaining());
        upload
            .sink
            .write_chunk(chunk)
            .map_err(|source| SessionError::Upload {
                file: upload.file_name.clone(),
                source,
            })?;
        upload.bytes_received += chunk.len() as u64;

        trace!(
            conn_id = self.id,
            file = %upload.file_name,
            received = upload.bytes_received,
            size = upload.file_size,
            "Upload progress"
        );

        if !upload.is_complete() {
            return Ok(());
        }

        upload
            .sink
            .finish()
            .map_err(|source| SessionError::Upload {
                file: upload.file_name.clone(),
                source,
            })?;

        let file_name = upload.file_name.clone();
        info!(
            conn_id = self.id,
            file = %file_name,
            bytes = upload.file_size,
            "Upload complete"
        );
        self.upload = None;
        self.uploads_completed += 1;
        self.reply(Kind::Success, &[Kind::Upload.as_ref(), &file_name]);
        self.transition(State::Wait);
        Ok(())
    }

    fn transition(&mut self, next: State) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    fn reply(&mut self, kind: Kind, params: &[&str]) {
        protocol::encode_into(&mut self.write_buf, kind, params);
    }

    fn fail(&mut self, kind: Kind, reason: impl fmt::Display) {
        warn!(
            conn_id = self.id,
            state = %self.state,
            reason = %reason,
            "Replying FAILED {}",
            kind
        );
        self.reply(Kind::Failed, &[kind.as_ref()]);
    }
}

/// Extract `(file name, size)` from an UPLOAD message.
fn parse_upload(msg: &Message) -> Option<(&str, u64)> {
    match msg.params() {
        [file_name, size] => size.parse().ok().map(|size| (file_name.as_str(), size)),
        _ => None,
    }
}
