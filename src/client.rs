//! Blocking upload client.
//!
//! Drives one session with plain blocking I/O:
//!
//! ```text
//! <- HELO descriptor
//! -> LOGIN name             <- SUCCESS LOGIN name
//! -> UPLOAD file size       <- ACKN file
//! -> raw bytes, 32 at a time
//!                           <- SUCCESS UPLOAD file
//! -> LOGOUT
//! ```
//!
//! Any reply other than the expected one aborts the sequence with an error.

use crate::protocol::{self, DecodeError, Kind, Message};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

/// Size of each raw write during an upload.
pub const UPLOAD_CHUNK_SIZE: usize = 32;

/// Client-side errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("expected {expected}, server replied '{received}'")]
    Unexpected { expected: String, received: Message },
    #[error("server closed the connection")]
    Closed,
    #[error("file ended after {sent} of {size} bytes")]
    ShortFile { sent: u64, size: u64 },
}

/// A connected client session.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    greeting: Message,
}

impl Client {
    /// Connect and read the server greeting.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            greeting: Message::new::<_, String>(Kind::Helo, []),
        };

        let greeting = client.receive()?;
        client.greeting = expect_kind(greeting, Kind::Helo, "HELO")?;
        debug!(greeting = %client.greeting, "Connected");
        Ok(client)
    }

    /// The HELO message the server greeted us with.
    pub fn greeting(&self) -> &Message {
        &self.greeting
    }

    /// Log in as `name`.
    pub fn login(&mut self, name: &str) -> Result<(), ClientError> {
        self.send(Kind::Login, &[name])?;
        let reply = self.receive()?;
        expect_success(reply, Kind::Login, name)?;
        Ok(())
    }

    /// Upload `size` bytes read from `data` under `file_name`.
    ///
    /// Returns the number of bytes sent.
    pub fn upload<R: Read>(
        &mut self,
        file_name: &str,
        mut data: R,
        size: u64,
    ) -> Result<u64, ClientError> {
        let size_param = size.to_string();
        self.send(Kind::Upload, &[file_name, size_param.as_str()])?;
        let reply = self.receive()?;
        let ackn = expect_kind(reply, Kind::Ackn, "ACKN")?;
        if ackn.param(0) != Some(file_name) {
            return Err(ClientError::Unexpected {
                expected: format!("ACKN {}", file_name),
                received: ackn,
            });
        }

        let mut chunk = [0u8; UPLOAD_CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(UPLOAD_CHUNK_SIZE as u64) as usize;
            let n = data.read(&mut chunk[..want])?;
            if n == 0 {
                return Err(ClientError::ShortFile { sent, size });
            }
            self.writer.write_all(&chunk[..n])?;
            sent += n as u64;
            trace!(sent, size, "Upload progress");
        }
        self.writer.flush()?;

        let reply = self.receive()?;
        expect_success(reply, Kind::Upload, file_name)?;
        debug!(file = file_name, bytes = sent, "Upload acknowledged");
        Ok(sent)
    }

    /// Upload a local file, named after its final path component.
    pub fn upload_file(&mut self, path: &Path) -> Result<u64, ClientError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no usable file name")
            })?
            .to_string();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        self.upload(&file_name, file, size)
    }

    /// Log out and wait for the server to close the connection.
    pub fn logout(mut self) -> Result<(), ClientError> {
        self.send::<&str>(Kind::Logout, &[])?;
        self.writer.shutdown(Shutdown::Write)?;

        let mut rest = Vec::new();
        self.reader.read_to_end(&mut rest)?;
        debug!(unread = rest.len(), "Logged out");
        Ok(())
    }

    /// Send one message line.
    pub fn send<S: AsRef<str>>(&mut self, kind: Kind, params: &[S]) -> Result<(), ClientError> {
        let line = protocol::encode(kind, params);
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        trace!(line = line.trim_end(), "Sent");
        Ok(())
    }

    /// Write raw bytes outside of message framing.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Receive and decode one message line.
    pub fn receive(&mut self) -> Result<Message, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        trace!(line = line.trim_end(), "Received");
        Ok(protocol::decode(&line)?)
    }
}

fn expect_kind(msg: Message, kind: Kind, expected: &str) -> Result<Message, ClientError> {
    if msg.kind() == kind {
        Ok(msg)
    } else {
        Err(ClientError::Unexpected {
            expected: expected.to_string(),
            received: msg,
        })
    }
}

fn expect_success(msg: Message, origin: Kind, extra: &str) -> Result<Message, ClientError> {
    if msg.kind() == Kind::Success
        && msg.param(0) == Some(origin.as_ref())
        && msg.param(1) == Some(extra)
    {
        Ok(msg)
    } else {
        Err(ClientError::Unexpected {
            expected: format!("SUCCESS {} {}", origin, extra),
            received: msg,
        })
    }
}
