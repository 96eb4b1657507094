//! Line protocol codec for the upload service.
//!
//! Every message is a single text line:
//!
//! ```text
//! KIND param1 param2 ...\r\n
//! ```
//!
//! The kind is one of a closed set of tokens, parameters are separated by a
//! single space. Parameters are not escaped, so they must not contain the
//! separator or the line terminator themselves. This is a documented
//! constraint of the protocol and is not checked when encoding.
//!
//! ## Message kinds
//! - `HELO`: server greeting on accept
//! - `LOGIN name`: client requests a session
//! - `SUCCESS kind extra`: positive acknowledgement
//! - `FAILED kind`: negative acknowledgement
//! - `UPLOAD file size`: client announces a transfer
//! - `ACKN file`: server accepts the transfer, raw bytes follow
//! - `LOGOUT`: client ends the session

use bytes::BytesMut;
use std::fmt;
use std::str::{self, FromStr};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

/// Separator between the words of a message line.
pub const SEPARATOR: &str = " ";

/// Terminator of every message line.
pub const END_OF_LINE: &str = "\r\n";

/// Kind of a protocol message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Kind {
    Helo,
    Login,
    Logout,
    Success,
    Failed,
    Upload,
    Ackn,
}

/// Errors produced while decoding a message line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The line held no tokens at all.
    #[error("empty message line")]
    Empty,
    /// The first token is not a known message kind.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    /// The line is not valid UTF-8.
    #[error("message line is not valid UTF-8")]
    InvalidUtf8,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: Kind,
    params: Vec<String>,
}

impl Message {
    /// Create a message from a kind and its parameters.
    pub fn new<I, S>(kind: Kind, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The `i`th parameter, if present.
    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }

    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    /// Encode this message as a terminated line.
    pub fn to_line(&self) -> String {
        encode(self.kind, &self.params[..])
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for param in &self.params {
            write!(f, "{}{}", SEPARATOR, param)?;
        }
        Ok(())
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        decode(line)
    }
}

/// Encode a kind and parameters into a terminated message line.
///
/// The kind is always followed by a separator, so a message without
/// parameters encodes as `"KIND \r\n"`.
pub fn encode<S: AsRef<str>>(kind: Kind, params: &[S]) -> String {
    let joined = params
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<&str>>()
        .join(SEPARATOR);
    let mut line = String::with_capacity(8 + joined.len());
    line.push_str(kind.as_ref());
    line.push_str(SEPARATOR);
    line.push_str(&joined);
    line.push_str(END_OF_LINE);
    line
}

/// Encode a message line directly into an output buffer.
pub fn encode_into<S: AsRef<str>>(output: &mut BytesMut, kind: Kind, params: &[S]) {
    output.extend_from_slice(encode(kind, params).as_bytes());
}

/// Decode a message line.
///
/// Surrounding whitespace and the line terminator are ignored. Kind tokens
/// are matched case-sensitively.
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    let mut words = line.trim().split(SEPARATOR).filter(|w| !w.is_empty());

    let token = words.next().ok_or(DecodeError::Empty)?;
    let kind =
        Kind::from_str(token).map_err(|_| DecodeError::UnknownKind(token.to_string()))?;

    Ok(Message {
        kind,
        params: words.map(str::to_string).collect(),
    })
}

/// Decode a message line from raw bytes.
pub fn decode_bytes(line: &[u8]) -> Result<Message, DecodeError> {
    let line = str::from_utf8(line).map_err(|_| DecodeError::InvalidUtf8)?;
    decode(line)
}

/// Find \r\n in buffer, returning the position of \r.
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}
