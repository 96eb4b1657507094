//! Destinations for uploaded bytes.
//!
//! Without an upload directory the server only counts incoming bytes. With a
//! directory configured, each upload is written to a file named after the
//! announced file name.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors raised while opening an upload destination.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The announced file name is not a single plain path component.
    #[error("invalid file name: {0}")]
    InvalidFileName(String),
    /// The destination file could not be created.
    #[error("failed to create '{}': {}", .path.display(), .source)]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where the bytes of one upload go.
#[derive(Debug)]
pub enum UploadSink {
    /// Bytes are counted and dropped.
    Discard,
    /// Bytes are written to a file.
    File {
        path: PathBuf,
        writer: BufWriter<File>,
    },
}

impl UploadSink {
    /// Open the sink for `file_name`, inside `dir` when one is configured.
    pub fn open(dir: Option<&Path>, file_name: &str) -> Result<Self, UploadError> {
        let Some(dir) = dir else {
            return Ok(UploadSink::Discard);
        };

        if !is_plain_file_name(file_name) {
            return Err(UploadError::InvalidFileName(file_name.to_string()));
        }

        let path = dir.join(file_name);
        let file = File::create(&path).map_err(|source| UploadError::Create {
            path: path.clone(),
            source,
        })?;

        Ok(UploadSink::File {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Append a chunk of upload data.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            UploadSink::Discard => Ok(()),
            UploadSink::File { writer, .. } => writer.write_all(chunk),
        }
    }

    /// Flush buffered data once the upload is complete.
    pub fn finish(&mut self) -> io::Result<()> {
        match self {
            UploadSink::Discard => Ok(()),
            UploadSink::File { writer, .. } => writer.flush(),
        }
    }

    /// Destination path, if the sink writes to disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            UploadSink::Discard => None,
            UploadSink::File { path, .. } => Some(path),
        }
    }
}

/// A file name is accepted only if it names a single normal path component.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}
