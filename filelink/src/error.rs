use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error")]
    Io(#[source] io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol version mismatch")]
    VersionMismatch,

    #[error("malformed filename on the wire")]
    InvalidFilename,

    #[error("filename too long for the wire encoding: {0} bytes")]
    FilenameTooLong(usize),

    #[error("invalid boolean byte on the wire: {0:#04x}")]
    InvalidFlag(u8),

    #[error("requested file is not available")]
    FileUnavailable,

    #[error("file size {size} exceeds the accepted maximum {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("path escapes the served root directory")]
    PathOutsideRoot,

    #[error("{0} clients exceed the readiness backend capacity")]
    CapacityTooLarge(usize),

    #[error("file descriptor {0} does not fit into an fd_set")]
    DescriptorOverflow(i32),

    #[error("timed out")]
    Timeout,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
