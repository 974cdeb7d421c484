//! Error types for vrtlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! caller-contract errors are all captured here.

use std::io;

/// The error type for all vrtlib operations.
///
/// The variants follow the taxonomy the I/O engine acts on: transport
/// failures may trigger a reconnect, protocol errors discard the offending
/// unit, and usage errors indicate a broken caller contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A socket open/read/write/accept failure.
    ///
    /// `os_code` carries the raw OS error number when one was available.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description, including the endpoint.
        message: String,
        /// Raw OS error code (`errno` / `WSAGetLastError`).
        os_code: Option<i32>,
    },

    /// A malformed packet or frame, a length mismatch, a bad CRC, or a
    /// stalled stream read.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a socket operation.
    #[error("timeout waiting for socket")]
    Timeout,

    /// An invalid option or argument was supplied.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested operation is not supported (e.g. an exotic payload
    /// format, or `accept` on a non-server socket).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No socket is currently open for the connection.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the connection or the link was reset.
    #[error("connection lost")]
    ConnectionLost,

    /// A reconnect was requested while another one was still running.
    #[error("already reconnecting")]
    AlreadyReconnecting,

    /// The connection has been stopped (or is stopping).
    #[error("connection stopped")]
    Stopped,

    /// A caller contract violation: double start, a task joining itself,
    /// or using a connection in the wrong direction.
    #[error("usage error: {0}")]
    Usage(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a [`Error::Transport`] from an I/O error, keeping its OS code.
    pub fn transport(context: impl AsRef<str>, err: &io::Error) -> Self {
        Error::Transport {
            message: format!("{}: {}", context.as_ref(), err),
            os_code: err.raw_os_error(),
        }
    }

    /// The raw OS error code behind this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Transport { os_code, .. } => *os_code,
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether the socket that produced this error is unusable.
    ///
    /// Fatal errors make the engine tear the socket down and reconnect;
    /// everything else is reported and processing continues.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Error::ConnectionLost | Error::NotConnected | Error::Transport { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
