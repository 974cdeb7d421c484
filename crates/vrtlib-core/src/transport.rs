//! Byte-level transport trait.
//!
//! The [`Transport`] trait abstracts over a single open socket: a UDP
//! socket (one datagram per read/write), a connected TCP stream, or a
//! mock stream in tests. The I/O engine in `vrtlib-io` only ever talks to
//! sockets through this trait, which keeps framing recovery and reconnect
//! logic testable without a network.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Outcome of a single bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were read into the buffer (always > 0).
    Data(usize),
    /// Nothing arrived before the read timeout.
    TimedOut,
    /// The peer closed the stream (or the socket was closed locally).
    Eof,
}

/// Asynchronous byte-level transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send all of `data`.
    ///
    /// For datagram transports this is exactly one datagram. For stream
    /// transports implementations loop until every byte is written or a
    /// hard error occurs.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read into `buf`, waiting at most `timeout`.
    ///
    /// Datagram transports return exactly one datagram per call.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus>;

    /// Stop further writes without closing, so buffered reads can drain.
    async fn shutdown(&mut self) -> Result<()>;

    /// Close the transport. Calling this more than once is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Whether the transport is still open.
    fn is_connected(&self) -> bool;

    /// Whether each read/write maps to exactly one datagram.
    fn is_datagram(&self) -> bool {
        false
    }

    /// Label used in log lines and listener events.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}
