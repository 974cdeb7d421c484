//! Mock byte stream and connector for deterministic engine tests.
//!
//! [`MockStream`] implements [`Transport`] over an in-memory inbound buffer
//! and records everything written to it. [`MockConnector`] hands out
//! prepared streams in order, one per `open()`, so reconnect behaviour can
//! be scripted.
//!
//! # Example
//!
//! ```
//! use vrtlib_test_harness::{MockConnector, MockStream};
//!
//! let stream = MockStream::new().with_inbound(&[0x18, 0x00, 0x00, 0x02]).with_chunk_size(1);
//! let written = stream.written();
//! let connector = MockConnector::single(stream);
//! # let _ = (connector, written);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use vrtlib_core::error::{Error, Result};
use vrtlib_core::options::TransportKind;
use vrtlib_core::transport::{ReadStatus, Transport};
use vrtlib_transport::{Connector, Socket};

/// Shared log of every `send()` made through a [`MockStream`].
pub type Written = Arc<Mutex<Vec<Vec<u8>>>>;

/// How often a read waiting on an empty buffer looks for fed bytes.
const FEED_POLL: Duration = Duration::from_millis(2);

type Inbound = VecDeque<u8>;

/// A scripted in-memory byte stream.
///
/// Reads return at most `chunk_size` bytes at a time. When the inbound
/// buffer is empty a read waits up to its timeout for more bytes from a
/// [`MockFeeder`], then reports [`ReadStatus::TimedOut`], or
/// [`ReadStatus::Eof`] if the stream was built with
/// [`eof_after_inbound`](MockStream::eof_after_inbound).
#[derive(Debug)]
pub struct MockStream {
    inbound: Arc<Mutex<Inbound>>,
    written: Written,
    chunk_size: usize,
    eof_when_drained: bool,
    /// Writes accepted before every further write fails.
    write_budget: Option<usize>,
    connected: bool,
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            inbound: Arc::new(Mutex::new(Inbound::new())),
            written: Arc::new(Mutex::new(Vec::new())),
            chunk_size: usize::MAX,
            eof_when_drained: false,
            write_budget: None,
            connected: true,
        }
    }

    /// Queue bytes for the engine to read.
    pub fn with_inbound(self, bytes: &[u8]) -> Self {
        lock(&self.inbound).extend(bytes.iter().copied());
        self
    }

    /// Split every read into pieces of at most `n` bytes.
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Report end-of-stream once the inbound bytes are consumed.
    pub fn eof_after_inbound(mut self) -> Self {
        self.eof_when_drained = true;
        self
    }

    /// Accept `n` writes, then fail every later one with
    /// [`Error::ConnectionLost`].
    pub fn fail_writes_after(mut self, n: usize) -> Self {
        self.write_budget = Some(n);
        self
    }

    /// Handle to the log of written buffers. Survives the stream being
    /// moved into a connector.
    pub fn written(&self) -> Written {
        Arc::clone(&self.written)
    }

    /// Handle for pushing more inbound bytes after the stream is in use.
    pub fn feeder(&self) -> MockFeeder {
        MockFeeder {
            inbound: Arc::clone(&self.inbound),
        }
    }

    fn take(&self, buf: &mut [u8]) -> usize {
        let mut inbound = lock(&self.inbound);
        let n = inbound.len().min(buf.len()).min(self.chunk_size);
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes bytes into a live [`MockStream`].
#[derive(Debug, Clone)]
pub struct MockFeeder {
    inbound: Arc<Mutex<Inbound>>,
}

impl MockFeeder {
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.inbound).extend(bytes.iter().copied());
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockStream {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        match self.write_budget.as_mut() {
            Some(0) => return Err(Error::ConnectionLost),
            Some(left) => *left -= 1,
            None => {}
        }
        lock(&self.written).push(data.to_vec());
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        if !self.connected {
            return Ok(ReadStatus::Eof);
        }
        let n = self.take(buf);
        if n > 0 {
            return Ok(ReadStatus::Data(n));
        }
        if self.eof_when_drained {
            return Ok(ReadStatus::Eof);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(FEED_POLL).await;
            let n = self.take(buf);
            if n > 0 {
                return Ok(ReadStatus::Data(n));
            }
        }
        Ok(ReadStatus::TimedOut)
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        "mock stream".to_string()
    }
}

/// Hands out prepared [`MockStream`]s, one per `open()`.
///
/// Once the streams run out, `open()` fails with
/// [`Error::NotConnected`], which the engine treats like a refused
/// connection. A gated connector additionally waits for one
/// [`Notify`] permit before every open.
pub struct MockConnector {
    streams: Mutex<VecDeque<MockStream>>,
    gate: Option<Arc<Notify>>,
}

impl MockConnector {
    /// No streams yet; add them with [`push`](MockConnector::push).
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            gate: None,
        }
    }

    /// Exactly one stream.
    pub fn single(stream: MockStream) -> Self {
        let connector = Self::new();
        connector.push(stream);
        connector
    }

    /// Every `open()` blocks until [`gate`](MockConnector::gate) is notified.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::new()
        }
    }

    /// Queue a stream for a later `open()`.
    pub fn push(&self, stream: MockStream) {
        lock(&self.streams).push_back(stream);
    }

    /// The gate released by `notify_one()`. Ungated connectors get a
    /// fresh, unconnected `Notify`.
    pub fn gate(&self) -> Arc<Notify> {
        self.gate.clone().unwrap_or_default()
    }

    /// Streams not yet handed out.
    pub fn remaining(&self) -> usize {
        lock(&self.streams).len()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Socket> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let stream = lock(&self.streams).pop_front().ok_or(Error::NotConnected)?;
        Ok(Socket::Stream(Box::new(stream)))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::TcpClient
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
