//! Loopback TCP peer for socket-level tests.
//!
//! [`MockTcpServer`] listens on a random localhost port. Once started it
//! accepts a single client, writes the scripted bytes to it, and records
//! everything the client sends until the client disconnects.
//!
//! # Example
//!
//! ```
//! use vrtlib_test_harness::MockTcpServer;
//!
//! # async fn example() -> vrtlib_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//! server.send_on_accept(&[0x56, 0x52, 0x4C, 0x50]);
//! server.start();
//!
//! // Point a TCP_CLIENT connection at server.port(), then:
//! let received = server.wait().await.expect("peer failed");
//! # let _ = received;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use vrtlib_core::error::{Error, Result};

/// A one-client TCP peer on 127.0.0.1.
pub struct MockTcpServer {
    addr: SocketAddr,
    listener: Option<TcpListener>,
    outbound: Vec<u8>,
    chunk_size: usize,
    chunk_delay: Duration,
    server_handle: Option<JoinHandle<std::result::Result<Vec<u8>, String>>>,
}

impl MockTcpServer {
    /// Bind a listener on a random port. Nothing is accepted until
    /// [`start`](MockTcpServer::start).
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::transport("bind mock TCP server", &e))?;
        let addr = listener.local_addr()?;
        Ok(Self {
            addr,
            listener: Some(listener),
            outbound: Vec::new(),
            chunk_size: usize::MAX,
            chunk_delay: Duration::ZERO,
            server_handle: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Bytes written to the client right after it connects.
    pub fn send_on_accept(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Write the outbound bytes in pieces of `n`, pausing `delay` between
    /// them, so the reader sees packets split across segments.
    pub fn chunked(&mut self, n: usize, delay: Duration) {
        self.chunk_size = n.max(1);
        self.chunk_delay = delay;
    }

    /// Accept one client in the background.
    ///
    /// Calling this twice does nothing the second time.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let outbound = std::mem::take(&mut self.outbound);
        let chunk_size = self.chunk_size;
        let chunk_delay = self.chunk_delay;

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {e}"))?;

            for chunk in outbound.chunks(chunk_size) {
                stream
                    .write_all(chunk)
                    .await
                    .map_err(|e| format!("write error: {e}"))?;
                stream.flush().await.map_err(|e| format!("flush error: {e}"))?;
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
            }

            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    // A reset after the client closes still ends the session.
                    Err(_) => break,
                }
            }
            Ok(received)
        });

        self.server_handle = Some(handle);
    }

    /// Wait for the client to disconnect and return what it sent.
    pub async fn wait(self) -> std::result::Result<Vec<u8>, String> {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {e}"))?,
            None => Err("server was never started".to_string()),
        }
    }
}
