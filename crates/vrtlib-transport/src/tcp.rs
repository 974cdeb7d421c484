//! TCP transports.
//!
//! [`TcpTransport`] is one connected byte stream, either dialled out by a
//! TCP-client connection or accepted by a [`TcpServer`]. TCP has no message
//! boundaries, so readers feed what they receive into a stream decoder.
//!
//! # Example
//!
//! ```no_run
//! use vrtlib_transport::TcpTransport;
//! use vrtlib_core::transport::{ReadStatus, Transport};
//! use std::time::Duration;
//!
//! # async fn example() -> vrtlib_core::Result<()> {
//! let mut transport = TcpTransport::connect("192.168.1.100:5000").await?;
//! let mut buf = [0u8; 4096];
//! if let ReadStatus::Data(n) = transport.receive(&mut buf, Duration::from_secs(2)).await? {
//!     println!("{} bytes", n);
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use vrtlib_core::error::{Error, Result};
use vrtlib_core::options::SocketOptions;
use vrtlib_core::transport::{ReadStatus, Transport};

/// Listen backlog for server sockets.
const LISTEN_BACKLOG: u32 = 128;

/// One TCP byte stream.
#[derive(Debug)]
pub struct TcpTransport {
    /// `None` after `close()`.
    stream: Option<TcpStream>,
    /// Peer address string for logging.
    addr: String,
}

impl TcpTransport {
    /// Connect with default socket options.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_options(addr, &SocketOptions::default()).await
    }

    /// Connect, applying buffer, reuse, no-delay and keepalive options.
    pub async fn connect_with_options(addr: &str, opts: &SocketOptions) -> Result<Self> {
        let timeout = opts.effective_connect_timeout();
        tracing::debug!(addr = %addr, timeout_ms = timeout.as_millis(), "Connecting to TCP endpoint");
        let target = crate::resolve_str(addr).await?;
        let socket = new_socket(target, opts)?;

        let stream = tokio::time::timeout(timeout, socket.connect(target))
            .await
            .map_err(|_| {
                tracing::error!(addr = %addr, "TCP connection timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                tracing::error!(addr = %addr, error = %e, "TCP connection failed");
                Error::transport(format!("connect {addr}"), &e)
            })?;

        apply_stream_options(&stream, opts, addr);
        tracing::info!(addr = %addr, "TCP connection established");
        Ok(Self {
            stream: Some(stream),
            addr: addr.to_string(),
        })
    }

    /// Wrap an already-connected stream (e.g. one accepted by a listener).
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        tracing::debug!(addr = %addr, "Wrapping existing TCP stream");
        Self {
            stream: Some(stream),
            addr,
        }
    }

    /// The address string this transport was connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(addr = %self.addr, bytes = data.len(), "Sending data");
        // write_all loops over partial writes.
        stream.write_all(data).await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send data");
            map_io_error(e)
        })?;
        stream.flush().await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to flush TCP stream");
            map_io_error(e)
        })?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => {
                tracing::debug!(addr = %self.addr, "Peer closed connection (0 bytes read)");
                Ok(ReadStatus::Eof)
            }
            Ok(Ok(n)) => {
                tracing::trace!(addr = %self.addr, bytes = n, "Received data");
                Ok(ReadStatus::Data(n))
            }
            Ok(Err(e)) => {
                tracing::error!(addr = %self.addr, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Ok(ReadStatus::TimedOut),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            tracing::debug!(addr = %self.addr, "Shutting down TCP write half");
            if let Err(e) = stream.shutdown().await {
                tracing::warn!(addr = %self.addr, error = %e, "Failed to shutdown TCP stream (continuing anyway)");
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing TCP connection");
            if let Err(e) = stream.flush().await {
                tracing::warn!(addr = %self.addr, error = %e, "Failed to flush before closing (continuing anyway)");
            }
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(addr = %self.addr, error = %e, "TCP shutdown on close failed");
            }
            tracing::info!(addr = %self.addr, "TCP connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.addr)
    }
}

/// Listening socket for TCP-server connections.
#[derive(Debug)]
pub struct TcpServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    opts: SocketOptions,
}

impl TcpServer {
    /// Bind and listen on `addr`.
    pub async fn bind(addr: &str, opts: &SocketOptions) -> Result<Self> {
        let target = crate::resolve_str(addr).await?;
        let socket = new_socket(target, opts)?;
        socket
            .bind(target)
            .map_err(|e| Error::transport(format!("bind {target}"), &e))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| Error::transport(format!("listen {target}"), &e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::transport("local address", &e))?;
        tracing::info!(local_addr = %local_addr, "TCP server listening");
        Ok(Self {
            listener: Some(listener),
            local_addr,
            opts: opts.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait at most `timeout` for a client. `Ok(None)` on timeout.
    pub async fn accept(&self, timeout: Duration) -> Result<Option<TcpTransport>> {
        let listener = self.listener.as_ref().ok_or(Error::NotConnected)?;
        match tokio::time::timeout(timeout, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let label = peer.to_string();
                apply_stream_options(&stream, &self.opts, &label);
                tracing::info!(local_addr = %self.local_addr, peer = %peer, "Accepted TCP client");
                Ok(Some(TcpTransport::from_stream(stream, label)))
            }
            Ok(Err(e)) => {
                tracing::error!(local_addr = %self.local_addr, error = %e, "Accept failed");
                Err(Error::transport(format!("accept on {}", self.local_addr), &e))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn close(&mut self) {
        if self.listener.take().is_some() {
            tracing::info!(local_addr = %self.local_addr, "TCP server closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }
}

fn new_socket(target: SocketAddr, opts: &SocketOptions) -> Result<TcpSocket> {
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::transport("create TCP socket", &e))?;
    socket
        .set_reuseaddr(opts.reuse_address)
        .map_err(|e| Error::transport("set SO_REUSEADDR", &e))?;
    if let Some(size) = opts.recv_buffer {
        socket
            .set_recv_buffer_size(size.min(u32::MAX as usize) as u32)
            .map_err(|e| Error::transport("set SO_RCVBUF", &e))?;
    }
    if let Some(size) = opts.send_buffer {
        socket
            .set_send_buffer_size(size.min(u32::MAX as usize) as u32)
            .map_err(|e| Error::transport("set SO_SNDBUF", &e))?;
    }
    Ok(socket)
}

/// Per-stream options. Failures are logged, not fatal.
fn apply_stream_options(stream: &TcpStream, opts: &SocketOptions, addr: &str) {
    if let Err(e) = stream.set_nodelay(opts.tcp_nodelay) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY (continuing anyway)");
    }
    if let Err(e) = socket2::SockRef::from(stream).set_keepalive(opts.keepalive) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set SO_KEEPALIVE (continuing anyway)");
    }
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
///
/// A dead link becomes a connection-fatal [`Error::Transport`] that keeps
/// the OS error code.
fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::transport("connection lost", &e),
        _ => Error::Io(e),
    }
}
