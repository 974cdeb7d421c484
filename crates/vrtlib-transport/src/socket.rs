//! Socket abstraction over the three transport kinds.
//!
//! A [`Socket`] is what the I/O engine holds: a datagram socket, a TCP
//! stream, a listening TCP server, or any other [`Transport`] handed in by
//! embedding code. The operations mirror the classic socket contract:
//! bounded `read`, full `write`, `accept` for servers only, `shutdown` to
//! drain and an idempotent `close`.

use std::net::SocketAddr;
use std::time::Duration;

use vrtlib_core::error::{Error, Result};
use vrtlib_core::options::{ConnectionOptions, Direction, TransportKind};
use vrtlib_core::transport::{ReadStatus, Transport};

use crate::tcp::{TcpServer, TcpTransport};
use crate::udp::UdpTransport;

/// One open OS socket (or a stand-in for one).
pub enum Socket {
    Udp(UdpTransport),
    TcpClient(TcpTransport),
    TcpServer(TcpServer),
    /// Any other byte transport, e.g. a mock in tests.
    Stream(Box<dyn Transport>),
}

impl Socket {
    /// Open the socket described by `opts` for one direction.
    pub async fn open(opts: &ConnectionOptions, direction: Direction) -> Result<Self> {
        let device = opts.device.as_deref();
        tracing::debug!(
            transport = %opts.transport,
            direction = %direction,
            host = %opts.host,
            port = opts.port,
            "Opening socket"
        );
        match (opts.transport, direction) {
            (TransportKind::Udp, Direction::Input) => Ok(Socket::Udp(
                UdpTransport::open_input(&opts.host, opts.port, device, &opts.socket).await?,
            )),
            (TransportKind::Udp, Direction::Output) => Ok(Socket::Udp(
                UdpTransport::open_output(&opts.host, opts.port, device, &opts.socket).await?,
            )),
            (TransportKind::TcpClient, _) => {
                if opts.host.is_empty() {
                    return Err(Error::InvalidParameter(
                        "TCP client needs a HOST to connect to".into(),
                    ));
                }
                let addr = crate::join_host_port(&opts.host, opts.port);
                Ok(Socket::TcpClient(
                    TcpTransport::connect_with_options(&addr, &opts.socket).await?,
                ))
            }
            (TransportKind::TcpServer, _) => {
                let host = if opts.host.is_empty() {
                    "0.0.0.0"
                } else {
                    opts.host.as_str()
                };
                let addr = crate::join_host_port(host, opts.port);
                Ok(Socket::TcpServer(TcpServer::bind(&addr, &opts.socket).await?))
            }
        }
    }

    /// Read into `buf`, waiting at most `timeout`.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        match self {
            Socket::Udp(t) => t.receive(buf, timeout).await,
            Socket::TcpClient(t) => t.receive(buf, timeout).await,
            Socket::Stream(t) => t.receive(buf, timeout).await,
            Socket::TcpServer(_) => Err(Error::Unsupported(
                "read on a listening TCP server socket".into(),
            )),
        }
    }

    /// Write all of `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Socket::Udp(t) => t.send(data).await,
            Socket::TcpClient(t) => t.send(data).await,
            Socket::Stream(t) => t.send(data).await,
            Socket::TcpServer(_) => Err(Error::Unsupported(
                "write on a listening TCP server socket".into(),
            )),
        }
    }

    /// Accept one client, waiting at most `timeout`. Server sockets only.
    pub async fn accept(&mut self, timeout: Duration) -> Result<Option<Socket>> {
        match self {
            Socket::TcpServer(server) => Ok(server.accept(timeout).await?.map(Socket::TcpClient)),
            _ => Err(Error::Unsupported(
                "accept on a socket that is not a TCP server".into(),
            )),
        }
    }

    /// Stop further writes but leave buffered reads available.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Socket::Udp(t) => t.shutdown().await,
            Socket::TcpClient(t) => t.shutdown().await,
            Socket::Stream(t) => t.shutdown().await,
            Socket::TcpServer(_) => Ok(()),
        }
    }

    /// Close the socket. Repeated calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Socket::Udp(t) => t.close().await,
            Socket::TcpClient(t) => t.close().await,
            Socket::Stream(t) => t.close().await,
            Socket::TcpServer(s) => {
                s.close();
                Ok(())
            }
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Socket::Udp(t) => t.is_connected(),
            Socket::TcpClient(t) => t.is_connected(),
            Socket::Stream(t) => t.is_connected(),
            Socket::TcpServer(s) => s.is_open(),
        }
    }

    /// Whether reads return whole datagrams.
    pub fn is_datagram(&self) -> bool {
        match self {
            Socket::Udp(_) => true,
            Socket::Stream(t) => t.is_datagram(),
            Socket::TcpClient(_) | Socket::TcpServer(_) => false,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Socket::TcpServer(_))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::Udp(t) => Some(t.local_addr()),
            Socket::TcpClient(t) => t.local_addr(),
            Socket::TcpServer(s) => Some(s.local_addr()),
            Socket::Stream(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Socket::Udp(t) => t.describe(),
            Socket::TcpClient(t) => t.describe(),
            Socket::TcpServer(s) => format!("tcp-server {}", s.local_addr()),
            Socket::Stream(t) => t.describe(),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Socket").field(&self.describe()).finish()
    }
}
