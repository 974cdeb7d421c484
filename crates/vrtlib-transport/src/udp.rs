//! UDP transport.
//!
//! [`UdpTransport`] carries one VRT packet or VRL frame per datagram. Input
//! sockets bind the configured port and join the multicast group when
//! `HOST` is a multicast address; output sockets bind an ephemeral port and
//! connect to the destination so [`Transport::send`] needs no address.
//!
//! # Example
//!
//! ```no_run
//! use vrtlib_transport::UdpTransport;
//! use std::time::Duration;
//!
//! # async fn example() -> vrtlib_core::Result<()> {
//! let transport = UdpTransport::bind("0.0.0.0:0").await?;
//! let dest = "127.0.0.1:4991".parse().unwrap();
//! transport.send_to(b"\x10\x00\x00\x01", dest).await?;
//!
//! let mut buf = [0u8; 65536];
//! let (n, src) = transport.recv_from(&mut buf, Duration::from_secs(5)).await?;
//! println!("Received {} bytes from {}", n, src);
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use vrtlib_core::error::{Error, Result};
use vrtlib_core::options::SocketOptions;
use vrtlib_core::transport::{ReadStatus, Transport};

use crate::resolve;

/// UDP datagram transport.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Destination for [`Transport::send`], set by [`connect`](Self::connect).
    peer: Option<SocketAddr>,
    /// Multicast group joined on open, left on close.
    group: Option<(Ipv4Addr, InterfaceIndexOrAddress)>,
    open: bool,
}

impl UdpTransport {
    /// Bind to a local address with default options.
    pub async fn bind(addr: &str) -> Result<Self> {
        tracing::debug!(addr = %addr, "Binding UDP socket");
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "Failed to bind UDP socket");
            Error::transport(format!("bind {addr}"), &e)
        })?;
        Self::from_tokio(socket)
    }

    /// Open a receiving socket on `port`.
    ///
    /// A multicast `host` is joined on the interface given by `device`, an
    /// interface name or IPv4 address (default any). Any other non-empty
    /// `host` is used as the bind address.
    pub async fn open_input(
        host: &str,
        port: u16,
        device: Option<&str>,
        opts: &SocketOptions,
    ) -> Result<Self> {
        let group = if host.is_empty() {
            None
        } else {
            Some(resolve(host, port).await?)
        };
        let multicast = group.filter(|a| a.ip().is_multicast());
        let bind_addr = match (group, multicast) {
            (_, Some(_)) | (None, _) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            (Some(addr), None) => addr,
        };

        let socket = new_socket(bind_addr, opts)?;
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(|e| Error::transport(format!("bind {bind_addr}"), &e))?;

        let mut joined = None;
        if let Some(SocketAddr::V4(g)) = multicast {
            let iface = Interface::resolve(device)?;
            let membership = iface.membership();
            socket
                .join_multicast_v4_n(g.ip(), &membership)
                .map_err(|e| Error::transport(format!("join multicast {}", g.ip()), &e))?;
            tracing::info!(group = %g.ip(), interface = ?iface, "Joined multicast group");
            joined = Some((*g.ip(), membership));
        } else if let Some(addr) = multicast {
            return Err(Error::Unsupported(format!(
                "IPv6 multicast group {}",
                addr.ip()
            )));
        }

        let mut transport = Self::from_socket2(socket)?;
        transport.group = joined;
        tracing::info!(local_addr = %transport.local_addr, "UDP input open");
        Ok(transport)
    }

    /// Open a sending socket connected to `host:port`.
    pub async fn open_output(
        host: &str,
        port: u16,
        device: Option<&str>,
        opts: &SocketOptions,
    ) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::InvalidParameter(
                "UDP output needs a destination HOST".into(),
            ));
        }
        let dest = resolve(host, port).await?;
        let iface = Interface::resolve(device)?;
        let local = match dest {
            SocketAddr::V4(_) => SocketAddr::from((iface.bind_ip(), 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };

        let socket = new_socket(local, opts)?;
        socket
            .bind(&SockAddr::from(local))
            .map_err(|e| Error::transport(format!("bind {local}"), &e))?;
        if dest.ip().is_multicast() && dest.is_ipv4() {
            socket
                .set_multicast_ttl_v4(opts.multicast_ttl)
                .map_err(|e| Error::transport("set IP_MULTICAST_TTL", &e))?;
            socket
                .set_multicast_loop_v4(opts.multicast_loop)
                .map_err(|e| Error::transport("set IP_MULTICAST_LOOP", &e))?;
            match &iface {
                Interface::Any => {}
                Interface::Address(addr) => socket
                    .set_multicast_if_v4(addr)
                    .map_err(|e| Error::transport("set IP_MULTICAST_IF", &e))?,
                Interface::Named { name, .. } => bind_to_device(&socket, name)?,
            }
        }

        let mut transport = Self::from_socket2(socket)?;
        transport.connect(dest).await?;
        transport.peer = Some(dest);
        tracing::info!(local_addr = %transport.local_addr, remote = %dest, "UDP output open");
        Ok(transport)
    }

    fn from_socket2(socket: Socket) -> Result<Self> {
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::transport("set non-blocking", &e))?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| Error::transport("register UDP socket", &e))?;
        Self::from_tokio(socket)
    }

    fn from_tokio(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr().map_err(|e| {
            tracing::error!(error = %e, "Failed to get local address");
            Error::transport("local address", &e)
        })?;
        tracing::debug!(local_addr = %local_addr, "UDP socket bound");
        Ok(Self {
            socket,
            local_addr,
            peer: None,
            group: None,
            open: true,
        })
    }

    /// The local address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The connected destination, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Send one datagram to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        tracing::trace!(
            local = %self.local_addr,
            remote = %addr,
            bytes = data.len(),
            "Sending datagram"
        );
        self.socket.send_to(data, addr).await.map_err(|e| {
            tracing::error!(local = %self.local_addr, remote = %addr, error = %e, "Failed to send datagram");
            Error::Io(e)
        })?;
        Ok(())
    }

    /// Receive one datagram, waiting at most `timeout`.
    ///
    /// Returns [`Error::Timeout`] if nothing arrives.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, SocketAddr)> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(Ok((n, src))) => {
                tracing::trace!(local = %self.local_addr, remote = %src, bytes = n, "Received datagram");
                Ok((n, src))
            }
            Ok(Err(e)) => {
                tracing::error!(local = %self.local_addr, error = %e, "Failed to receive datagram");
                Err(Error::Io(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Enable or disable sending to broadcast addresses.
    pub fn set_broadcast(&self, enable: bool) -> Result<()> {
        tracing::debug!(local = %self.local_addr, enable = enable, "Setting broadcast");
        self.socket
            .set_broadcast(enable)
            .map_err(|e| Error::transport("set SO_BROADCAST", &e))
    }

    /// Set the default destination and filter inbound datagrams to it.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        tracing::debug!(local = %self.local_addr, remote = %addr, "Connecting UDP socket");
        self.socket
            .connect(addr)
            .await
            .map_err(|e| Error::transport(format!("connect {addr}"), &e))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        let peer = self.peer.ok_or(Error::NotConnected)?;
        tracing::trace!(local = %self.local_addr, remote = %peer, bytes = data.len(), "Sending datagram");
        let n = self.socket.send(data).await.map_err(|e| {
            tracing::error!(local = %self.local_addr, remote = %peer, error = %e, "Failed to send datagram");
            Error::Io(e)
        })?;
        if n != data.len() {
            return Err(Error::Protocol(format!(
                "datagram truncated: sent {n} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        if !self.open {
            return Ok(ReadStatus::Eof);
        }
        match self.recv_from(buf, timeout).await {
            Ok((n, _)) => Ok(ReadStatus::Data(n)),
            Err(Error::Timeout) => Ok(ReadStatus::TimedOut),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        // Datagram sockets have nothing in flight to drain.
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Some((group, iface)) = self.group.take() {
            let sock = socket2::SockRef::from(&self.socket);
            if let Err(e) = sock.leave_multicast_v4_n(&group, &iface) {
                tracing::warn!(group = %group, error = %e, "Failed to leave multicast group");
            }
        }
        tracing::info!(local_addr = %self.local_addr, "UDP socket closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        match self.peer {
            Some(peer) => format!("udp {} -> {}", self.local_addr, peer),
            None => format!("udp {}", self.local_addr),
        }
    }
}

fn new_socket(addr: SocketAddr, opts: &SocketOptions) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::transport("create UDP socket", &e))?;
    socket
        .set_reuse_address(opts.reuse_address)
        .map_err(|e| Error::transport("set SO_REUSEADDR", &e))?;
    if let Some(size) = opts.recv_buffer {
        socket
            .set_recv_buffer_size(size)
            .map_err(|e| Error::transport("set SO_RCVBUF", &e))?;
    }
    if let Some(size) = opts.send_buffer {
        socket
            .set_send_buffer_size(size)
            .map_err(|e| Error::transport("set SO_SNDBUF", &e))?;
    }
    Ok(socket)
}

/// Local interface selected by `DEVICE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interface {
    Any,
    Address(Ipv4Addr),
    Named { name: String, index: u32 },
}

impl Interface {
    /// An IPv4 address is taken as is; anything else must name an
    /// interface known to the OS.
    pub fn resolve(device: Option<&str>) -> Result<Self> {
        let dev = match device.map(str::trim) {
            None | Some("") => return Ok(Interface::Any),
            Some(dev) => dev,
        };
        if let Ok(addr) = dev.parse::<Ipv4Addr>() {
            return Ok(Interface::Address(addr));
        }
        match interface_index(dev) {
            Some(index) => Ok(Interface::Named {
                name: dev.to_string(),
                index,
            }),
            None => Err(Error::InvalidParameter(format!(
                "DEVICE '{dev}' is neither an IPv4 address nor a known interface"
            ))),
        }
    }

    fn membership(&self) -> InterfaceIndexOrAddress {
        match self {
            Interface::Any => InterfaceIndexOrAddress::Address(Ipv4Addr::UNSPECIFIED),
            Interface::Address(addr) => InterfaceIndexOrAddress::Address(*addr),
            Interface::Named { index, .. } => InterfaceIndexOrAddress::Index(*index),
        }
    }

    fn bind_ip(&self) -> Ipv4Addr {
        match self {
            Interface::Address(addr) => *addr,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(name).ok().filter(|&i| i != 0)
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_device(socket: &Socket, name: &str) -> Result<()> {
    socket
        .bind_device(Some(name.as_bytes()))
        .map_err(|e| Error::transport(format!("bind to device {name}"), &e))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_device(_socket: &Socket, name: &str) -> Result<()> {
    Err(Error::Unsupported(format!(
        "sending on interface '{name}' by name; use its IPv4 address"
    )))
}
