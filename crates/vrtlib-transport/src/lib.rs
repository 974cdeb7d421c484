//! Transport implementations for vrtlib.
//!
//! This crate provides the socket layer under the I/O engine:
//!
//! - [`UdpTransport`]: UDP unicast and multicast datagrams
//! - [`TcpTransport`]: one TCP byte stream (dialled or accepted)
//! - [`TcpServer`]: a listening socket that accepts TCP clients
//! - [`Socket`]: the enum the engine holds, over all of the above
//! - [`Connector`] / [`NetConnector`]: how the engine (re)opens sockets

pub mod connector;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use connector::{Connector, NetConnector};
pub use socket::Socket;
pub use tcp::{TcpServer, TcpTransport};
pub use udp::UdpTransport;

use std::net::SocketAddr;

use vrtlib_core::error::{Error, Result};

/// `host:port`, bracketing bare IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Resolve `host` and `port`, preferring IPv4 results.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    resolve_str(&join_host_port(host, port)).await
}

pub(crate) async fn resolve_str(addr: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::transport(format!("resolve {addr}"), &e))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::InvalidParameter(format!("'{addr}' resolved to no addresses")))
}
