//! Socket factories.
//!
//! The I/O engine never opens sockets itself; it asks a [`Connector`],
//! both at start and on every reconnect. [`NetConnector`] opens real
//! sockets from [`ConnectionOptions`]; tests substitute scripted ones.

use async_trait::async_trait;
use vrtlib_core::error::Result;
use vrtlib_core::options::{ConnectionOptions, Direction, TransportKind};

use crate::socket::Socket;

/// Opens the socket for one logical connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh socket. Called again after every disconnect.
    async fn open(&self) -> Result<Socket>;

    /// The transport kind the opened sockets belong to.
    fn kind(&self) -> TransportKind;

    /// Label used in log lines and listener events.
    fn describe(&self) -> String;
}

/// Opens real OS sockets.
#[derive(Debug, Clone)]
pub struct NetConnector {
    options: ConnectionOptions,
    direction: Direction,
}

impl NetConnector {
    pub fn new(options: ConnectionOptions, direction: Direction) -> Self {
        Self { options, direction }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

#[async_trait]
impl Connector for NetConnector {
    async fn open(&self) -> Result<Socket> {
        Socket::open(&self.options, self.direction).await
    }

    fn kind(&self) -> TransportKind {
        self.options.transport
    }

    fn describe(&self) -> String {
        format!(
            "{} {} {}",
            self.options.transport,
            self.direction,
            crate::join_host_port(&self.options.host, self.options.port)
        )
    }
}
