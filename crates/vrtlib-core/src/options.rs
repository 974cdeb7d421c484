//! Connection configuration.
//!
//! Connections are configured from a flat map of string options, the same
//! shape embedding frameworks hand down from their own property systems.
//! [`ConnectionOptions::from_pairs`] parses that map into typed settings;
//! anything not supplied falls back to the defaults documented on each
//! field.
//!
//! ```
//! use vrtlib_core::options::{ConnectionOptions, TransportKind};
//!
//! let opts = ConnectionOptions::from_pairs([
//!     ("TRANSPORT", "TCP_CLIENT"),
//!     ("HOST", "127.0.0.1"),
//!     ("PORT", "5000"),
//!     ("VRL_FRAME", "true"),
//! ]).unwrap();
//! assert_eq!(opts.transport, TransportKind::TcpClient);
//! assert!(opts.vrl_frame);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default bound on a single socket read/accept.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default receive queue limit in packets.
pub const DEFAULT_QUEUE_LIMIT_PACKETS: usize = 1024;

/// Default receive queue limit in octets (8 MiB).
pub const DEFAULT_QUEUE_LIMIT_OCTETS: usize = 8 * 1024 * 1024;

/// Default initial-context timeout.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Break threshold used for `VRL_BREAK=-1`.
pub const DEFAULT_VRL_BREAK: usize = 61_440;

/// Default path MTU assumed for `VRL_BREAK=-2`.
pub const DEFAULT_MTU: usize = 1500;

/// Worst-case IPv4 header plus UDP header, subtracted from the MTU.
pub const MTU_HEADER_MARGIN: usize = 60 + 8;

/// Which kind of socket a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// UDP unicast or multicast.
    Udp,
    /// Listen for TCP clients; every accepted client is a peer.
    TcpServer,
    /// Connect out to a TCP server.
    TcpClient,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::TcpServer => write!(f, "tcp-server"),
            TransportKind::TcpClient => write!(f, "tcp-client"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "UDP" | "UDP_MULTICAST" => Ok(TransportKind::Udp),
            "TCP_SERVER" => Ok(TransportKind::TcpServer),
            "TCP_CLIENT" | "TCP" => Ok(TransportKind::TcpClient),
            other => Err(Error::InvalidParameter(format!(
                "unknown transport '{other}'"
            ))),
        }
    }
}

/// Direction of a connection. A connection never does both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Receive packets (reader side).
    Input,
    /// Send packets (writer side).
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// How long the reader waits for initial context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialTimeout {
    /// Give up waiting this long after the first packet arrives.
    After(Duration),
    /// Wait forever (`INITIAL_TIMEOUT=-1`).
    Unlimited,
    /// Skip context acquisition and deliver every packet raw
    /// (`INITIAL_TIMEOUT=-2`).
    Legacy,
}

impl InitialTimeout {
    /// Parse the seconds-based option value.
    pub fn from_seconds(secs: f64) -> Result<Self> {
        if secs == -1.0 {
            Ok(InitialTimeout::Unlimited)
        } else if secs == -2.0 {
            Ok(InitialTimeout::Legacy)
        } else if secs.is_finite() && secs >= 0.0 {
            Duration::try_from_secs_f64(secs)
                .map(InitialTimeout::After)
                .map_err(|e| {
                    Error::InvalidParameter(format!("INITIAL_TIMEOUT {secs} out of range: {e}"))
                })
        } else {
            Err(Error::InvalidParameter(format!(
                "INITIAL_TIMEOUT must be >= 0, -1 or -2, got {secs}"
            )))
        }
    }
}

impl Default for InitialTimeout {
    fn default() -> Self {
        InitialTimeout::After(DEFAULT_INITIAL_TIMEOUT)
    }
}

/// VRL frame break policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrlBreak {
    /// Every packet goes in its own frame (`VRL_BREAK=0`).
    OnePerFrame,
    /// Break at [`DEFAULT_VRL_BREAK`] octets (`VRL_BREAK=-1`).
    Default,
    /// Break at the MTU less [`MTU_HEADER_MARGIN`] (`VRL_BREAK=-2`).
    Mtu,
    /// Break when a frame would exceed this many octets.
    Octets(usize),
}

impl VrlBreak {
    /// Parse the integer option value.
    pub fn from_value(value: i64) -> Result<Self> {
        match value {
            0 => Ok(VrlBreak::OnePerFrame),
            -1 => Ok(VrlBreak::Default),
            -2 => Ok(VrlBreak::Mtu),
            n if n > 0 => Ok(VrlBreak::Octets(n as usize)),
            n => Err(Error::InvalidParameter(format!(
                "VRL_BREAK must be > 0, 0, -1 or -2, got {n}"
            ))),
        }
    }

    /// Frame size threshold in octets; `0` means one packet per frame.
    pub fn threshold(&self, mtu: usize) -> usize {
        match self {
            VrlBreak::OnePerFrame => 0,
            VrlBreak::Default => DEFAULT_VRL_BREAK,
            VrlBreak::Mtu => mtu.saturating_sub(MTU_HEADER_MARGIN),
            VrlBreak::Octets(n) => *n,
        }
    }
}

impl Default for VrlBreak {
    fn default() -> Self {
        VrlBreak::Default
    }
}

/// OS-level socket options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// `SO_RCVBUF`; `None` keeps the OS default.
    pub recv_buffer: Option<usize>,
    /// `SO_SNDBUF`; `None` keeps the OS default.
    pub send_buffer: Option<usize>,
    /// `SO_REUSEADDR`.
    pub reuse_address: bool,
    /// `TCP_NODELAY`.
    pub tcp_nodelay: bool,
    /// `SO_KEEPALIVE`.
    pub keepalive: bool,
    /// `IP_MULTICAST_TTL`.
    pub multicast_ttl: u32,
    /// `IP_MULTICAST_LOOP`.
    pub multicast_loop: bool,
    /// Bound on a single read/accept. Zero resolves to
    /// [`DEFAULT_READ_TIMEOUT`].
    pub read_timeout: Duration,
    /// Bound on a TCP connect.
    pub connect_timeout: Duration,
    /// Path MTU used by [`VrlBreak::Mtu`].
    pub mtu: usize,
}

impl SocketOptions {
    /// The read timeout, never zero.
    pub fn effective_read_timeout(&self) -> Duration {
        if self.read_timeout.is_zero() {
            DEFAULT_READ_TIMEOUT
        } else {
            self.read_timeout
        }
    }

    /// The connect timeout, never zero.
    pub fn effective_connect_timeout(&self) -> Duration {
        if self.connect_timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            self.connect_timeout
        }
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer: None,
            send_buffer: None,
            reuse_address: true,
            tcp_nodelay: true,
            keepalive: false,
            multicast_ttl: 1,
            multicast_loop: true,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Everything needed to open and run one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// `TRANSPORT`, default UDP.
    pub transport: TransportKind,
    /// `HOST`: remote host for outputs / TCP clients, bind or multicast
    /// group for inputs. Empty means "any".
    pub host: String,
    /// `PORT`.
    pub port: u16,
    /// `DEVICE`: local interface (name or IPv4 address) used for multicast.
    pub device: Option<String>,
    /// `INITIAL_TIMEOUT` in seconds.
    pub initial_timeout: InitialTimeout,
    /// `QUEUE_LIMIT_PACKETS`.
    pub queue_limit_packets: usize,
    /// `QUEUE_LIMIT_OCTETS`.
    pub queue_limit_octets: usize,
    /// `VRL_FRAME`: wrap outgoing packets in VRL frames.
    pub vrl_frame: bool,
    /// `VRL_CRC`: include a CRC in outgoing VRL frames.
    pub vrl_crc: bool,
    /// `VRL_BREAK`.
    pub vrl_break: VrlBreak,
    /// Socket-level options.
    pub socket: SocketOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::Udp,
            host: String::new(),
            port: 0,
            device: None,
            initial_timeout: InitialTimeout::default(),
            queue_limit_packets: DEFAULT_QUEUE_LIMIT_PACKETS,
            queue_limit_octets: DEFAULT_QUEUE_LIMIT_OCTETS,
            vrl_frame: false,
            vrl_crc: false,
            vrl_break: VrlBreak::default(),
            socket: SocketOptions::default(),
        }
    }
}

impl ConnectionOptions {
    /// Parse options from a string map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        Self::from_pairs(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Parse options from `(key, value)` pairs, applying them over the
    /// defaults. Keys are case-insensitive.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            opts.apply(key.as_ref(), value.as_ref())?;
        }
        Ok(opts)
    }

    /// Apply one option on top of the current settings.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "TRANSPORT" => self.transport = value.parse()?,
            "HOST" => self.host = value.to_string(),
            "PORT" => self.port = parse_num(key, value)?,
            "DEVICE" => {
                self.device = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "INITIAL_TIMEOUT" => {
                self.initial_timeout = InitialTimeout::from_seconds(parse_num(key, value)?)?
            }
            "QUEUE_LIMIT_PACKETS" => self.queue_limit_packets = parse_limit(key, value)?,
            "QUEUE_LIMIT_OCTETS" => self.queue_limit_octets = parse_limit(key, value)?,
            "VRL_FRAME" => self.vrl_frame = parse_bool(key, value)?,
            "VRL_CRC" => self.vrl_crc = parse_bool(key, value)?,
            "VRL_BREAK" => self.vrl_break = VrlBreak::from_value(parse_num(key, value)?)?,
            "MTU" => self.socket.mtu = parse_num(key, value)?,
            "RCVBUF" | "SO_RCVBUF" => self.socket.recv_buffer = Some(parse_num(key, value)?),
            "SNDBUF" | "SO_SNDBUF" => self.socket.send_buffer = Some(parse_num(key, value)?),
            "REUSEADDR" | "SO_REUSEADDR" => self.socket.reuse_address = parse_bool(key, value)?,
            "KEEPALIVE" | "SO_KEEPALIVE" => self.socket.keepalive = parse_bool(key, value)?,
            "TCP_NODELAY" => self.socket.tcp_nodelay = parse_bool(key, value)?,
            "MCAST_TTL" | "IP_MULTICAST_TTL" => self.socket.multicast_ttl = parse_num(key, value)?,
            "MCAST_LOOP" | "IP_MULTICAST_LOOP" => {
                self.socket.multicast_loop = parse_bool(key, value)?
            }
            "SO_TIMEOUT" => {
                self.socket.read_timeout = Duration::from_millis(parse_num(key, value)?)
            }
            "CONNECT_TIMEOUT" => {
                self.socket.connect_timeout = Duration::from_millis(parse_num(key, value)?)
            }
            other => {
                tracing::warn!(key = %other, value = %value, "Ignoring unknown connection option");
            }
        }
        Ok(())
    }

    /// Frame break threshold in octets (0 = one packet per frame).
    pub fn vrl_break_octets(&self) -> usize {
        self.vrl_break.threshold(self.socket.mtu)
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("{key}: '{value}' is not a valid number")))
}

fn parse_limit(key: &str, value: &str) -> Result<usize> {
    let n: usize = parse_num(key, value)?;
    if n == 0 {
        return Err(Error::InvalidParameter(format!("{key} must be at least 1")));
    }
    Ok(n)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidParameter(format!(
            "{key}: '{value}' is not a boolean"
        ))),
    }
}
