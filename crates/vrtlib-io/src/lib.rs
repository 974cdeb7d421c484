//! vrtlib-io: VITA-49 readers and writers over UDP and TCP.
//!
//! - [`io`] -- the connection engine: sockets, reconnect, two-phase stop
//! - [`queue`] -- bounded receive queue with clear-on-overflow
//! - [`initial_context`] -- context acquisition before steady-state delivery
//! - [`reader`] / [`writer`] -- the receive and send paths
//! - [`listener`] -- the callback contract
//! - [`builder`] -- fluent construction of started readers and writers

pub mod builder;
pub mod initial_context;
pub mod io;
pub mod listener;
pub mod queue;
pub mod reader;
pub mod writer;

pub use builder::VrtBuilder;
pub use initial_context::{AcquireState, ContextAcquirer, Disposition};
pub use io::{Connection, ConnectionState, EngineSettings};
pub use listener::{ChannelListener, InitialContext, ListenerEvent, NullListener, VrtEvent, VrtListener};
pub use queue::{PacketQueue, PopResult, PushOutcome};
pub use reader::VrtReader;
pub use writer::{Framing, VrtWriter};
