//! The callback contract between a connection and the application.
//!
//! Readers and writers call out through [`VrtListener`] for every
//! delivered packet, every sent packet, and every error or warning. The
//! calls are synchronous and come from the connection's own tasks, so a
//! slow listener stalls that connection's I/O.
//!
//! Packets are handed over by reference. A listener that wants to keep
//! one clones it; [`Packet`] clones share the underlying buffer.

use std::collections::HashMap;

use tokio::sync::mpsc;

use vrtlib_core::error::Error;
use vrtlib_packet::Packet;

/// Identifies the connection a callback came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrtEvent {
    /// Connection label, e.g. `"udp input 239.1.1.1:4991"`.
    pub source: String,
}

impl VrtEvent {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// The context gathered before steady-state delivery began.
#[derive(Debug, Clone, Default)]
pub struct InitialContext {
    /// Set when acquisition ended abnormally (timeout, missing streams,
    /// or association rules not being met).
    pub error_message: Option<String>,
    /// The first data packet seen.
    pub paired_data: Option<Packet>,
    /// The context packet whose stream ID matches the paired data.
    pub primary_context: Option<Packet>,
    /// Most recent context packet per stream ID.
    pub all_context: HashMap<u32, Packet>,
}

impl InitialContext {
    pub fn is_complete(&self) -> bool {
        self.error_message.is_none()
    }
}

/// Receives packets and diagnostics from a reader or writer.
///
/// Every method has an empty default, so implementors only override what
/// they care about.
#[allow(unused_variables)]
pub trait VrtListener: Send + Sync {
    /// A data packet arrived after initial context was delivered.
    fn received_data_packet(&self, event: &VrtEvent, packet: &Packet) {}

    /// A context packet arrived after initial context was delivered.
    fn received_context_packet(&self, event: &VrtEvent, packet: &Packet) {}

    /// Initial context acquisition finished. Called at most once per reader.
    fn received_initial_context(&self, event: &VrtEvent, context: &InitialContext) {}

    /// Raw delivery used when initial context acquisition is bypassed.
    fn received_packet(&self, event: &VrtEvent, packet: &Packet) {}

    /// A packet went out on the wire, with its assigned packet count.
    fn sent_packet(&self, event: &VrtEvent, packet: &Packet) {}

    fn error_occurred(&self, event: &VrtEvent, message: &str, cause: Option<&Error>) {}

    fn warning_occurred(&self, event: &VrtEvent, message: &str, cause: Option<&Error>) {}
}

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl VrtListener for NullListener {}

/// One listener callback, as an owned value.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    DataPacket(Packet),
    ContextPacket(Packet),
    InitialContext(InitialContext),
    Packet(Packet),
    SentPacket(Packet),
    Error {
        message: String,
        cause: Option<String>,
    },
    Warning {
        message: String,
        cause: Option<String>,
    },
}

/// Forwards every callback over an unbounded channel.
///
/// Useful when the application would rather `await` events than
/// implement a trait, and in tests.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ListenerEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl VrtListener for ChannelListener {
    fn received_data_packet(&self, _event: &VrtEvent, packet: &Packet) {
        self.forward(ListenerEvent::DataPacket(packet.clone()));
    }

    fn received_context_packet(&self, _event: &VrtEvent, packet: &Packet) {
        self.forward(ListenerEvent::ContextPacket(packet.clone()));
    }

    fn received_initial_context(&self, _event: &VrtEvent, context: &InitialContext) {
        self.forward(ListenerEvent::InitialContext(context.clone()));
    }

    fn received_packet(&self, _event: &VrtEvent, packet: &Packet) {
        self.forward(ListenerEvent::Packet(packet.clone()));
    }

    fn sent_packet(&self, _event: &VrtEvent, packet: &Packet) {
        self.forward(ListenerEvent::SentPacket(packet.clone()));
    }

    fn error_occurred(&self, _event: &VrtEvent, message: &str, cause: Option<&Error>) {
        self.forward(ListenerEvent::Error {
            message: message.to_string(),
            cause: cause.map(ToString::to_string),
        });
    }

    fn warning_occurred(&self, _event: &VrtEvent, message: &str, cause: Option<&Error>) {
        self.forward(ListenerEvent::Warning {
            message: message.to_string(),
            cause: cause.map(ToString::to_string),
        });
    }
}
