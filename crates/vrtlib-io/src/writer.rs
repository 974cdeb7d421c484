//! VRT writer: send path from caller packets to the wire.
//!
//! The writer stamps each outgoing packet with the next packet count for
//! its stream code, optionally packs packets into VRL frames, and hands
//! the bytes to an output [`Connection`]. Counter state belongs to the
//! writer and is only touched under its own lock, which is held for the
//! whole send so that counts hit the wire in order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use vrtlib_core::error::Result;
use vrtlib_core::options::{ConnectionOptions, Direction};
use vrtlib_packet::vrl::FRAME_COUNT_MODULUS;
use vrtlib_packet::{Packet, PacketCounter, VrlFrame, plan_frames};
use vrtlib_transport::{Connector, NetConnector};

use crate::io::{Connection, ConnectionState, EngineSettings};
use crate::listener::VrtListener;

/// VRL framing applied to outgoing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub enabled: bool,
    pub crc: bool,
    /// Largest frame in octets, overhead included; `0` is one packet per frame.
    pub threshold: usize,
}

impl Framing {
    pub fn none() -> Self {
        Self {
            enabled: false,
            crc: false,
            threshold: 0,
        }
    }

    pub fn from_options(opts: &ConnectionOptions) -> Self {
        Self {
            enabled: opts.vrl_frame,
            crc: opts.vrl_crc,
            threshold: opts.vrl_break_octets(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    packets: PacketCounter,
    next_frame: u16,
}

pub struct VrtWriter {
    connection: Connection,
    framing: Framing,
    counters: Mutex<Counters>,
}

impl VrtWriter {
    /// A writer on real sockets described by `options`.
    pub fn new(options: ConnectionOptions, listener: Arc<dyn VrtListener>) -> Self {
        let settings = EngineSettings::from_options(&options, Direction::Output);
        let framing = Framing::from_options(&options);
        let connector = NetConnector::new(options, Direction::Output);
        Self::with_settings(Box::new(connector), settings, framing, listener)
    }

    /// A writer whose sockets come from `connector`.
    pub fn with_connector(
        connector: Box<dyn Connector>,
        options: &ConnectionOptions,
        listener: Arc<dyn VrtListener>,
    ) -> Self {
        let settings = EngineSettings::from_options(options, Direction::Output);
        Self::with_settings(connector, settings, Framing::from_options(options), listener)
    }

    pub fn with_settings(
        connector: Box<dyn Connector>,
        settings: EngineSettings,
        framing: Framing,
        listener: Arc<dyn VrtListener>,
    ) -> Self {
        let settings = EngineSettings {
            direction: Direction::Output,
            ..settings
        };
        Self {
            connection: Connection::new(connector, settings, listener),
            framing,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn start(&self) -> Result<()> {
        self.connection.start().await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connection.reconnect().await
    }

    pub async fn stop(&self, wait: bool) -> Result<()> {
        self.connection.stop(wait).await
    }

    /// Frame count the next VRL frame will carry.
    pub async fn next_frame_count(&self) -> u16 {
        self.counters.lock().await.next_frame
    }

    /// Send one packet.
    ///
    /// The packet is sent as a copy carrying the next packet count for its
    /// stream code; `packet` itself is left untouched. The copy is what
    /// the listener's `sent_packet` receives.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send_packets(std::slice::from_ref(packet)).await
    }

    /// Send several packets.
    ///
    /// Without framing this is the same as calling
    /// [`send_packet`](Self::send_packet) for each. With framing the
    /// packets are packed greedily into as few frames as the break
    /// threshold allows, and the frame count advances once per frame.
    pub async fn send_packets(&self, packets: &[Packet]) -> Result<()> {
        for packet in packets {
            packet.validate()?;
        }
        let mut counters = self.counters.lock().await;

        if !self.framing.enabled {
            for packet in packets {
                let count = counters.packets.next(packet.stream_code());
                let stamped = packet.with_packet_count(count);
                self.connection.send(stamped.as_bytes()).await?;
                trace!(stream = %stamped.stream_code(), count, "Sent packet");
                self.notify_sent(&stamped);
            }
            return Ok(());
        }

        // Stamp and encode against a copy of the counters so a batch that
        // cannot be framed leaves no hole in the packet counts.
        let mut next_counts = counters.packets.clone();
        let stamped: Vec<Packet> = packets
            .iter()
            .map(|p| p.with_packet_count(next_counts.next(p.stream_code())))
            .collect();
        let sizes: Vec<usize> = stamped.iter().map(Packet::len).collect();
        let mut frames = Vec::new();
        let mut frame_count = counters.next_frame;
        for range in plan_frames(&sizes, self.framing.threshold) {
            let bytes = VrlFrame::to_bytes(frame_count, &stamped[range.clone()], self.framing.crc)?;
            frames.push((range, bytes));
            frame_count = (frame_count + 1) % FRAME_COUNT_MODULUS;
        }
        counters.packets = next_counts;

        for (range, frame) in &frames {
            self.connection.send(frame).await?;
            trace!(frame_count = counters.next_frame, octets = frame.len(), "Sent frame");
            counters.next_frame = (counters.next_frame + 1) % FRAME_COUNT_MODULUS;
            for packet in &stamped[range.clone()] {
                self.notify_sent(packet);
            }
        }
        Ok(())
    }

    fn notify_sent(&self, packet: &Packet) {
        self.connection
            .listener()
            .sent_packet(self.connection.event(), packet);
    }
}

impl Drop for VrtWriter {
    fn drop(&mut self) {
        if self.connection.state() != ConnectionState::Closed {
            self.connection.abort();
        }
    }
}

impl std::fmt::Debug for VrtWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrtWriter")
            .field("connection", &self.connection)
            .field("framing", &self.framing)
            .finish()
    }
}
