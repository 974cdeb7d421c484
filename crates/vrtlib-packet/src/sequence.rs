//! Frame and packet count tracking.
//!
//! Loss is detected, never repaired: a [`Gap`] describes the counts that
//! were skipped and delivery carries on with the packet that revealed it.

use std::collections::HashMap;
use std::fmt;

use crate::vita49::{Packet, StreamCode};
use crate::vrl::FRAME_COUNT_MODULUS;

/// Packet counts wrap at this value.
pub const PACKET_COUNT_MODULUS: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapKind {
    Frames,
    Packets,
}

/// A run of missing counts, `expected` inclusive to `observed` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub kind: GapKind,
    pub expected: u16,
    pub observed: u16,
    /// Set for packet gaps.
    pub stream: Option<StreamCode>,
}

impl Gap {
    /// Number of units missed, accounting for wrap-around.
    pub fn missed(&self) -> u16 {
        let modulus = match self.kind {
            GapKind::Frames => FRAME_COUNT_MODULUS,
            GapKind::Packets => PACKET_COUNT_MODULUS,
        };
        (self.observed + modulus - self.expected) % modulus
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            GapKind::Frames => "frames",
            GapKind::Packets => "packets",
        };
        write!(
            f,
            "missed {what} {} (inclusive) to {} (exclusive)",
            self.expected, self.observed
        )
    }
}

/// Expected-next counters for one receive session.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next_frame: Option<u16>,
    next_packet: HashMap<StreamCode, u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received frame count.
    pub fn observe_frame(&mut self, count: u16) -> Option<Gap> {
        let count = count % FRAME_COUNT_MODULUS;
        let expected = self.next_frame.replace((count + 1) % FRAME_COUNT_MODULUS);
        match expected {
            Some(e) if e != count => Some(Gap {
                kind: GapKind::Frames,
                expected: e,
                observed: count,
                stream: None,
            }),
            _ => None,
        }
    }

    /// Record a received packet's count against its stream code.
    pub fn observe_packet(&mut self, packet: &Packet) -> Option<Gap> {
        self.observe_packet_count(packet.stream_code(), packet.packet_count())
    }

    pub fn observe_packet_count(&mut self, code: StreamCode, count: u8) -> Option<Gap> {
        let count = count as u16 % PACKET_COUNT_MODULUS;
        let expected = self
            .next_packet
            .insert(code, (count + 1) % PACKET_COUNT_MODULUS);
        match expected {
            Some(e) if e != count => Some(Gap {
                kind: GapKind::Packets,
                expected: e,
                observed: count,
                stream: Some(code),
            }),
            _ => None,
        }
    }

    /// Forget all counters, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.next_frame = None;
        self.next_packet.clear();
    }
}

/// Next-count assignment for outgoing packets, per stream code.
#[derive(Debug, Default, Clone)]
pub struct PacketCounter {
    next: HashMap<StreamCode, u8>,
}

impl PacketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The count for the next packet on `code`, starting at 0.
    pub fn next(&mut self, code: StreamCode) -> u8 {
        let slot = self.next.entry(code).or_insert(0);
        let count = *slot;
        *slot = (count + 1) % PACKET_COUNT_MODULUS as u8;
        count
    }
}
