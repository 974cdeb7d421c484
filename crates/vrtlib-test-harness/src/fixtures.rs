//! Packet fixtures shared by the vrtlib test suites.

use bytes::{Bytes, BytesMut};

use vrtlib_packet::{ContextBuilder, Packet, PacketBuilder, VrlFrame};

/// A data packet with a `len`-octet payload filled with `id as u8`.
pub fn data_packet(id: u32, count: u8, len: usize) -> Packet {
    PacketBuilder::data(id)
        .packet_count(count)
        .payload(&vec![id as u8; len])
        .build()
        .expect("fixture data packet")
}

/// A context packet carrying a sample rate.
pub fn context_packet(id: u32, sample_rate: f64) -> Packet {
    ContextBuilder::new(id)
        .sample_rate(sample_rate)
        .build()
        .expect("fixture context packet")
}

/// A context packet whose association lists name `sources`.
pub fn context_with_sources(id: u32, sources: &[u32]) -> Packet {
    ContextBuilder::new(id)
        .sources(sources)
        .build()
        .expect("fixture context packet")
}

/// Packets laid end to end, as they appear on a raw byte stream.
pub fn concat(packets: &[Packet]) -> Bytes {
    let mut buf = BytesMut::new();
    for p in packets {
        buf.extend_from_slice(p.as_bytes());
    }
    buf.freeze()
}

/// One VRL frame holding `packets`.
pub fn frame(count: u16, packets: &[Packet], crc: bool) -> Bytes {
    VrlFrame::to_bytes(count, packets, crc).expect("fixture frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_are_valid_packets() {
        let d = data_packet(7, 3, 12);
        assert_eq!(d.stream_id(), Some(7));
        assert_eq!(d.packet_count(), 3);
        assert_eq!(d.payload().len(), 12);
        assert!(context_packet(7, 1e6).is_context());

        let wire = concat(&[d.clone(), d]);
        assert_eq!(wire.len(), 2 * data_packet(7, 3, 12).len());
    }
}
