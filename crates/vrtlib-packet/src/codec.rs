//! Frame/packet codec.
//!
//! Two decoding paths:
//!
//! - [`decode_datagram`]: one UDP datagram holds exactly one bare packet
//!   or one VRL frame.
//! - [`StreamDecoder`]: a byte stream (TCP) is reassembled into units by
//!   probing four bytes to tell a frame from a packet, then waiting for the
//!   declared length. Bytes are pushed in whatever chunk sizes the socket
//!   produced.
//!
//! On the encode side, [`plan_frames`] and [`encode_frames`] pack packets
//! into VRL frames under a break threshold.

use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};
use vrtlib_core::{Error, Result};

use crate::vita49::{Packet, PacketHeader, read_u32};
use crate::vrl::{
    FRAME_COUNT_MODULUS, MAX_FRAME_SIZE, VRL_FAW, VRL_FAW_BYTES, VRL_OVERHEAD, VrlFrame,
};

/// Consecutive empty reads tolerated while a partial unit is buffered.
pub const DEFAULT_STALL_LIMIT: u32 = 50;

/// Whether `bytes` starts with the VRL frame alignment word.
pub fn is_frame_start(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && read_u32(bytes, 0) == VRL_FAW
}

/// One decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Frame(VrlFrame),
    Packet(Packet),
}

impl Unit {
    pub fn packets(&self) -> &[Packet] {
        match self {
            Unit::Frame(f) => &f.packets,
            Unit::Packet(p) => std::slice::from_ref(p),
        }
    }

    pub fn into_packets(self) -> Vec<Packet> {
        match self {
            Unit::Frame(f) => f.packets,
            Unit::Packet(p) => vec![p],
        }
    }

    pub fn frame_count(&self) -> Option<u16> {
        match self {
            Unit::Frame(f) => Some(f.frame_count),
            Unit::Packet(_) => None,
        }
    }

    /// Octets occupied on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Unit::Frame(f) => VrlFrame::encoded_len(&f.packets),
            Unit::Packet(p) => p.len(),
        }
    }
}

/// Decode a single datagram without further I/O.
pub fn decode_datagram(bytes: Bytes) -> Result<Unit> {
    if is_frame_start(&bytes) {
        VrlFrame::parse(bytes).map(Unit::Frame)
    } else {
        Packet::parse(bytes).map(Unit::Packet)
    }
}

/// Incremental decoder for byte streams.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: BytesMut,
    idle_reads: u32,
    stall_limit: u32,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_stall_limit(DEFAULT_STALL_LIMIT)
    }

    pub fn with_stall_limit(stall_limit: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            idle_reads: 0,
            stall_limit: stall_limit.max(1),
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.idle_reads = 0;
            self.buf.extend_from_slice(data);
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.idle_reads = 0;
    }

    /// Record a read that produced no bytes.
    ///
    /// With nothing buffered this is simply an idle stream. With a partial
    /// unit buffered, too many in a row means the peer stalled mid-unit:
    /// the partial unit is dropped and a protocol error returned.
    pub fn note_idle(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.idle_reads += 1;
        if self.idle_reads >= self.stall_limit {
            let stranded = self.buf.len();
            self.clear();
            return Err(Error::Protocol(format!(
                "stream stalled with {stranded} bytes of a partial unit buffered"
            )));
        }
        Ok(())
    }

    /// Pop the next complete unit, if one is buffered.
    ///
    /// A malformed header makes the decoder skip ahead to the next frame
    /// alignment word and return a protocol error; call again to continue.
    /// A complete unit that fails validation is consumed and its error
    /// returned.
    pub fn next_unit(&mut self) -> Result<Option<Unit>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let needed = if is_frame_start(&self.buf) {
            if self.buf.len() < 8 {
                return Ok(None);
            }
            let (_, words) = VrlFrame::split_word1(read_u32(&self.buf, 4));
            if words * 4 < VRL_OVERHEAD {
                self.resync();
                return Err(Error::Protocol(format!(
                    "VRL frame declares impossible length of {words} words"
                )));
            }
            words * 4
        } else {
            let header = match PacketHeader::from_word(read_u32(&self.buf, 0)) {
                Ok(h) => h,
                Err(e) => {
                    self.resync();
                    return Err(e);
                }
            };
            if header.size_words == 0 {
                self.resync();
                return Err(Error::Protocol("VRT packet declares zero size".into()));
            }
            header.size_bytes()
        };

        if self.buf.len() < needed {
            return Ok(None);
        }
        let unit = self.buf.split_to(needed).freeze();
        decode_datagram(unit).map(Some)
    }

    /// Discard bytes up to the next frame alignment word after the current
    /// position, keeping a possible partial FAW at the tail.
    fn resync(&mut self) {
        let found = self.buf[1..]
            .windows(4)
            .position(|w| w == VRL_FAW_BYTES)
            .map(|i| i + 1);
        let skip = match found {
            Some(at) => at,
            None => self.buf.len().saturating_sub(3),
        };
        tracing::debug!(skipped = skip, "Resynchronising VRT stream");
        self.buf.advance(skip);
    }
}

/// Group consecutive packets into frames.
///
/// `threshold` is the largest frame in octets, overhead included; `0`
/// puts every packet in its own frame. A packet too large for any frame
/// travels alone in an oversized frame. Thresholds beyond the largest
/// encodable frame are clamped to it. Returns index ranges into `sizes`.
pub fn plan_frames(sizes: &[usize], threshold: usize) -> Vec<Range<usize>> {
    let threshold = threshold.min(MAX_FRAME_SIZE);
    let mut frames = Vec::new();
    let mut start = 0;
    let mut current = VRL_OVERHEAD;
    for (i, &size) in sizes.iter().enumerate() {
        let has_packets = i > start;
        if has_packets && (threshold == 0 || current + size > threshold) {
            frames.push(start..i);
            start = i;
            current = VRL_OVERHEAD;
        }
        current += size;
    }
    if start < sizes.len() {
        frames.push(start..sizes.len());
    }
    frames
}

/// Encode packets into frames per [`plan_frames`], numbering them from
/// `first_count` (mod 4096).
pub fn encode_frames(
    packets: &[Packet],
    threshold: usize,
    first_count: u16,
    with_crc: bool,
) -> Result<Vec<Bytes>> {
    let sizes: Vec<usize> = packets.iter().map(Packet::len).collect();
    let mut frames = Vec::new();
    let mut count = first_count % FRAME_COUNT_MODULUS;
    for range in plan_frames(&sizes, threshold) {
        frames.push(VrlFrame::to_bytes(count, &packets[range], with_crc)?);
        count = (count + 1) % FRAME_COUNT_MODULUS;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vita49::{MAX_PACKET_SIZE, PacketBuilder};

    fn pkt(id: u32, words: usize) -> Packet {
        PacketBuilder::data(id)
            .payload(&vec![0x5A; words * 4])
            .build()
            .unwrap()
    }

    fn drain(decoder: &mut StreamDecoder) -> Vec<Unit> {
        let mut out = Vec::new();
        while let Some(u) = decoder.next_unit().unwrap() {
            out.push(u);
        }
        out
    }

    /// One frame holding two packets, then one bare packet.
    fn frame_then_packet() -> (Vec<u8>, Vec<Unit>) {
        let framed = vec![pkt(1, 2), pkt(2, 5)];
        let bare = pkt(3, 1);
        let frame_bytes = VrlFrame::to_bytes(9, &framed, true).unwrap();
        let mut stream = frame_bytes.to_vec();
        stream.extend_from_slice(bare.as_bytes());
        let expected = vec![
            Unit::Frame(VrlFrame {
                frame_count: 9,
                has_crc: true,
                packets: framed,
            }),
            Unit::Packet(bare),
        ];
        (stream, expected)
    }

    #[test]
    fn frame_start_detection() {
        assert!(is_frame_start(b"VRLP\0\0\0\0"));
        assert!(!is_frame_start(b"VRL"));
        assert!(!is_frame_start(&[0x10, 0, 0, 1]));
    }

    #[test]
    fn datagram_bare_packet() {
        let p = pkt(7, 3);
        let unit = decode_datagram(p.to_bytes()).unwrap();
        assert_eq!(unit, Unit::Packet(p));
        assert_eq!(unit.frame_count(), None);
    }

    #[test]
    fn datagram_frame() {
        let packets = vec![pkt(1, 1), pkt(1, 1)];
        let bytes = VrlFrame::to_bytes(3, &packets, false).unwrap();
        let unit = decode_datagram(bytes.clone()).unwrap();
        assert_eq!(unit.frame_count(), Some(3));
        assert_eq!(unit.packets(), &packets[..]);
        assert_eq!(unit.wire_len(), bytes.len());
    }

    #[test]
    fn stream_whole_chunk() {
        let (stream, expected) = frame_then_packet();
        let mut dec = StreamDecoder::new();
        dec.push(&stream);
        assert_eq!(drain(&mut dec), expected);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn stream_one_byte_chunks() {
        let (stream, expected) = frame_then_packet();
        let mut dec = StreamDecoder::new();
        let mut units = Vec::new();
        for b in &stream {
            dec.push(std::slice::from_ref(b));
            units.extend(drain(&mut dec));
        }
        assert_eq!(units, expected);
    }

    #[test]
    fn stream_odd_chunks() {
        let (stream, expected) = frame_then_packet();
        let mut dec = StreamDecoder::new();
        let mut units = Vec::new();
        for chunk in stream.chunks(7) {
            dec.push(chunk);
            units.extend(drain(&mut dec));
        }
        assert_eq!(units, expected);
    }

    #[test]
    fn resync_after_garbage() {
        let good = VrlFrame::to_bytes(1, &[pkt(1, 1)], false).unwrap();
        let mut stream = vec![0x70, 0, 0, 4, 0xDE, 0xAD]; // reserved packet type
        stream.extend_from_slice(&good);

        let mut dec = StreamDecoder::new();
        dec.push(&stream);
        assert!(matches!(dec.next_unit(), Err(Error::Protocol(_))));
        let unit = dec.next_unit().unwrap().unwrap();
        assert_eq!(unit.frame_count(), Some(1));
    }

    #[test]
    fn resync_keeps_partial_faw() {
        let mut dec = StreamDecoder::new();
        dec.push(&[0xF0, 0, 0, 1, b'V', b'R', b'L']);
        assert!(dec.next_unit().is_err());
        assert_eq!(dec.pending(), 3);
    }

    #[test]
    fn invalid_crc_frame_consumed() {
        let frame = VrlFrame::to_bytes(1, &[pkt(1, 1)], true).unwrap();
        let mut bad = frame.to_vec();
        bad[12] ^= 0x01;
        let next = pkt(2, 1);
        bad.extend_from_slice(next.as_bytes());

        let mut dec = StreamDecoder::new();
        dec.push(&bad);
        assert!(dec.next_unit().is_err());
        assert_eq!(dec.next_unit().unwrap(), Some(Unit::Packet(next)));
    }

    #[test]
    fn stall_detection() {
        let mut dec = StreamDecoder::with_stall_limit(3);
        dec.note_idle().unwrap(); // nothing buffered: never stalls
        dec.note_idle().unwrap();
        dec.note_idle().unwrap();

        dec.push(&pkt(1, 4).as_bytes()[..6]);
        assert!(dec.next_unit().unwrap().is_none());
        dec.note_idle().unwrap();
        dec.note_idle().unwrap();
        let err = dec.note_idle().unwrap_err();
        assert!(err.to_string().contains("stalled"));
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn progress_resets_stall_counter() {
        let bytes = pkt(1, 4).to_bytes();
        let mut dec = StreamDecoder::with_stall_limit(2);
        dec.push(&bytes[..4]);
        dec.note_idle().unwrap();
        dec.push(&bytes[4..8]);
        dec.note_idle().unwrap();
        dec.push(&bytes[8..]);
        assert!(dec.next_unit().unwrap().is_some());
    }

    #[test]
    fn plan_one_per_frame() {
        assert_eq!(plan_frames(&[100, 200, 300], 0), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn plan_greedy_packing() {
        // 12 overhead + 100 + 100 = 212 fits in 220; the third does not.
        assert_eq!(plan_frames(&[100, 100, 100], 220), vec![0..2, 2..3]);
        // Exactly at the threshold still fits.
        assert_eq!(plan_frames(&[100, 100], 212), vec![0..2]);
    }

    #[test]
    fn plan_oversized_packet_goes_alone() {
        assert_eq!(
            plan_frames(&[40, 5000, 40, 40], 1000),
            vec![0..1, 1..2, 2..4]
        );
    }

    #[test]
    fn huge_threshold_is_clamped_to_frame_limit() {
        // Largest VRT packet: 8 octets of header plus stream ID, 65533 payload words.
        let packets: Vec<Packet> = (0..20).map(|i| pkt(i, 65_533)).collect();
        assert_eq!(packets[0].len(), MAX_PACKET_SIZE);

        let frames = encode_frames(&packets, 10_000_000, 0, false).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() <= MAX_FRAME_SIZE));
        assert_eq!(frames[0].len(), VRL_OVERHEAD + 16 * MAX_PACKET_SIZE);

        let mut dec = StreamDecoder::new();
        for f in &frames {
            dec.push(f);
        }
        let decoded: usize = drain(&mut dec).iter().map(|u| u.packets().len()).sum();
        assert_eq!(decoded, 20);
    }

    #[test]
    fn plan_empty() {
        assert!(plan_frames(&[], 1000).is_empty());
    }

    #[test]
    fn encode_frames_round_trip() {
        let packets: Vec<Packet> = (0..10).map(|i| pkt(i, i as usize)).collect();
        for threshold in [0, 64, 100, 61_440] {
            let frames = encode_frames(&packets, threshold, 4094, true).unwrap();
            let mut dec = StreamDecoder::new();
            for f in &frames {
                dec.push(f);
            }
            let units = drain(&mut dec);
            assert_eq!(units.len(), frames.len());
            for (i, unit) in units.iter().enumerate() {
                assert_eq!(unit.frame_count(), Some(((4094 + i) % 4096) as u16));
                assert_eq!(unit.wire_len(), frames[i].len());
            }
            let decoded: Vec<Packet> = units.into_iter().flat_map(Unit::into_packets).collect();
            assert_eq!(decoded, packets, "threshold {threshold}");
        }
    }
}
