//! VITA-49.0 packet model.
//!
//! A [`Packet`] is an immutable, validated view over the wire bytes of one
//! VRT packet. Parsing never copies the payload; accessors decode header
//! fields on demand from the underlying [`Bytes`]. Outgoing packets are
//! assembled with [`PacketBuilder`].
//!
//! Layout of a packet, in 32-bit big-endian words:
//!
//! ```text
//! word 0        header: type | C | T | TSI | TSF | count | size
//! [word]        stream identifier      (types 1, 3, 4, 5)
//! [2 words]     class identifier       (C bit)
//! [word]        integer timestamp      (TSI != 0)
//! [2 words]     fractional timestamp   (TSF != 0)
//! ...           payload
//! [word]        trailer                (T bit, data packets only)
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use vrtlib_core::{Error, Result};

/// Size of the mandatory header word in bytes.
pub const HEADER_WORD_SIZE: usize = 4;

/// Largest packet the 16-bit size field can describe, in bytes.
pub const MAX_PACKET_SIZE: usize = 0xFFFF * 4;

/// VRT packet type, bits 31-28 of the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// IF data packet without a stream identifier (0).
    Data,
    /// IF data packet with a stream identifier (1).
    DataWithStreamId,
    /// Extension data packet without a stream identifier (2).
    ExtData,
    /// Extension data packet with a stream identifier (3).
    ExtDataWithStreamId,
    /// IF context packet (4).
    Context,
    /// Extension context packet (5).
    ExtContext,
}

impl PacketType {
    /// Decode the 4-bit type code. Codes 6-15 are reserved.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::DataWithStreamId),
            2 => Ok(PacketType::ExtData),
            3 => Ok(PacketType::ExtDataWithStreamId),
            4 => Ok(PacketType::Context),
            5 => Ok(PacketType::ExtContext),
            other => Err(Error::Protocol(format!(
                "reserved VRT packet type {other}"
            ))),
        }
    }

    /// The 4-bit type code.
    pub fn code(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::DataWithStreamId => 1,
            PacketType::ExtData => 2,
            PacketType::ExtDataWithStreamId => 3,
            PacketType::Context => 4,
            PacketType::ExtContext => 5,
        }
    }

    pub fn is_data(self) -> bool {
        !self.is_context()
    }

    pub fn is_context(self) -> bool {
        matches!(self, PacketType::Context | PacketType::ExtContext)
    }

    /// Whether packets of this type carry a stream identifier word.
    pub fn has_stream_id(self) -> bool {
        !matches!(self, PacketType::Data | PacketType::ExtData)
    }
}

/// Integer timestamp mode (TSI), bits 23-22.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tsi {
    #[default]
    None,
    Utc,
    Gps,
    Other,
}

impl Tsi {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Tsi::None,
            1 => Tsi::Utc,
            2 => Tsi::Gps,
            _ => Tsi::Other,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Tsi::None => 0,
            Tsi::Utc => 1,
            Tsi::Gps => 2,
            Tsi::Other => 3,
        }
    }
}

/// Fractional timestamp mode (TSF), bits 21-20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tsf {
    #[default]
    None,
    /// Sample count since the integer-second boundary.
    SampleCount,
    /// Picoseconds since the integer-second boundary.
    RealTime,
    /// Free-running sample counter.
    FreeRunning,
}

impl Tsf {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Tsf::None,
            1 => Tsf::SampleCount,
            2 => Tsf::RealTime,
            _ => Tsf::FreeRunning,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Tsf::None => 0,
            Tsf::SampleCount => 1,
            Tsf::RealTime => 2,
            Tsf::FreeRunning => 3,
        }
    }
}

/// Class identifier: 24-bit OUI plus information and packet class codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClassId {
    pub oui: u32,
    pub information_class: u16,
    pub packet_class: u16,
}

impl ClassId {
    pub fn new(oui: u32, information_class: u16, packet_class: u16) -> Self {
        Self {
            oui: oui & 0x00FF_FFFF,
            information_class,
            packet_class,
        }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:06X}:{:04X}.{:04X}",
            self.oui, self.information_class, self.packet_class
        )
    }
}

/// Packet timestamp. Either half may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub tsi: Tsi,
    pub tsf: Tsf,
    /// Integer seconds (or other TSI-defined count).
    pub integer: Option<u32>,
    /// Picoseconds or sample count, per [`Tsf`].
    pub fractional: Option<u64>,
}

impl Timestamp {
    /// UTC seconds plus picoseconds.
    pub fn utc(seconds: u32, picoseconds: u64) -> Self {
        Self {
            tsi: Tsi::Utc,
            tsf: Tsf::RealTime,
            integer: Some(seconds),
            fractional: Some(picoseconds),
        }
    }
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub class_id_present: bool,
    /// Always false for context packets (bit 26 is reserved there).
    pub trailer_present: bool,
    pub tsi: Tsi,
    pub tsf: Tsf,
    /// 4-bit rolling packet count.
    pub packet_count: u8,
    /// Declared packet size in 32-bit words, including the header.
    pub size_words: u16,
}

impl PacketHeader {
    /// Decode a header word.
    pub fn from_word(word: u32) -> Result<Self> {
        let packet_type = PacketType::from_code(((word >> 28) & 0x0F) as u8)?;
        Ok(Self {
            packet_type,
            class_id_present: (word >> 27) & 1 == 1,
            trailer_present: packet_type.is_data() && (word >> 26) & 1 == 1,
            tsi: Tsi::from_bits(word >> 22),
            tsf: Tsf::from_bits(word >> 20),
            packet_count: ((word >> 16) & 0x0F) as u8,
            size_words: (word & 0xFFFF) as u16,
        })
    }

    /// Encode back into a header word.
    pub fn to_word(&self) -> u32 {
        let mut word = (self.packet_type.code() as u32) << 28;
        word |= (self.class_id_present as u32) << 27;
        if self.packet_type.is_data() {
            word |= (self.trailer_present as u32) << 26;
        }
        word |= self.tsi.bits() << 22;
        word |= self.tsf.bits() << 20;
        word |= (self.packet_count as u32 & 0x0F) << 16;
        word | self.size_words as u32
    }

    /// Declared packet size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_words as usize * 4
    }

    /// Bytes before the payload: header word, stream ID, class ID and
    /// timestamps.
    pub fn prefix_len(&self) -> usize {
        let mut len = HEADER_WORD_SIZE;
        if self.packet_type.has_stream_id() {
            len += 4;
        }
        if self.class_id_present {
            len += 8;
        }
        if self.tsi != Tsi::None {
            len += 4;
        }
        if self.tsf != Tsf::None {
            len += 8;
        }
        len
    }

    /// Bytes after the payload.
    pub fn trailer_len(&self) -> usize {
        if self.trailer_present { 4 } else { 0 }
    }
}

/// Key that scopes packet-count sequencing: packet kind, class OUI and
/// stream identifier.
///
/// Data and context packets with the same stream ID have independent
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamCode(pub u64);

impl StreamCode {
    const CONTEXT_BIT: u64 = 1 << 63;

    pub fn new(is_context: bool, oui: u32, stream_id: u32) -> Self {
        let mut code = ((oui as u64 & 0x00FF_FFFF) << 32) | stream_id as u64;
        if is_context {
            code |= Self::CONTEXT_BIT;
        }
        StreamCode(code)
    }

    pub fn is_context(&self) -> bool {
        self.0 & Self::CONTEXT_BIT != 0
    }

    pub fn stream_id(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for StreamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_context() { "ctx" } else { "data" };
        write!(
            f,
            "{kind}:{:06X}:{:08X}",
            (self.0 >> 32) & 0x00FF_FFFF,
            self.stream_id()
        )
    }
}

/// A validated VRT packet.
///
/// Cloning is cheap: the wire bytes are reference counted.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    bytes: Bytes,
}

impl Packet {
    /// Parse one packet. The declared size must equal `bytes.len()`.
    pub fn parse(bytes: Bytes) -> Result<Self> {
        if bytes.len() < HEADER_WORD_SIZE {
            return Err(Error::Protocol(format!(
                "VRT packet too short: {} bytes",
                bytes.len()
            )));
        }
        let header = PacketHeader::from_word(read_u32(&bytes, 0))?;
        if header.size_words == 0 {
            return Err(Error::Protocol("VRT packet declares zero size".into()));
        }
        if header.size_bytes() != bytes.len() {
            return Err(Error::Protocol(format!(
                "VRT packet size ({} words = {} bytes) does not match buffer length ({} bytes)",
                header.size_words,
                header.size_bytes(),
                bytes.len()
            )));
        }
        let overhead = header.prefix_len() + header.trailer_len();
        if overhead > bytes.len() {
            return Err(Error::Protocol(format!(
                "VRT packet of {} bytes cannot hold its {}-byte header and trailer",
                bytes.len(),
                overhead
            )));
        }
        Ok(Self { header, bytes })
    }

    /// Parse from a borrowed slice, copying it.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::parse(Bytes::copy_from_slice(data))
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn is_data(&self) -> bool {
        self.header.packet_type.is_data()
    }

    pub fn is_context(&self) -> bool {
        self.header.packet_type.is_context()
    }

    pub fn packet_count(&self) -> u8 {
        self.header.packet_count
    }

    /// Total length in bytes (always a multiple of 4).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.header
            .packet_type
            .has_stream_id()
            .then(|| read_u32(&self.bytes, 4))
    }

    pub fn class_id(&self) -> Option<ClassId> {
        if !self.header.class_id_present {
            return None;
        }
        let off = self.class_id_offset();
        let upper = read_u32(&self.bytes, off);
        let lower = read_u32(&self.bytes, off + 4);
        Some(ClassId {
            oui: upper & 0x00FF_FFFF,
            information_class: (lower >> 16) as u16,
            packet_class: lower as u16,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        let mut off = self.class_id_offset();
        if self.header.class_id_present {
            off += 8;
        }
        let integer = (self.header.tsi != Tsi::None).then(|| {
            let v = read_u32(&self.bytes, off);
            off += 4;
            v
        });
        let fractional =
            (self.header.tsf != Tsf::None).then(|| read_u64(&self.bytes, off));
        Timestamp {
            tsi: self.header.tsi,
            tsf: self.header.tsf,
            integer,
            fractional,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header.prefix_len()..self.bytes.len() - self.header.trailer_len()]
    }

    /// The payload as a zero-copy [`Bytes`] slice.
    pub fn payload_bytes(&self) -> Bytes {
        self.bytes
            .slice(self.header.prefix_len()..self.bytes.len() - self.header.trailer_len())
    }

    pub fn trailer(&self) -> Option<u32> {
        self.header
            .trailer_present
            .then(|| read_u32(&self.bytes, self.bytes.len() - 4))
    }

    /// Sequencing key for this packet.
    pub fn stream_code(&self) -> StreamCode {
        StreamCode::new(
            self.is_context(),
            self.class_id().map(|c| c.oui).unwrap_or(0),
            self.stream_id().unwrap_or(0),
        )
    }

    /// A copy of this packet with a different packet count. `self` is not
    /// modified.
    pub fn with_packet_count(&self, count: u8) -> Packet {
        let mut buf = BytesMut::from(&self.bytes[..]);
        let mut header = self.header;
        header.packet_count = count & 0x0F;
        buf[0..4].copy_from_slice(&header.to_word().to_be_bytes());
        Packet {
            header,
            bytes: buf.freeze(),
        }
    }

    /// Structural checks beyond what parsing guarantees. Context packets
    /// must carry a decodable context indicator field.
    pub fn validate(&self) -> Result<()> {
        if self.is_context() {
            crate::context::ContextFields::parse(self)?;
        }
        Ok(())
    }

    fn class_id_offset(&self) -> usize {
        if self.header.packet_type.has_stream_id() { 8 } else { 4 }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.header.packet_type)
            .field("stream_id", &self.stream_id())
            .field("count", &self.header.packet_count)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Builder for outgoing packets.
///
/// ```
/// use vrtlib_packet::vita49::{PacketBuilder, PacketType};
///
/// let pkt = PacketBuilder::new(PacketType::DataWithStreamId)
///     .stream_id(100)
///     .payload(&[0u8; 16])
///     .build()
///     .unwrap();
/// assert_eq!(pkt.stream_id(), Some(100));
/// assert_eq!(pkt.len(), 24);
/// ```
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    packet_type: PacketType,
    stream_id: u32,
    class_id: Option<ClassId>,
    timestamp: Timestamp,
    packet_count: u8,
    trailer: Option<u32>,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            stream_id: 0,
            class_id: None,
            timestamp: Timestamp::default(),
            packet_count: 0,
            trailer: None,
            payload: Vec::new(),
        }
    }

    /// Shorthand for a data packet with a stream identifier.
    pub fn data(stream_id: u32) -> Self {
        Self::new(PacketType::DataWithStreamId).stream_id(stream_id)
    }

    /// Shorthand for a context packet.
    pub fn context(stream_id: u32) -> Self {
        Self::new(PacketType::Context).stream_id(stream_id)
    }

    /// Ignored for types without a stream identifier.
    pub fn stream_id(mut self, id: u32) -> Self {
        self.stream_id = id;
        self
    }

    pub fn class_id(mut self, class_id: ClassId) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn packet_count(mut self, count: u8) -> Self {
        self.packet_count = count & 0x0F;
        self
    }

    /// Data packets only.
    pub fn trailer(mut self, trailer: u32) -> Self {
        self.trailer = Some(trailer);
        self
    }

    /// Payload bytes; the length must be a multiple of 4.
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Result<Packet> {
        if self.payload.len() % 4 != 0 {
            return Err(Error::InvalidParameter(format!(
                "payload length {} is not a multiple of 4",
                self.payload.len()
            )));
        }
        if self.trailer.is_some() && self.packet_type.is_context() {
            return Err(Error::InvalidParameter(
                "context packets cannot carry a trailer".into(),
            ));
        }
        let ts = self.timestamp;
        let tsi = if ts.integer.is_some() && ts.tsi == Tsi::None {
            Tsi::Other
        } else if ts.integer.is_none() {
            Tsi::None
        } else {
            ts.tsi
        };
        let tsf = if ts.fractional.is_some() && ts.tsf == Tsf::None {
            Tsf::FreeRunning
        } else if ts.fractional.is_none() {
            Tsf::None
        } else {
            ts.tsf
        };
        let mut header = PacketHeader {
            packet_type: self.packet_type,
            class_id_present: self.class_id.is_some(),
            trailer_present: self.trailer.is_some(),
            tsi,
            tsf,
            packet_count: self.packet_count,
            size_words: 0,
        };
        let total = header.prefix_len() + self.payload.len() + header.trailer_len();
        if total > MAX_PACKET_SIZE {
            return Err(Error::InvalidParameter(format!(
                "packet of {total} bytes exceeds the {MAX_PACKET_SIZE}-byte VRT limit"
            )));
        }
        header.size_words = (total / 4) as u16;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(header.to_word());
        if self.packet_type.has_stream_id() {
            buf.put_u32(self.stream_id);
        }
        if let Some(class) = self.class_id {
            buf.put_u32(class.oui & 0x00FF_FFFF);
            buf.put_u32(((class.information_class as u32) << 16) | class.packet_class as u32);
        }
        if let Some(i) = ts.integer {
            buf.put_u32(i);
        }
        if let Some(f) = ts.fractional {
            buf.put_u64(f);
        }
        buf.put_slice(&self.payload);
        if let Some(t) = self.trailer {
            buf.put_u32(t);
        }
        Packet::parse(buf.freeze())
    }
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> u64 {
    ((read_u32(data, offset) as u64) << 32) | read_u32(data, offset + 4) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assemble a data packet with stream ID, class ID and a UTC
    /// timestamp, independent of [`PacketBuilder`].
    fn raw_data_packet(stream_id: u32, count: u8, payload: &[u8]) -> Vec<u8> {
        let size_words = (4 + 4 + 8 + 4 + 8 + payload.len()) / 4;
        let mut hw: u32 = 0x1 << 28; // data with stream ID
        hw |= 1 << 27; // class ID present
        hw |= 0x1 << 22; // TSI = UTC
        hw |= 0x2 << 20; // TSF = real time
        hw |= (count as u32) << 16;
        hw |= size_words as u32;

        let mut buf = Vec::new();
        buf.extend_from_slice(&hw.to_be_bytes());
        buf.extend_from_slice(&stream_id.to_be_bytes());
        buf.extend_from_slice(&0x0012_A2B3u32.to_be_bytes());
        buf.extend_from_slice(&0x0001_0002u32.to_be_bytes());
        buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        buf.extend_from_slice(&500_000_000_000u64.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_hand_built_data_packet() {
        let raw = raw_data_packet(0xAABBCCDD, 7, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let pkt = Packet::from_slice(&raw).unwrap();

        assert_eq!(pkt.packet_type(), PacketType::DataWithStreamId);
        assert!(pkt.is_data());
        assert_eq!(pkt.packet_count(), 7);
        assert_eq!(pkt.stream_id(), Some(0xAABBCCDD));
        assert_eq!(pkt.class_id(), Some(ClassId::new(0x12A2B3, 1, 2)));
        let ts = pkt.timestamp();
        assert_eq!(ts.tsi, Tsi::Utc);
        assert_eq!(ts.tsf, Tsf::RealTime);
        assert_eq!(ts.integer, Some(1_700_000_000));
        assert_eq!(ts.fractional, Some(500_000_000_000));
        assert_eq!(pkt.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(pkt.trailer(), None);
    }

    #[test]
    fn builder_matches_hand_built_bytes() {
        let raw = raw_data_packet(42, 3, &[0xAA; 12]);
        let built = PacketBuilder::data(42)
            .class_id(ClassId::new(0x12A2B3, 1, 2))
            .timestamp(Timestamp::utc(1_700_000_000, 500_000_000_000))
            .packet_count(3)
            .payload(&[0xAA; 12])
            .build()
            .unwrap();
        assert_eq!(built.as_bytes(), &raw[..]);
    }

    #[test]
    fn minimal_packet_without_stream_id() {
        let pkt = PacketBuilder::new(PacketType::Data)
            .payload(&[9, 9, 9, 9])
            .build()
            .unwrap();
        assert_eq!(pkt.len(), 8);
        assert_eq!(pkt.stream_id(), None);
        assert_eq!(pkt.class_id(), None);
        assert_eq!(pkt.payload(), &[9, 9, 9, 9]);
    }

    #[test]
    fn trailer_round_trip() {
        let pkt = PacketBuilder::data(1)
            .payload(&[0; 8])
            .trailer(0xC000_0000)
            .build()
            .unwrap();
        assert!(pkt.header().trailer_present);
        assert_eq!(pkt.trailer(), Some(0xC000_0000));
        assert_eq!(pkt.payload().len(), 8);
    }

    #[test]
    fn context_packet_rejects_trailer() {
        let err = PacketBuilder::context(1).trailer(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn unaligned_payload_rejected() {
        let err = PacketBuilder::data(1).payload(&[0; 3]).build().unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn reject_size_mismatch() {
        let mut raw = raw_data_packet(1, 0, &[0; 4]);
        raw.extend_from_slice(&[0; 4]);
        let err = Packet::from_slice(&raw).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn reject_reserved_type() {
        let raw = (0x7u32 << 28 | 1).to_be_bytes();
        let err = Packet::from_slice(&raw).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn reject_zero_size() {
        let raw = (0x1u32 << 28).to_be_bytes();
        assert!(Packet::from_slice(&raw).is_err());
    }

    #[test]
    fn reject_header_longer_than_packet() {
        // Claims stream ID + class ID but is only two words long.
        let hw: u32 = (0x1 << 28) | (1 << 27) | 2;
        let mut raw = hw.to_be_bytes().to_vec();
        raw.extend_from_slice(&[0; 4]);
        let err = Packet::from_slice(&raw).unwrap_err();
        assert!(err.to_string().contains("cannot hold"));
    }

    #[test]
    fn reject_truncated() {
        assert!(Packet::from_slice(&[0x10, 0x00]).is_err());
        assert!(Packet::from_slice(&[]).is_err());
    }

    #[test]
    fn with_packet_count_leaves_original_untouched() {
        let original = PacketBuilder::data(5).payload(&[1; 4]).build().unwrap();
        let renumbered = original.with_packet_count(0x1B);
        assert_eq!(original.packet_count(), 0);
        assert_eq!(renumbered.packet_count(), 0xB);
        assert_eq!(renumbered.payload(), original.payload());
        assert_eq!(renumbered.stream_id(), Some(5));
    }

    #[test]
    fn stream_code_separates_kind_and_oui() {
        let data = PacketBuilder::data(100).build().unwrap();
        let ctx = PacketBuilder::context(100).payload(&[0; 4]).build().unwrap();
        let other_oui = PacketBuilder::data(100)
            .class_id(ClassId::new(0xFFFFFF, 0, 0))
            .build()
            .unwrap();

        assert_ne!(data.stream_code(), ctx.stream_code());
        assert_ne!(data.stream_code(), other_oui.stream_code());
        assert!(ctx.stream_code().is_context());
        assert_eq!(data.stream_code().stream_id(), 100);
    }

    #[test]
    fn header_word_round_trip() {
        let header = PacketHeader {
            packet_type: PacketType::ExtDataWithStreamId,
            class_id_present: true,
            trailer_present: true,
            tsi: Tsi::Gps,
            tsf: Tsf::SampleCount,
            packet_count: 9,
            size_words: 0x1234,
        };
        assert_eq!(PacketHeader::from_word(header.to_word()).unwrap(), header);
    }

    #[test]
    fn timestamp_fractional_only() {
        let pkt = PacketBuilder::data(1)
            .timestamp(Timestamp {
                tsf: Tsf::SampleCount,
                fractional: Some(123_456),
                ..Default::default()
            })
            .build()
            .unwrap();
        let ts = pkt.timestamp();
        assert_eq!(ts.integer, None);
        assert_eq!(ts.fractional, Some(123_456));
        assert_eq!(pkt.len(), 16);
    }
}
