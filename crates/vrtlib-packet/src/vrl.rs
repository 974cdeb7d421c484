//! VRL frames.
//!
//! A VRL frame wraps one or more VRT packets so stream transports can find
//! packet boundaries and detect lost frames:
//!
//! ```text
//! word 0   frame alignment word 0x56524C50 ("VRLP")
//! word 1   frame count (12 bits, 31..20) | frame length in words (20 bits)
//! ...      packets
//! last     CRC-32, or 0x56454E44 ("VEND") when no CRC is sent
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use vrtlib_core::{Error, Result};

use crate::vita49::{Packet, PacketHeader, read_u32};

/// Frame alignment word.
pub const VRL_FAW: u32 = 0x5652_4C50;

/// The FAW as bytes, for scanning.
pub const VRL_FAW_BYTES: [u8; 4] = VRL_FAW.to_be_bytes();

/// Trailer value meaning "no CRC".
pub const VRL_NO_CRC: u32 = 0x5645_4E44;

/// Frame header length in bytes.
pub const VRL_HEADER_SIZE: usize = 8;

/// Frame trailer length in bytes.
pub const VRL_TRAILER_SIZE: usize = 4;

/// Header plus trailer.
pub const VRL_OVERHEAD: usize = VRL_HEADER_SIZE + VRL_TRAILER_SIZE;

/// Frame counts wrap at this value.
pub const FRAME_COUNT_MODULUS: u16 = 4096;

/// Largest frame the 20-bit length field can describe, in bytes.
pub const MAX_FRAME_SIZE: usize = 0x000F_FFFF * 4;

/// A decoded VRL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrlFrame {
    pub frame_count: u16,
    /// Whether the trailer carried a (valid) CRC rather than the marker.
    pub has_crc: bool,
    pub packets: Vec<Packet>,
}

impl VrlFrame {
    /// Decode the frame count and length fields of header word 1.
    pub fn split_word1(word: u32) -> (u16, usize) {
        (((word >> 20) & 0x0FFF) as u16, (word & 0x000F_FFFF) as usize)
    }

    /// Parse one complete frame.
    ///
    /// Checks the FAW, that the declared length equals the buffer, the CRC
    /// when one is present, and that the embedded packets exactly fill the
    /// frame body.
    pub fn parse(bytes: Bytes) -> Result<Self> {
        if bytes.len() < VRL_OVERHEAD {
            return Err(Error::Protocol(format!(
                "VRL frame too short: {} bytes",
                bytes.len()
            )));
        }
        if read_u32(&bytes, 0) != VRL_FAW {
            return Err(Error::Protocol("bad VRL frame alignment word".into()));
        }
        let (frame_count, words) = Self::split_word1(read_u32(&bytes, 4));
        if words * 4 != bytes.len() {
            return Err(Error::Protocol(format!(
                "VRL frame length ({} words = {} bytes) does not match buffer length ({} bytes)",
                words,
                words * 4,
                bytes.len()
            )));
        }

        let trailer_at = bytes.len() - VRL_TRAILER_SIZE;
        let trailer = read_u32(&bytes, trailer_at);
        let has_crc = trailer != VRL_NO_CRC;
        if has_crc {
            let computed = crc32(&bytes[..trailer_at]);
            if computed != trailer {
                return Err(Error::Protocol(format!(
                    "invalid VRL frame CRC: frame {frame_count} carries {trailer:#010x}, computed {computed:#010x}"
                )));
            }
        }

        let mut packets = Vec::new();
        let mut off = VRL_HEADER_SIZE;
        while off < trailer_at {
            if trailer_at - off < 4 {
                return Err(Error::Protocol(format!(
                    "VRL frame {frame_count} has {} stray bytes",
                    trailer_at - off
                )));
            }
            let header = PacketHeader::from_word(read_u32(&bytes, off))?;
            let len = header.size_bytes();
            if len == 0 || off + len > trailer_at {
                return Err(Error::Protocol(format!(
                    "VRL frame {frame_count}: embedded packet of {len} bytes overruns the frame"
                )));
            }
            packets.push(Packet::parse(bytes.slice(off..off + len))?);
            off += len;
        }
        if packets.is_empty() {
            return Err(Error::Protocol(format!(
                "VRL frame {frame_count} contains no packets"
            )));
        }

        Ok(Self {
            frame_count,
            has_crc,
            packets,
        })
    }

    /// Encoded size of a frame holding packets of these sizes.
    pub fn encoded_len<'a>(packets: impl IntoIterator<Item = &'a Packet>) -> usize {
        VRL_OVERHEAD + packets.into_iter().map(Packet::len).sum::<usize>()
    }

    /// Append one frame to `out`.
    pub fn encode(
        frame_count: u16,
        packets: &[Packet],
        with_crc: bool,
        out: &mut BytesMut,
    ) -> Result<()> {
        if packets.is_empty() {
            return Err(Error::InvalidParameter(
                "a VRL frame needs at least one packet".into(),
            ));
        }
        let len = Self::encoded_len(packets);
        if len > MAX_FRAME_SIZE {
            return Err(Error::InvalidParameter(format!(
                "VRL frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte limit"
            )));
        }
        let start = out.len();
        out.reserve(len);
        out.put_u32(VRL_FAW);
        out.put_u32((((frame_count % FRAME_COUNT_MODULUS) as u32) << 20) | (len / 4) as u32);
        for p in packets {
            out.put_slice(p.as_bytes());
        }
        let trailer = if with_crc {
            crc32(&out[start..])
        } else {
            VRL_NO_CRC
        };
        out.put_u32(trailer);
        Ok(())
    }

    /// Encode one frame into a fresh buffer.
    pub fn to_bytes(frame_count: u16, packets: &[Packet], with_crc: bool) -> Result<Bytes> {
        let mut out = BytesMut::new();
        Self::encode(frame_count, packets, with_crc, &mut out)?;
        Ok(out.freeze())
    }
}

/// IEEE 802.3 CRC-32 over the frame header and packets.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vita49::PacketBuilder;

    fn pkt(id: u32, words: usize) -> Packet {
        PacketBuilder::data(id)
            .payload(&vec![id as u8; words * 4])
            .build()
            .unwrap()
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn frame_layout() {
        let p = pkt(1, 2); // 16 bytes
        let bytes = VrlFrame::to_bytes(4095, std::slice::from_ref(&p), false).unwrap();
        assert_eq!(bytes.len(), 8 + 16 + 4);
        assert_eq!(&bytes[0..4], b"VRLP");
        assert_eq!(read_u32(&bytes, 4), (4095 << 20) | 7);
        assert_eq!(&bytes[24..28], b"VEND");
    }

    #[test]
    fn parse_frame_with_crc() {
        let packets = vec![pkt(1, 1), pkt(2, 3), pkt(3, 0)];
        let bytes = VrlFrame::to_bytes(17, &packets, true).unwrap();
        let frame = VrlFrame::parse(bytes.clone()).unwrap();
        assert_eq!(frame.frame_count, 17);
        assert!(frame.has_crc);
        assert_eq!(frame.packets, packets);
        assert_eq!(VrlFrame::encoded_len(&packets), bytes.len());
    }

    #[test]
    fn corrupted_crc_rejected() {
        let bytes = VrlFrame::to_bytes(0, &[pkt(1, 2)], true).unwrap();
        let mut bad = BytesMut::from(&bytes[..]);
        bad[14] ^= 0xFF;
        let err = VrlFrame::parse(bad.freeze()).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn no_crc_marker_skips_check() {
        let bytes = VrlFrame::to_bytes(0, &[pkt(1, 2)], false).unwrap();
        let mut edited = BytesMut::from(&bytes[..]);
        edited[16] ^= 0xFF; // payload byte
        let frame = VrlFrame::parse(edited.freeze()).unwrap();
        assert!(!frame.has_crc);
    }

    #[test]
    fn bad_faw_rejected() {
        let bytes = VrlFrame::to_bytes(0, &[pkt(1, 1)], false).unwrap();
        let mut bad = BytesMut::from(&bytes[..]);
        bad[0] = b'X';
        assert!(VrlFrame::parse(bad.freeze()).is_err());
    }

    #[test]
    fn length_mismatch_rejected() {
        let bytes = VrlFrame::to_bytes(0, &[pkt(1, 1)], false).unwrap();
        let mut longer = BytesMut::from(&bytes[..]);
        longer.put_u32(0);
        let err = VrlFrame::parse(longer.freeze()).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn packet_overrunning_frame_rejected() {
        // Frame claims 4 words but its packet claims 3 words inside a
        // 1-word body.
        let mut raw = BytesMut::new();
        raw.put_u32(VRL_FAW);
        raw.put_u32(4);
        raw.put_u32((0x1 << 28) | 3);
        raw.put_u32(VRL_NO_CRC);
        let err = VrlFrame::parse(raw.freeze()).unwrap_err();
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn empty_frame_rejected() {
        assert!(VrlFrame::to_bytes(0, &[], false).is_err());
        let mut raw = BytesMut::new();
        raw.put_u32(VRL_FAW);
        raw.put_u32(3);
        raw.put_u32(VRL_NO_CRC);
        assert!(VrlFrame::parse(raw.freeze()).is_err());
    }

    #[test]
    fn frame_count_wraps() {
        let bytes = VrlFrame::to_bytes(4096 + 5, &[pkt(1, 1)], false).unwrap();
        assert_eq!(VrlFrame::parse(bytes).unwrap().frame_count, 5);
    }
}
