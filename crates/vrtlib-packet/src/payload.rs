//! Data payload format descriptor and sample unpacking.
//!
//! The payload format is carried in context packets (CIF bit 15) as two
//! 32-bit words. [`unpack_samples`] turns a data packet payload into `f64`
//! values for the common byte-aligned formats.

use vrtlib_core::{Error, Result};

/// How items are packed into 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackingMethod {
    /// Items never straddle a word boundary.
    #[default]
    ProcessingEfficient,
    /// Items are packed back to back.
    LinkEfficient,
}

/// Real/complex sample type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealComplex {
    #[default]
    Real,
    ComplexCartesian,
    ComplexPolar,
    Reserved,
}

/// Data item format (5-bit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataItemFormat {
    #[default]
    SignedFixed,
    UnsignedFixed,
    /// IEEE-754 single precision.
    Float,
    /// IEEE-754 double precision.
    Double,
    /// VRT floating point and reserved codes.
    Other(u8),
}

impl DataItemFormat {
    fn from_code(code: u8) -> Self {
        match code {
            0x00 => DataItemFormat::SignedFixed,
            0x10 => DataItemFormat::UnsignedFixed,
            0x0E => DataItemFormat::Float,
            0x0F => DataItemFormat::Double,
            other => DataItemFormat::Other(other & 0x1F),
        }
    }

    fn code(self) -> u8 {
        match self {
            DataItemFormat::SignedFixed => 0x00,
            DataItemFormat::UnsignedFixed => 0x10,
            DataItemFormat::Float => 0x0E,
            DataItemFormat::Double => 0x0F,
            DataItemFormat::Other(c) => c & 0x1F,
        }
    }
}

/// Decoded data payload format field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadFormat {
    pub packing: PackingMethod,
    pub real_complex: RealComplex,
    pub item_format: DataItemFormat,
    pub repeat_indicator: bool,
    /// Event tag size in bits (0-7).
    pub event_tag_size: u8,
    /// Channel tag size in bits (0-15).
    pub channel_tag_size: u8,
    /// Item packing field size in bits (1-64).
    pub item_packing_size: u8,
    /// Data item size in bits (1-64).
    pub data_item_size: u8,
    /// Repeat count (1-65536).
    pub repeat_count: u32,
    /// Vector size (1-65536).
    pub vector_size: u32,
}

impl Default for PayloadFormat {
    fn default() -> Self {
        Self::new(DataItemFormat::SignedFixed, 16)
    }
}

impl PayloadFormat {
    /// Real, processing-efficient items of `bits` each with no tags.
    pub fn new(item_format: DataItemFormat, bits: u8) -> Self {
        Self {
            packing: PackingMethod::ProcessingEfficient,
            real_complex: RealComplex::Real,
            item_format,
            repeat_indicator: false,
            event_tag_size: 0,
            channel_tag_size: 0,
            item_packing_size: bits,
            data_item_size: bits,
            repeat_count: 1,
            vector_size: 1,
        }
    }

    pub fn complex(mut self) -> Self {
        self.real_complex = RealComplex::ComplexCartesian;
        self
    }

    /// Decode the two-word field.
    pub fn from_words(w0: u32, w1: u32) -> Self {
        Self {
            packing: if w0 >> 31 == 1 {
                PackingMethod::LinkEfficient
            } else {
                PackingMethod::ProcessingEfficient
            },
            real_complex: match (w0 >> 29) & 0x3 {
                0 => RealComplex::Real,
                1 => RealComplex::ComplexCartesian,
                2 => RealComplex::ComplexPolar,
                _ => RealComplex::Reserved,
            },
            item_format: DataItemFormat::from_code(((w0 >> 24) & 0x1F) as u8),
            repeat_indicator: (w0 >> 23) & 1 == 1,
            event_tag_size: ((w0 >> 20) & 0x7) as u8,
            channel_tag_size: ((w0 >> 16) & 0xF) as u8,
            item_packing_size: ((w0 >> 6) & 0x3F) as u8 + 1,
            data_item_size: (w0 & 0x3F) as u8 + 1,
            repeat_count: (w1 >> 16) + 1,
            vector_size: (w1 & 0xFFFF) + 1,
        }
    }

    /// Encode into the two-word field.
    pub fn to_words(&self) -> (u32, u32) {
        let mut w0 = 0u32;
        if self.packing == PackingMethod::LinkEfficient {
            w0 |= 1 << 31;
        }
        w0 |= match self.real_complex {
            RealComplex::Real => 0,
            RealComplex::ComplexCartesian => 1,
            RealComplex::ComplexPolar => 2,
            RealComplex::Reserved => 3,
        } << 29;
        w0 |= (self.item_format.code() as u32) << 24;
        w0 |= (self.repeat_indicator as u32) << 23;
        w0 |= (self.event_tag_size as u32 & 0x7) << 20;
        w0 |= (self.channel_tag_size as u32 & 0xF) << 16;
        w0 |= (self.item_packing_size.saturating_sub(1) as u32 & 0x3F) << 6;
        w0 |= self.data_item_size.saturating_sub(1) as u32 & 0x3F;
        let w1 = ((self.repeat_count.saturating_sub(1) & 0xFFFF) << 16)
            | (self.vector_size.saturating_sub(1) & 0xFFFF);
        (w0, w1)
    }

    pub fn is_complex(&self) -> bool {
        matches!(
            self.real_complex,
            RealComplex::ComplexCartesian | RealComplex::ComplexPolar
        )
    }
}

/// Unpack a data payload into sample values.
///
/// Complex formats yield interleaved components (I, Q, I, Q, ...).
/// Supported: untagged, byte-aligned items of 8/16/32/64 bits whose data
/// item fills the packing field, as signed/unsigned fixed point or IEEE
/// float/double.
pub fn unpack_samples(format: &PayloadFormat, payload: &[u8]) -> Result<Vec<f64>> {
    if format.event_tag_size != 0 || format.channel_tag_size != 0 {
        return Err(Error::Unsupported(
            "payloads with event or channel tags".into(),
        ));
    }
    if format.item_packing_size != format.data_item_size {
        return Err(Error::Unsupported(format!(
            "{}-bit items in {}-bit packing fields",
            format.data_item_size, format.item_packing_size
        )));
    }
    let bits = format.data_item_size;
    if !matches!(bits, 8 | 16 | 32 | 64) {
        return Err(Error::Unsupported(format!("{bits}-bit data items")));
    }
    match (format.item_format, bits) {
        (DataItemFormat::Float, 32) | (DataItemFormat::Double, 64) => {}
        (DataItemFormat::Float, _) | (DataItemFormat::Double, _) => {
            return Err(Error::Protocol(format!(
                "{:?} items cannot be {bits} bits",
                format.item_format
            )));
        }
        (DataItemFormat::Other(code), _) => {
            return Err(Error::Unsupported(format!(
                "data item format code {code:#04x}"
            )));
        }
        _ => {}
    }

    let width = bits as usize / 8;
    if payload.len() % width != 0 && width <= 4 {
        return Err(Error::Protocol(format!(
            "payload length {} is not a multiple of the {width}-byte item size",
            payload.len()
        )));
    }
    let mut samples = Vec::with_capacity(payload.len() / width);
    // Processing-efficient payloads may end in pad bytes to the word boundary.
    for chunk in payload.chunks_exact(width) {
        let v = match (format.item_format, width) {
            (DataItemFormat::SignedFixed, 1) => chunk[0] as i8 as f64,
            (DataItemFormat::SignedFixed, 2) => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
            (DataItemFormat::SignedFixed, 4) => {
                i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            (DataItemFormat::SignedFixed, _) => i64::from_be_bytes(eight(chunk)) as f64,
            (DataItemFormat::UnsignedFixed, 1) => chunk[0] as f64,
            (DataItemFormat::UnsignedFixed, 2) => u16::from_be_bytes([chunk[0], chunk[1]]) as f64,
            (DataItemFormat::UnsignedFixed, 4) => {
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            (DataItemFormat::UnsignedFixed, _) => u64::from_be_bytes(eight(chunk)) as f64,
            (DataItemFormat::Float, _) => {
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            (DataItemFormat::Double, _) => f64::from_be_bytes(eight(chunk)),
            (DataItemFormat::Other(_), _) => continue,
        };
        samples.push(v);
    }
    Ok(samples)
}

fn eight(chunk: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&chunk[..8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_trip() {
        let fmt = PayloadFormat {
            packing: PackingMethod::LinkEfficient,
            real_complex: RealComplex::ComplexCartesian,
            item_format: DataItemFormat::UnsignedFixed,
            repeat_indicator: true,
            event_tag_size: 3,
            channel_tag_size: 4,
            item_packing_size: 24,
            data_item_size: 12,
            repeat_count: 2,
            vector_size: 1024,
        };
        let (w0, w1) = fmt.to_words();
        assert_eq!(PayloadFormat::from_words(w0, w1), fmt);
    }

    #[test]
    fn known_encoding_int16_complex() {
        // Complex cartesian, signed fixed, 16-bit items in 16-bit fields.
        let (w0, w1) = PayloadFormat::new(DataItemFormat::SignedFixed, 16)
            .complex()
            .to_words();
        assert_eq!(w0, 0x2000_03CF);
        assert_eq!(w1, 0);
    }

    #[test]
    fn unpack_int16() {
        let mut payload = Vec::new();
        for v in [1i16, -2, 32767, -32768] {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let samples = unpack_samples(&PayloadFormat::default(), &payload).unwrap();
        assert_eq!(samples, vec![1.0, -2.0, 32767.0, -32768.0]);
    }

    #[test]
    fn unpack_uint8() {
        let fmt = PayloadFormat::new(DataItemFormat::UnsignedFixed, 8);
        let samples = unpack_samples(&fmt, &[0, 128, 255, 7]).unwrap();
        assert_eq!(samples, vec![0.0, 128.0, 255.0, 7.0]);
    }

    #[test]
    fn unpack_float() {
        let mut payload = Vec::new();
        for v in [0.5f32, -0.25] {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let fmt = PayloadFormat::new(DataItemFormat::Float, 32);
        assert_eq!(unpack_samples(&fmt, &payload).unwrap(), vec![0.5, -0.25]);
    }

    #[test]
    fn unpack_double() {
        let payload = 1.0e9f64.to_be_bytes();
        let fmt = PayloadFormat::new(DataItemFormat::Double, 64);
        assert_eq!(unpack_samples(&fmt, &payload).unwrap(), vec![1.0e9]);
    }

    #[test]
    fn unpack_int64_ignores_word_padding() {
        let mut payload = (-5i64).to_be_bytes().to_vec();
        payload.extend_from_slice(&[0; 4]);
        let fmt = PayloadFormat::new(DataItemFormat::SignedFixed, 64);
        assert_eq!(unpack_samples(&fmt, &payload).unwrap(), vec![-5.0]);
    }

    #[test]
    fn tagged_payload_unsupported() {
        let mut fmt = PayloadFormat::default();
        fmt.event_tag_size = 1;
        assert!(matches!(
            unpack_samples(&fmt, &[0; 4]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn odd_width_unsupported() {
        let fmt = PayloadFormat::new(DataItemFormat::SignedFixed, 12);
        assert!(matches!(
            unpack_samples(&fmt, &[0; 4]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn float_with_wrong_width_is_protocol_error() {
        let fmt = PayloadFormat::new(DataItemFormat::Float, 16);
        assert!(matches!(
            unpack_samples(&fmt, &[0; 4]),
            Err(Error::Protocol(_))
        ));
    }
}
