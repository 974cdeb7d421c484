//! Context packet fields.
//!
//! The first payload word of a context packet is the Context Indicator
//! Field (CIF). Each set bit announces one field, and the fields follow in
//! descending bit order. [`ContextFields::parse`] decodes the fields this
//! library understands and skips geolocation/ephemeris blocks by length;
//! [`ContextBuilder`] encodes them.

use bytes::{BufMut, BytesMut};
use vrtlib_core::{Error, Result};

use crate::payload::PayloadFormat;
use crate::vita49::{ClassId, Packet, PacketBuilder, PacketType, Timestamp, read_u32, read_u64};

// CIF bit positions.
const CHANGE: u32 = 31;
const REF_POINT: u32 = 30;
const BANDWIDTH: u32 = 29;
const IF_REF: u32 = 28;
const RF_REF: u32 = 27;
const RF_OFFSET: u32 = 26;
const IF_OFFSET: u32 = 25;
const REF_LEVEL: u32 = 24;
const GAIN: u32 = 23;
const OVER_RANGE: u32 = 22;
const SAMPLE_RATE: u32 = 21;
const TS_ADJUST: u32 = 20;
const TS_CAL: u32 = 19;
const TEMPERATURE: u32 = 18;
const DEVICE_ID: u32 = 17;
const STATE_EVENT: u32 = 16;
const PAYLOAD_FORMAT: u32 = 15;
const GPS: u32 = 14;
const INS: u32 = 13;
const ECEF: u32 = 12;
const REL_EPHEMERIS: u32 = 11;
const EPHEMERIS_REF: u32 = 10;
const GPS_ASCII: u32 = 9;
const ASSOC_LISTS: u32 = 8;

/// Fixed-size fields this module does not decode, with their word counts.
const SKIPPED_FIELDS: [(u32, usize); 5] = [
    (GPS, 11),
    (INS, 11),
    (ECEF, 13),
    (REL_EPHEMERIS, 13),
    (EPHEMERIS_REF, 1),
];

const RADIX_FREQ: f64 = (1u64 << 20) as f64;
const RADIX_LEVEL: f32 = 128.0;
const RADIX_TEMP: f32 = 64.0;

/// Two-stage gain in dB.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Gain {
    pub stage1: f32,
    pub stage2: f32,
}

/// Manufacturer OUI plus device code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceId {
    pub oui: u32,
    pub device_code: u16,
}

/// Context association lists (CIF bit 8).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextAssociationLists {
    pub source: Vec<u32>,
    pub system: Vec<u32>,
    pub vector_component: Vec<u32>,
    pub async_channel: Vec<u32>,
    /// Present when the A bit is set; one tag per asynchronous channel.
    pub async_tags: Option<Vec<u32>>,
}

impl ContextAssociationLists {
    /// Stream IDs whose context is part of the owning stream's
    /// description: the source and system lists.
    pub fn required_stream_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.source.iter().chain(self.system.iter()).copied()
    }

    fn parse(words: &[u8]) -> Result<(Self, usize)> {
        if words.len() < 8 {
            return Err(Error::Protocol(
                "context association lists truncated".into(),
            ));
        }
        let w0 = read_u32(words, 0);
        let w1 = read_u32(words, 4);
        let source_len = ((w0 >> 16) & 0x1FF) as usize;
        let system_len = (w0 & 0x1FF) as usize;
        let tags = (w1 >> 31) & 1 == 1;
        let vector_len = ((w1 >> 16) & 0x7FFF) as usize;
        let async_len = (w1 & 0x7FFF) as usize;

        let total_words = 2
            + source_len
            + system_len
            + vector_len
            + async_len
            + if tags { async_len } else { 0 };
        if words.len() < total_words * 4 {
            return Err(Error::Protocol(format!(
                "context association lists need {} words, {} available",
                total_words,
                words.len() / 4
            )));
        }

        let mut off = 8;
        let mut take = |n: usize| {
            let list = (0..n).map(|i| read_u32(words, off + i * 4)).collect();
            off += n * 4;
            list
        };
        let lists = Self {
            source: take(source_len),
            system: take(system_len),
            vector_component: take(vector_len),
            async_channel: take(async_len),
            async_tags: if tags { Some(take(async_len)) } else { None },
        };
        Ok((lists, total_words * 4))
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.source.len() > 0x1FF || self.system.len() > 0x1FF {
            return Err(Error::InvalidParameter(
                "source/system association lists hold at most 511 IDs".into(),
            ));
        }
        if self.vector_component.len() > 0x7FFF || self.async_channel.len() > 0x7FFF {
            return Err(Error::InvalidParameter(
                "vector/async association lists hold at most 32767 IDs".into(),
            ));
        }
        if let Some(tags) = &self.async_tags {
            if tags.len() != self.async_channel.len() {
                return Err(Error::InvalidParameter(
                    "async channel tag count must match the async channel list".into(),
                ));
            }
        }
        buf.put_u32(((self.source.len() as u32) << 16) | self.system.len() as u32);
        let mut w1 = ((self.vector_component.len() as u32) << 16) | self.async_channel.len() as u32;
        if self.async_tags.is_some() {
            w1 |= 1 << 31;
        }
        buf.put_u32(w1);
        for id in self
            .source
            .iter()
            .chain(&self.system)
            .chain(&self.vector_component)
            .chain(&self.async_channel)
            .chain(self.async_tags.iter().flatten())
        {
            buf.put_u32(*id);
        }
        Ok(())
    }
}

/// Decoded context packet payload.
///
/// Frequencies, bandwidth and sample rate are in Hz; levels and gains in
/// dB/dBm; temperature in degrees Celsius; timestamp adjustment in
/// picoseconds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextFields {
    pub change_indicator: bool,
    pub reference_point_id: Option<u32>,
    pub bandwidth: Option<f64>,
    pub if_reference_frequency: Option<f64>,
    pub rf_reference_frequency: Option<f64>,
    pub rf_offset: Option<f64>,
    pub if_band_offset: Option<f64>,
    pub reference_level: Option<f32>,
    pub gain: Option<Gain>,
    pub over_range_count: Option<u32>,
    pub sample_rate: Option<f64>,
    pub timestamp_adjustment: Option<i64>,
    pub timestamp_calibration_time: Option<u32>,
    pub temperature: Option<f32>,
    pub device_id: Option<DeviceId>,
    pub state_event_indicators: Option<u32>,
    pub payload_format: Option<PayloadFormat>,
    pub association_lists: Option<ContextAssociationLists>,
}

impl ContextFields {
    /// Decode the payload of a context packet.
    pub fn parse(packet: &Packet) -> Result<Self> {
        if !packet.is_context() {
            return Err(Error::InvalidParameter(
                "context fields requested from a data packet".into(),
            ));
        }
        Self::parse_payload(packet.payload())
    }

    /// Decode a context payload starting at the CIF word.
    pub fn parse_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::Protocol(
                "context packet has no context indicator field".into(),
            ));
        }
        let cif = read_u32(payload, 0);
        if cif & 0xFF != 0 {
            return Err(Error::Protocol(format!(
                "context indicator field {cif:#010x} sets reserved bits"
            )));
        }
        let has = |bit: u32| (cif >> bit) & 1 == 1;
        let mut r = FieldReader { data: payload, off: 4 };
        let mut out = ContextFields {
            change_indicator: has(CHANGE),
            ..Default::default()
        };

        if has(REF_POINT) {
            out.reference_point_id = Some(r.u32()?);
        }
        if has(BANDWIDTH) {
            out.bandwidth = Some(r.freq()?);
        }
        if has(IF_REF) {
            out.if_reference_frequency = Some(r.freq()?);
        }
        if has(RF_REF) {
            out.rf_reference_frequency = Some(r.freq()?);
        }
        if has(RF_OFFSET) {
            out.rf_offset = Some(r.freq()?);
        }
        if has(IF_OFFSET) {
            out.if_band_offset = Some(r.freq()?);
        }
        if has(REF_LEVEL) {
            out.reference_level = Some(r.u32()? as u16 as i16 as f32 / RADIX_LEVEL);
        }
        if has(GAIN) {
            let w = r.u32()?;
            out.gain = Some(Gain {
                stage1: w as u16 as i16 as f32 / RADIX_LEVEL,
                stage2: (w >> 16) as u16 as i16 as f32 / RADIX_LEVEL,
            });
        }
        if has(OVER_RANGE) {
            out.over_range_count = Some(r.u32()?);
        }
        if has(SAMPLE_RATE) {
            out.sample_rate = Some(r.freq()?);
        }
        if has(TS_ADJUST) {
            out.timestamp_adjustment = Some(r.u64()? as i64);
        }
        if has(TS_CAL) {
            out.timestamp_calibration_time = Some(r.u32()?);
        }
        if has(TEMPERATURE) {
            out.temperature = Some(r.u32()? as u16 as i16 as f32 / RADIX_TEMP);
        }
        if has(DEVICE_ID) {
            let oui = r.u32()? & 0x00FF_FFFF;
            let device_code = r.u32()? as u16;
            out.device_id = Some(DeviceId { oui, device_code });
        }
        if has(STATE_EVENT) {
            out.state_event_indicators = Some(r.u32()?);
        }
        if has(PAYLOAD_FORMAT) {
            let w0 = r.u32()?;
            let w1 = r.u32()?;
            out.payload_format = Some(PayloadFormat::from_words(w0, w1));
        }
        for (bit, words) in SKIPPED_FIELDS {
            if has(bit) {
                r.skip(words)?;
            }
        }
        if has(GPS_ASCII) {
            r.skip(1)?;
            let n = r.u32()? as usize;
            r.skip(n)?;
        }
        if has(ASSOC_LISTS) {
            let (lists, used) = ContextAssociationLists::parse(&payload[r.off..])?;
            r.off += used;
            out.association_lists = Some(lists);
        }
        Ok(out)
    }

    /// Stream IDs declared by the association lists, if any.
    pub fn required_stream_ids(&self) -> Vec<u32> {
        self.association_lists
            .as_ref()
            .map(|l| l.required_stream_ids().collect())
            .unwrap_or_default()
    }

    /// Encode as a context payload (CIF word plus fields).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut cif = 0u32;
        let mut set = |bit: u32, present: bool| {
            if present {
                cif |= 1 << bit;
            }
        };
        set(CHANGE, self.change_indicator);
        set(REF_POINT, self.reference_point_id.is_some());
        set(BANDWIDTH, self.bandwidth.is_some());
        set(IF_REF, self.if_reference_frequency.is_some());
        set(RF_REF, self.rf_reference_frequency.is_some());
        set(RF_OFFSET, self.rf_offset.is_some());
        set(IF_OFFSET, self.if_band_offset.is_some());
        set(REF_LEVEL, self.reference_level.is_some());
        set(GAIN, self.gain.is_some());
        set(OVER_RANGE, self.over_range_count.is_some());
        set(SAMPLE_RATE, self.sample_rate.is_some());
        set(TS_ADJUST, self.timestamp_adjustment.is_some());
        set(TS_CAL, self.timestamp_calibration_time.is_some());
        set(TEMPERATURE, self.temperature.is_some());
        set(DEVICE_ID, self.device_id.is_some());
        set(STATE_EVENT, self.state_event_indicators.is_some());
        set(PAYLOAD_FORMAT, self.payload_format.is_some());
        set(ASSOC_LISTS, self.association_lists.is_some());
        buf.put_u32(cif);

        if let Some(v) = self.reference_point_id {
            buf.put_u32(v);
        }
        for v in [
            self.bandwidth,
            self.if_reference_frequency,
            self.rf_reference_frequency,
            self.rf_offset,
            self.if_band_offset,
        ]
        .into_iter()
        .flatten()
        {
            buf.put_i64((v * RADIX_FREQ).round() as i64);
        }
        if let Some(v) = self.reference_level {
            buf.put_u32(fixed16(v, RADIX_LEVEL) as u32);
        }
        if let Some(g) = self.gain {
            buf.put_u32(
                ((fixed16(g.stage2, RADIX_LEVEL) as u32) << 16) | fixed16(g.stage1, RADIX_LEVEL) as u32,
            );
        }
        if let Some(v) = self.over_range_count {
            buf.put_u32(v);
        }
        if let Some(v) = self.sample_rate {
            buf.put_i64((v * RADIX_FREQ).round() as i64);
        }
        if let Some(v) = self.timestamp_adjustment {
            buf.put_i64(v);
        }
        if let Some(v) = self.timestamp_calibration_time {
            buf.put_u32(v);
        }
        if let Some(v) = self.temperature {
            buf.put_u32(fixed16(v, RADIX_TEMP) as u32);
        }
        if let Some(d) = self.device_id {
            buf.put_u32(d.oui & 0x00FF_FFFF);
            buf.put_u32(d.device_code as u32);
        }
        if let Some(v) = self.state_event_indicators {
            buf.put_u32(v);
        }
        if let Some(fmt) = self.payload_format {
            let (w0, w1) = fmt.to_words();
            buf.put_u32(w0);
            buf.put_u32(w1);
        }
        if let Some(lists) = &self.association_lists {
            lists.encode(buf)?;
        }
        Ok(())
    }
}

/// 16-bit fixed point in the low half of a word; upper half zero.
fn fixed16(v: f32, radix: f32) -> u16 {
    (v * radix).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16 as u16
}

struct FieldReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl FieldReader<'_> {
    fn need(&self, bytes: usize) -> Result<()> {
        if self.off + bytes > self.data.len() {
            return Err(Error::Protocol(format!(
                "context payload truncated at byte {} ({} available)",
                self.off,
                self.data.len()
            )));
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = read_u32(self.data, self.off);
        self.off += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = read_u64(self.data, self.off);
        self.off += 8;
        Ok(v)
    }

    fn freq(&mut self) -> Result<f64> {
        Ok(self.u64()? as i64 as f64 / RADIX_FREQ)
    }

    fn skip(&mut self, words: usize) -> Result<()> {
        self.need(words * 4)?;
        self.off += words * 4;
        Ok(())
    }
}

/// Builder for context packets.
///
/// ```
/// use vrtlib_packet::context::{ContextBuilder, ContextFields};
///
/// let pkt = ContextBuilder::new(100)
///     .sample_rate(1.0e6)
///     .rf_reference_frequency(100.0e6)
///     .build()
///     .unwrap();
/// let fields = ContextFields::parse(&pkt).unwrap();
/// assert_eq!(fields.sample_rate, Some(1.0e6));
/// ```
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    stream_id: u32,
    class_id: Option<ClassId>,
    timestamp: Timestamp,
    fields: ContextFields,
}

impl ContextBuilder {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            class_id: None,
            timestamp: Timestamp::default(),
            fields: ContextFields::default(),
        }
    }

    pub fn class_id(mut self, class_id: ClassId) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = ts;
        self
    }

    /// Replace all fields at once.
    pub fn fields(mut self, fields: ContextFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn change_indicator(mut self, changed: bool) -> Self {
        self.fields.change_indicator = changed;
        self
    }

    pub fn reference_point_id(mut self, id: u32) -> Self {
        self.fields.reference_point_id = Some(id);
        self
    }

    pub fn bandwidth(mut self, hz: f64) -> Self {
        self.fields.bandwidth = Some(hz);
        self
    }

    pub fn if_reference_frequency(mut self, hz: f64) -> Self {
        self.fields.if_reference_frequency = Some(hz);
        self
    }

    pub fn rf_reference_frequency(mut self, hz: f64) -> Self {
        self.fields.rf_reference_frequency = Some(hz);
        self
    }

    pub fn rf_offset(mut self, hz: f64) -> Self {
        self.fields.rf_offset = Some(hz);
        self
    }

    pub fn if_band_offset(mut self, hz: f64) -> Self {
        self.fields.if_band_offset = Some(hz);
        self
    }

    pub fn reference_level(mut self, dbm: f32) -> Self {
        self.fields.reference_level = Some(dbm);
        self
    }

    pub fn gain(mut self, stage1: f32, stage2: f32) -> Self {
        self.fields.gain = Some(Gain { stage1, stage2 });
        self
    }

    pub fn over_range_count(mut self, count: u32) -> Self {
        self.fields.over_range_count = Some(count);
        self
    }

    pub fn sample_rate(mut self, hz: f64) -> Self {
        self.fields.sample_rate = Some(hz);
        self
    }

    pub fn timestamp_adjustment(mut self, picoseconds: i64) -> Self {
        self.fields.timestamp_adjustment = Some(picoseconds);
        self
    }

    pub fn timestamp_calibration_time(mut self, seconds: u32) -> Self {
        self.fields.timestamp_calibration_time = Some(seconds);
        self
    }

    pub fn temperature(mut self, celsius: f32) -> Self {
        self.fields.temperature = Some(celsius);
        self
    }

    pub fn device_id(mut self, oui: u32, device_code: u16) -> Self {
        self.fields.device_id = Some(DeviceId { oui, device_code });
        self
    }

    pub fn state_event_indicators(mut self, bits: u32) -> Self {
        self.fields.state_event_indicators = Some(bits);
        self
    }

    pub fn payload_format(mut self, format: PayloadFormat) -> Self {
        self.fields.payload_format = Some(format);
        self
    }

    pub fn association_lists(mut self, lists: ContextAssociationLists) -> Self {
        self.fields.association_lists = Some(lists);
        self
    }

    /// Shorthand for association lists holding only source IDs.
    pub fn sources(self, ids: &[u32]) -> Self {
        self.association_lists(ContextAssociationLists {
            source: ids.to_vec(),
            ..Default::default()
        })
    }

    pub fn build(self) -> Result<Packet> {
        let mut payload = BytesMut::new();
        self.fields.encode(&mut payload)?;
        let mut builder = PacketBuilder::new(PacketType::Context)
            .stream_id(self.stream_id)
            .timestamp(self.timestamp)
            .payload(&payload);
        if let Some(class) = self.class_id {
            builder = builder.class_id(class);
        }
        builder.build()
    }
}
