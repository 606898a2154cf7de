use crate::error::{SerializationError, SerializationErrorKind, SerializationResult};
use crate::serialized_packet::{duration_to_ticks, FieldValue};
use crate::string_list::UniqueStringList;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use uuid::Uuid;

/// Direction markers for reference-relative timestamp encoding.
///
/// The first timestamp in a session establishes the reference instant; later
/// values encode only the magnitude of their tick delta, with the direction
/// carried by the marker rather than a sign bit inside the delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DateTimeEncoding {
    NewReference = 0,
    LaterTicksNet = 1,
    EarlierTicksNet = 2,
}

/// Session-scoped codec state shared by every packet in one stream: the
/// string dedup table and the timestamp reference instant. Both are
/// transactional so a failed packet cannot poison state that earlier,
/// already-flushed packets rely on.
#[derive(Debug, Default)]
pub struct CodecState {
    pub(crate) strings: UniqueStringList,
    pub(crate) reference_ticks: Option<i64>,
    committed_reference: Option<i64>,
}

impl CodecState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self) {
        self.strings.commit();
        self.committed_reference = self.reference_ticks;
    }

    pub fn rollback(&mut self) {
        self.strings.rollback();
        self.reference_ticks = self.committed_reference;
    }
}

/// Converts a UTC instant to 100ns ticks since the Unix epoch.
pub(crate) fn instant_to_ticks(value: &DateTime<Utc>) -> SerializationResult<i64> {
    let nanos = value
        .timestamp_nanos_opt()
        .ok_or_else(|| SerializationError::packet(SerializationErrorKind::TimestampOutOfRange))?;
    Ok(nanos / 100)
}

/// Encoder for the variable-length binary field format.
///
/// Values accumulate in an internal buffer; the packet stream writer drains
/// it per packet via [`FieldWriter::take_buffer`]. The writer owns the
/// session [`CodecState`], so string dedup and the timestamp reference span
/// the whole stream rather than a single packet.
///
/// Encodings are bit-exact per the stream format; see the individual write
/// methods. The paired [`FieldReader`](crate::field_reader::FieldReader)
/// reverses every one of them.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buffer: Vec<u8>,
    state: CodecState,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes encoded since the last `take_buffer`.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drains and returns the accumulated bytes.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Discards any accumulated bytes without touching session state.
    pub fn discard_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn state(&self) -> &CodecState {
        &self.state
    }

    /// Latches string-table and reference-time state as durably written.
    pub fn commit(&mut self) {
        self.state.commit();
    }

    /// Reverts session state to the last commit; call when a packet fails
    /// after partially encoding.
    pub fn rollback(&mut self) {
        self.state.rollback();
        self.buffer.clear();
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    pub fn write_byte(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Unsigned 32-bit: 7 data bits per byte, least-significant group first,
    /// high bit set while more bytes follow.
    pub fn write_u32(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.buffer.push((value & 0x7F) as u8 | 0x80);
            value >>= 7;
        }
        self.buffer.push(value as u8);
    }

    /// Unsigned 64-bit: as `write_u32`, except the encoding caps at 9 bytes.
    /// After 8 continuation bytes only 8 bits can remain, so the 9th byte
    /// carries them raw with no continuation flag.
    pub fn write_u64(&mut self, mut value: u64) {
        for _ in 0..8 {
            if value < 0x80 {
                self.buffer.push(value as u8);
                return;
            }
            self.buffer.push((value & 0x7F) as u8 | 0x80);
            value >>= 7;
        }
        self.buffer.push(value as u8);
    }

    /// Signed values share one layout: the first byte holds the sign (0x80),
    /// a continuation flag (0x40) and the six low bits of the magnitude;
    /// any remaining bytes use the standard 7-bit continuation form.
    fn write_signed(&mut self, mut magnitude: u64, negative: bool) {
        let mut first = (magnitude & 0x3F) as u8;
        if negative {
            first |= 0x80;
        }
        magnitude >>= 6;
        if magnitude != 0 {
            first |= 0x40;
        }
        self.buffer.push(first);
        while magnitude != 0 {
            if magnitude < 0x80 {
                self.buffer.push(magnitude as u8);
                return;
            }
            self.buffer.push((magnitude & 0x7F) as u8 | 0x80);
            magnitude >>= 7;
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_signed(value.unsigned_abs() as u64, value < 0);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_signed(value.unsigned_abs(), value < 0);
    }

    /// Double: emitted from the high-order end of the IEEE-754 bit pattern,
    /// seven bits at a time, stopping once the remaining low bits are all
    /// zero. Common values with trailing-zero mantissas (integers, halves)
    /// encode in a few bytes; 0.0 is a single zero byte.
    pub fn write_f64(&mut self, value: f64) {
        let mut bits = value.to_bits();
        if bits == 0 {
            self.buffer.push(0);
            return;
        }
        loop {
            let group = ((bits >> 57) & 0x7F) as u8;
            bits <<= 7;
            if bits != 0 {
                self.buffer.push(group | 0x80);
            } else {
                self.buffer.push(group);
                return;
            }
        }
    }

    /// Strings are deduplicated per stream. Token 0 is null, token 1 the
    /// empty string; otherwise the token is the string's interned index plus
    /// one. A token one past the reader's table announces a new entry and is
    /// followed by the length-prefixed UTF-8 bytes; smaller tokens are
    /// back-references with no payload.
    pub fn write_string(&mut self, value: Option<&str>) {
        match value {
            None => self.write_u32(0),
            Some("") => self.write_u32(1),
            Some(s) => {
                let (index, is_new) = self.state.strings.intern(s);
                self.write_u32(index + 1);
                if is_new {
                    self.write_u32(s.len() as u32);
                    self.buffer.extend_from_slice(s.as_bytes());
                }
            }
        }
    }

    /// Timespan as signed 100ns ticks.
    pub fn write_duration(&mut self, value: &Duration) {
        self.write_i64(duration_to_ticks(value));
    }

    fn write_instant(&mut self, ticks: i64) {
        match self.state.reference_ticks {
            None => {
                self.write_u32(DateTimeEncoding::NewReference as u32);
                self.write_i64(ticks);
                self.state.reference_ticks = Some(ticks);
            }
            Some(reference) => {
                let delta = ticks.wrapping_sub(reference);
                if delta >= 0 {
                    self.write_u32(DateTimeEncoding::LaterTicksNet as u32);
                    self.write_u64(delta as u64);
                } else {
                    self.write_u32(DateTimeEncoding::EarlierTicksNet as u32);
                    self.write_u64(delta.unsigned_abs());
                }
            }
        }
    }

    pub fn write_datetime(&mut self, value: &DateTime<Utc>) -> SerializationResult<()> {
        let ticks = instant_to_ticks(value)?;
        self.write_instant(ticks);
        Ok(())
    }

    /// Offset timestamps carry the zone offset in minutes ahead of the
    /// reference-relative instant.
    pub fn write_datetime_offset(&mut self, value: &DateTime<FixedOffset>) -> SerializationResult<()> {
        let offset_minutes = value.offset().local_minus_utc() / 60;
        self.write_i32(offset_minutes);
        let ticks = instant_to_ticks(&value.with_timezone(&Utc))?;
        self.write_instant(ticks);
        Ok(())
    }

    pub fn write_guid(&mut self, value: &Uuid) {
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Bool arrays pack 32 values per word, first value in the most
    /// significant bit; words are emitted through the u32 encoding.
    pub fn write_bool_array(&mut self, values: &[bool]) {
        self.write_u32(values.len() as u32);
        for chunk in values.chunks(32) {
            let mut word = 0u32;
            for (i, &v) in chunk.iter().enumerate() {
                if v {
                    word |= 1 << (31 - i);
                }
            }
            self.write_u32(word);
        }
    }

    pub fn write_string_array(&mut self, values: &[String]) {
        self.write_u32(values.len() as u32);
        for v in values {
            self.write_string(Some(v));
        }
    }

    /// Encodes one typed field value.
    pub fn write_value(&mut self, value: &FieldValue) -> SerializationResult<()> {
        match value {
            FieldValue::Bool(v) => self.write_bool(*v),
            FieldValue::String(v) => self.write_string(v.as_deref()),
            FieldValue::Int32(v) => self.write_i32(*v),
            FieldValue::Int64(v) => self.write_i64(*v),
            FieldValue::UInt32(v) => self.write_u32(*v),
            FieldValue::UInt64(v) => self.write_u64(*v),
            FieldValue::Double(v) => self.write_f64(*v),
            FieldValue::Duration(v) => self.write_duration(v),
            FieldValue::DateTime(v) => self.write_datetime(v)?,
            FieldValue::DateTimeOffset(v) => self.write_datetime_offset(v)?,
            FieldValue::Guid(v) => self.write_guid(v),
            FieldValue::BoolArray(v) => self.write_bool_array(v),
            FieldValue::StringArray(v) => self.write_string_array(v),
            FieldValue::Int32Array(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_i32(*x);
                }
            }
            FieldValue::Int64Array(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_i64(*x);
                }
            }
            FieldValue::UInt32Array(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_u32(*x);
                }
            }
            FieldValue::UInt64Array(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_u64(*x);
                }
            }
            FieldValue::DoubleArray(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_f64(*x);
                }
            }
            FieldValue::DurationArray(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_duration(x);
                }
            }
            FieldValue::DateTimeArray(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_datetime(x)?;
                }
            }
            FieldValue::DateTimeOffsetArray(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_datetime_offset(x)?;
                }
            }
            FieldValue::GuidArray(v) => {
                self.write_u32(v.len() as u32);
                for x in v {
                    self.write_guid(x);
                }
            }
        }
        Ok(())
    }
}
