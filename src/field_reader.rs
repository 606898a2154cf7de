use crate::error::{SerializationError, SerializationErrorKind, SerializationResult};
use crate::field_writer::{CodecState, DateTimeEncoding};
use crate::packet_definition::FieldType;
use crate::serialized_packet::{ticks_to_duration, FieldValue};
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use uuid::Uuid;

/// Decoder for the variable-length binary field format.
///
/// A `FieldReader` is positioned over one packet body; the session
/// [`CodecState`] (string table, timestamp reference) is borrowed from the
/// stream reader so it survives across packets. Every read method is the
/// bit-exact inverse of its [`FieldWriter`](crate::field_writer::FieldWriter)
/// counterpart.
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    state: &'a mut CodecState,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8], state: &'a mut CodecState) -> Self {
        Self {
            data,
            pos: 0,
            state,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn unexpected_end() -> SerializationError {
        SerializationError::stream(SerializationErrorKind::UnexpectedEnd)
    }

    pub fn read_byte(&mut self) -> SerializationResult<u8> {
        let b = *self.data.get(self.pos).ok_or_else(Self::unexpected_end)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> SerializationResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Self::unexpected_end());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> SerializationResult<bool> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_u32(&mut self) -> SerializationResult<u32> {
        let mut result = 0u32;
        for i in 0..5 {
            let b = self.read_byte()?;
            result |= ((b & 0x7F) as u32) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(SerializationError::stream(
            SerializationErrorKind::InvalidVarint,
        ))
    }

    pub fn read_u64(&mut self) -> SerializationResult<u64> {
        let mut result = 0u64;
        for i in 0..8 {
            let b = self.read_byte()?;
            if b & 0x80 == 0 {
                return Ok(result | (b as u64) << (7 * i));
            }
            result |= ((b & 0x7F) as u64) << (7 * i);
        }
        // 9th byte carries the final 8 bits raw.
        let b = self.read_byte()?;
        Ok(result | (b as u64) << 56)
    }

    fn read_signed(&mut self) -> SerializationResult<(u64, bool)> {
        let first = self.read_byte()?;
        let negative = first & 0x80 != 0;
        let mut magnitude = (first & 0x3F) as u64;
        if first & 0x40 != 0 {
            let mut shift = 6;
            loop {
                let b = self.read_byte()?;
                // Checked before shifting: a u64 shift of 64+ overflows, and
                // a conforming writer never emits groups past bit 63.
                if shift >= 64 {
                    return Err(SerializationError::stream(
                        SerializationErrorKind::InvalidVarint,
                    ));
                }
                magnitude |= ((b & 0x7F) as u64) << shift;
                shift += 7;
                if b & 0x80 == 0 {
                    break;
                }
            }
        }
        Ok((magnitude, negative))
    }

    pub fn read_i32(&mut self) -> SerializationResult<i32> {
        let (magnitude, negative) = self.read_signed()?;
        let value = magnitude as u32;
        Ok(if negative {
            (value as i32).wrapping_neg()
        } else {
            value as i32
        })
    }

    pub fn read_i64(&mut self) -> SerializationResult<i64> {
        let (magnitude, negative) = self.read_signed()?;
        Ok(if negative {
            (magnitude as i64).wrapping_neg()
        } else {
            magnitude as i64
        })
    }

    pub fn read_f64(&mut self) -> SerializationResult<f64> {
        let mut acc: u128 = 0;
        let mut groups = 0u32;
        loop {
            let b = self.read_byte()?;
            acc = (acc << 7) | (b & 0x7F) as u128;
            groups += 1;
            if b & 0x80 == 0 {
                break;
            }
            if groups >= 10 {
                return Err(SerializationError::stream(
                    SerializationErrorKind::InvalidVarint,
                ));
            }
        }
        let total_bits = groups * 7;
        let bits = if total_bits >= 64 {
            (acc >> (total_bits - 64)) as u64
        } else {
            (acc as u64) << (64 - total_bits)
        };
        Ok(f64::from_bits(bits))
    }

    pub fn read_string(&mut self) -> SerializationResult<Option<String>> {
        let token = self.read_u32()?;
        match token {
            0 => Ok(None),
            1 => Ok(Some(String::new())),
            _ => {
                let index = token - 1;
                let known = self.state.strings.len() as u32;
                if index <= known {
                    let s = self.state.strings.get(index).ok_or_else(|| {
                        SerializationError::packet(SerializationErrorKind::UnknownStringIndex(token))
                    })?;
                    Ok(Some(s.to_owned()))
                } else if index == known + 1 {
                    let len = self.read_u32()? as usize;
                    let bytes = self.read_bytes(len)?;
                    let s = std::str::from_utf8(bytes).map_err(|_| {
                        SerializationError::packet(SerializationErrorKind::InvalidUtf8)
                    })?;
                    self.state.strings.add(s);
                    Ok(Some(s.to_owned()))
                } else {
                    Err(SerializationError::packet(
                        SerializationErrorKind::UnknownStringIndex(token),
                    ))
                }
            }
        }
    }

    pub fn read_duration(&mut self) -> SerializationResult<Duration> {
        Ok(ticks_to_duration(self.read_i64()?))
    }

    fn read_instant(&mut self) -> SerializationResult<i64> {
        let marker = self.read_u32()?;
        let ticks = match marker {
            m if m == DateTimeEncoding::NewReference as u32 => {
                let ticks = self.read_i64()?;
                self.state.reference_ticks = Some(ticks);
                ticks
            }
            m if m == DateTimeEncoding::LaterTicksNet as u32 => {
                let reference = self.state.reference_ticks.ok_or_else(|| {
                    SerializationError::packet(SerializationErrorKind::BadDateTimeMarker(marker))
                })?;
                reference.wrapping_add(self.read_u64()? as i64)
            }
            m if m == DateTimeEncoding::EarlierTicksNet as u32 => {
                let reference = self.state.reference_ticks.ok_or_else(|| {
                    SerializationError::packet(SerializationErrorKind::BadDateTimeMarker(marker))
                })?;
                reference.wrapping_sub(self.read_u64()? as i64)
            }
            other => {
                return Err(SerializationError::packet(
                    SerializationErrorKind::BadDateTimeMarker(other),
                ))
            }
        };
        Ok(ticks)
    }

    fn ticks_to_utc(ticks: i64) -> SerializationResult<DateTime<Utc>> {
        let nanos = ticks.checked_mul(100).ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::TimestampOutOfRange)
        })?;
        Ok(Utc.timestamp_nanos(nanos))
    }

    pub fn read_datetime(&mut self) -> SerializationResult<DateTime<Utc>> {
        let ticks = self.read_instant()?;
        Self::ticks_to_utc(ticks)
    }

    pub fn read_datetime_offset(&mut self) -> SerializationResult<DateTime<FixedOffset>> {
        let offset_minutes = self.read_i32()?;
        let ticks = self.read_instant()?;
        let utc = Self::ticks_to_utc(ticks)?;
        let offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::TimestampOutOfRange)
        })?;
        Ok(utc.with_timezone(&offset))
    }

    pub fn read_guid(&mut self) -> SerializationResult<Uuid> {
        let bytes = self.read_bytes(16)?;
        // Slice length is checked above, so the conversion cannot fail.
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }

    pub fn read_bool_array(&mut self) -> SerializationResult<Vec<bool>> {
        let len = self.read_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(4096));
        let mut remaining = len;
        while remaining > 0 {
            let word = self.read_u32()?;
            let take = remaining.min(32);
            for i in 0..take {
                values.push(word & (1 << (31 - i)) != 0);
            }
            remaining -= take;
        }
        Ok(values)
    }

    fn read_array<T>(
        &mut self,
        mut element: impl FnMut(&mut Self) -> SerializationResult<T>,
    ) -> SerializationResult<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            values.push(element(self)?);
        }
        Ok(values)
    }

    /// Decodes one value of the given wire kind.
    pub fn read_value(&mut self, field_type: FieldType) -> SerializationResult<FieldValue> {
        Ok(match field_type {
            FieldType::Bool => FieldValue::Bool(self.read_bool()?),
            FieldType::String => FieldValue::String(self.read_string()?),
            FieldType::Int32 => FieldValue::Int32(self.read_i32()?),
            FieldType::Int64 => FieldValue::Int64(self.read_i64()?),
            FieldType::UInt32 => FieldValue::UInt32(self.read_u32()?),
            FieldType::UInt64 => FieldValue::UInt64(self.read_u64()?),
            FieldType::Double => FieldValue::Double(self.read_f64()?),
            FieldType::Duration => FieldValue::Duration(self.read_duration()?),
            FieldType::DateTime => FieldValue::DateTime(self.read_datetime()?),
            FieldType::DateTimeOffset => FieldValue::DateTimeOffset(self.read_datetime_offset()?),
            FieldType::Guid => FieldValue::Guid(self.read_guid()?),
            FieldType::BoolArray => FieldValue::BoolArray(self.read_bool_array()?),
            FieldType::StringArray => FieldValue::StringArray(self.read_array(|r| {
                r.read_string().map(|s| s.unwrap_or_default())
            })?),
            FieldType::Int32Array => FieldValue::Int32Array(self.read_array(Self::read_i32)?),
            FieldType::Int64Array => FieldValue::Int64Array(self.read_array(Self::read_i64)?),
            FieldType::UInt32Array => FieldValue::UInt32Array(self.read_array(Self::read_u32)?),
            FieldType::UInt64Array => FieldValue::UInt64Array(self.read_array(Self::read_u64)?),
            FieldType::DoubleArray => FieldValue::DoubleArray(self.read_array(Self::read_f64)?),
            FieldType::DurationArray => {
                FieldValue::DurationArray(self.read_array(Self::read_duration)?)
            }
            FieldType::DateTimeArray => {
                FieldValue::DateTimeArray(self.read_array(Self::read_datetime)?)
            }
            FieldType::DateTimeOffsetArray => {
                FieldValue::DateTimeOffsetArray(self.read_array(Self::read_datetime_offset)?)
            }
            FieldType::GuidArray => FieldValue::GuidArray(self.read_array(Self::read_guid)?),
        })
    }
}
