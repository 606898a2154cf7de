use crate::error::{SerializationError, SerializationErrorKind, SerializationResult};
use crate::packet_definition::{FieldType, PacketDefinition};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// A typed value occupying one field slot of a serialized packet.
///
/// The variants mirror [`FieldType`] one to one; `kind()` recovers the wire
/// kind of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    String(Option<String>),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Double(f64),
    Duration(Duration),
    DateTime(DateTime<Utc>),
    DateTimeOffset(DateTime<FixedOffset>),
    Guid(Uuid),
    BoolArray(Vec<bool>),
    StringArray(Vec<String>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    UInt32Array(Vec<u32>),
    UInt64Array(Vec<u64>),
    DoubleArray(Vec<f64>),
    DurationArray(Vec<Duration>),
    DateTimeArray(Vec<DateTime<Utc>>),
    DateTimeOffsetArray(Vec<DateTime<FixedOffset>>),
    GuidArray(Vec<Uuid>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::UInt32(_) => FieldType::UInt32,
            FieldValue::UInt64(_) => FieldType::UInt64,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Duration(_) => FieldType::Duration,
            FieldValue::DateTime(_) => FieldType::DateTime,
            FieldValue::DateTimeOffset(_) => FieldType::DateTimeOffset,
            FieldValue::Guid(_) => FieldType::Guid,
            FieldValue::BoolArray(_) => FieldType::BoolArray,
            FieldValue::StringArray(_) => FieldType::StringArray,
            FieldValue::Int32Array(_) => FieldType::Int32Array,
            FieldValue::Int64Array(_) => FieldType::Int64Array,
            FieldValue::UInt32Array(_) => FieldType::UInt32Array,
            FieldValue::UInt64Array(_) => FieldType::UInt64Array,
            FieldValue::DoubleArray(_) => FieldType::DoubleArray,
            FieldValue::DurationArray(_) => FieldType::DurationArray,
            FieldValue::DateTimeArray(_) => FieldType::DateTimeArray,
            FieldValue::DateTimeOffsetArray(_) => FieldType::DateTimeOffsetArray,
            FieldValue::GuidArray(_) => FieldType::GuidArray,
        }
    }

    /// Losslessly converts this value into `target`'s representation, per the
    /// field compatibility table. Returns `None` when the table does not allow
    /// the conversion.
    pub fn widen_to(self, target: FieldType) -> Option<FieldValue> {
        if self.kind() == target {
            return Some(self);
        }
        if !target.accepts(self.kind()) {
            return None;
        }
        Some(match (target, self) {
            (FieldType::Int64, FieldValue::Int32(v)) => FieldValue::Int64(v as i64),
            (FieldType::Int64, FieldValue::UInt32(v)) => FieldValue::Int64(v as i64),
            (FieldType::UInt64, FieldValue::UInt32(v)) => FieldValue::UInt64(v as u64),
            (FieldType::Double, FieldValue::Int32(v)) => FieldValue::Double(v as f64),
            (FieldType::Double, FieldValue::UInt32(v)) => FieldValue::Double(v as f64),
            (FieldType::Duration, FieldValue::Int64(v)) => {
                FieldValue::Duration(ticks_to_duration(v))
            }
            (FieldType::Duration, FieldValue::Int32(v)) => {
                FieldValue::Duration(ticks_to_duration(v as i64))
            }
            (FieldType::Int64Array, FieldValue::Int32Array(v)) => {
                FieldValue::Int64Array(v.into_iter().map(|x| x as i64).collect())
            }
            (FieldType::Int64Array, FieldValue::UInt32Array(v)) => {
                FieldValue::Int64Array(v.into_iter().map(|x| x as i64).collect())
            }
            (FieldType::UInt64Array, FieldValue::UInt32Array(v)) => {
                FieldValue::UInt64Array(v.into_iter().map(|x| x as u64).collect())
            }
            (FieldType::DoubleArray, FieldValue::Int32Array(v)) => {
                FieldValue::DoubleArray(v.into_iter().map(|x| x as f64).collect())
            }
            (FieldType::DoubleArray, FieldValue::UInt32Array(v)) => {
                FieldValue::DoubleArray(v.into_iter().map(|x| x as f64).collect())
            }
            _ => return None,
        })
    }
}

/// 100-nanosecond ticks, the wire resolution for durations and timestamps.
pub fn duration_to_ticks(d: &Duration) -> i64 {
    d.num_seconds() * 10_000_000 + (d.subsec_nanos() as i64) / 100
}

pub fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::seconds(ticks / 10_000_000) + Duration::nanoseconds((ticks % 10_000_000) * 100)
}

/// The typed intermediary between domain packets and the binary codec.
///
/// A `SerializedPacket` binds a [`PacketDefinition`] to one value slot per
/// field, in wire order (all levels flattened, root level first). Domain code
/// fills it via `set`; the stream writer drains it in definition order, and
/// the reader produces one for each decoded packet.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    definition: Arc<PacketDefinition>,
    values: Vec<Option<FieldValue>>,
}

impl SerializedPacket {
    pub fn new(definition: Arc<PacketDefinition>) -> Self {
        let slots = definition.total_fields();
        Self {
            definition,
            values: vec![None; slots],
        }
    }

    pub fn definition(&self) -> &Arc<PacketDefinition> {
        &self.definition
    }

    /// Stores `value` into the field named `name`, widening it per the
    /// compatibility table when the kinds differ.
    pub fn set(&mut self, name: &str, value: FieldValue) -> SerializationResult<()> {
        let slot = self.definition.flattened_position(name).ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::NoSuchField(name.to_owned()))
        })?;
        let field_type = self.definition.flattened_fields()[slot].field_type;
        let actual = value.kind();
        let widened = value.widen_to(field_type).ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::IncompatibleField {
                field: name.to_owned(),
                expected: field_type.name(),
                actual: actual.name(),
            })
        })?;
        self.values[slot] = Some(widened);
        Ok(())
    }

    /// Stores a value by flattened slot index; used by the stream reader,
    /// which decodes in definition order.
    pub(crate) fn set_slot(&mut self, slot: usize, value: FieldValue) {
        self.values[slot] = Some(value);
    }

    pub fn get(&self, name: &str) -> SerializationResult<&FieldValue> {
        let slot = self.definition.flattened_position(name).ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::NoSuchField(name.to_owned()))
        })?;
        self.values[slot].as_ref().ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::MissingField(name.to_owned()))
        })
    }

    /// All values in wire order; a `None` slot means the field was never set.
    pub fn values(&self) -> &[Option<FieldValue>] {
        &self.values
    }

    /// Returns the value in wire order for `slot`, erroring on unset slots.
    pub fn slot_value(&self, slot: usize) -> SerializationResult<&FieldValue> {
        self.values
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                let name = self
                    .definition
                    .flattened_fields()
                    .get(slot)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| format!("#{slot}"));
                SerializationError::packet(SerializationErrorKind::MissingField(name))
            })
    }
}
