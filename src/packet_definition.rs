use crate::error::{SerializationError, SerializationErrorKind, SerializationResult};
use std::fmt;

/// The closed set of value kinds the binary codec can carry.
///
/// Wire codes are part of the stream format and must never be renumbered;
/// new kinds may only be appended. Scalar kinds occupy 0..=10 and their array
/// counterparts 11..=21.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FieldType {
    Bool = 0,
    String = 1,
    Int32 = 2,
    Int64 = 3,
    UInt32 = 4,
    UInt64 = 5,
    Double = 6,
    Duration = 7,
    DateTime = 8,
    DateTimeOffset = 9,
    Guid = 10,
    BoolArray = 11,
    StringArray = 12,
    Int32Array = 13,
    Int64Array = 14,
    UInt32Array = 15,
    UInt64Array = 16,
    DoubleArray = 17,
    DurationArray = 18,
    DateTimeArray = 19,
    DateTimeOffsetArray = 20,
    GuidArray = 21,
}

impl FieldType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> SerializationResult<Self> {
        use FieldType::*;
        Ok(match code {
            0 => Bool,
            1 => String,
            2 => Int32,
            3 => Int64,
            4 => UInt32,
            5 => UInt64,
            6 => Double,
            7 => Duration,
            8 => DateTime,
            9 => DateTimeOffset,
            10 => Guid,
            11 => BoolArray,
            12 => StringArray,
            13 => Int32Array,
            14 => Int64Array,
            15 => UInt32Array,
            16 => UInt64Array,
            17 => DoubleArray,
            18 => DurationArray,
            19 => DateTimeArray,
            20 => DateTimeOffsetArray,
            21 => GuidArray,
            other => {
                return Err(SerializationError::packet(
                    SerializationErrorKind::UnknownFieldType(other),
                ))
            }
        })
    }

    pub fn is_array(self) -> bool {
        self.code() >= 11
    }

    /// Whether a field of this type accepts a value of kind `value`.
    ///
    /// A field accepts its own kind plus any kind it can hold losslessly.
    /// This is the schema-evolution escape hatch: a writer may widen a field
    /// (Int32 -> Int64) without breaking readers built against the old shape.
    pub fn accepts(self, value: FieldType) -> bool {
        use FieldType::*;
        if self == value {
            return true;
        }
        match self {
            Int64 => matches!(value, Int32 | UInt32),
            UInt64 => matches!(value, UInt32),
            Double => matches!(value, Int32 | UInt32),
            Duration => matches!(value, Int64 | Int32),
            Int64Array => matches!(value, Int32Array | UInt32Array),
            UInt64Array => matches!(value, UInt32Array),
            DoubleArray => matches!(value, Int32Array | UInt32Array),
            _ => false,
        }
    }

    pub fn name(self) -> &'static str {
        use FieldType::*;
        match self {
            Bool => "Bool",
            String => "String",
            Int32 => "Int32",
            Int64 => "Int64",
            UInt32 => "UInt32",
            UInt64 => "UInt64",
            Double => "Double",
            Duration => "Duration",
            DateTime => "DateTime",
            DateTimeOffset => "DateTimeOffset",
            Guid => "Guid",
            BoolArray => "BoolArray",
            StringArray => "StringArray",
            Int32Array => "Int32Array",
            Int64Array => "Int64Array",
            UInt32Array => "UInt32Array",
            UInt64Array => "UInt64Array",
            DoubleArray => "DoubleArray",
            DurationArray => "DurationArray",
            DateTimeArray => "DateTimeArray",
            DateTimeOffsetArray => "DateTimeOffsetArray",
            GuidArray => "GuidArray",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One named field of a packet level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered collection of field definitions with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDefinitionCollection {
    fields: Vec<FieldDefinition>,
}

impl FieldDefinitionCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, field_type: FieldType) -> SerializationResult<()> {
        let name = name.into();
        if self.fields.iter().any(|f| f.name == name) {
            return Err(SerializationError::packet(
                SerializationErrorKind::DuplicateField(name),
            ));
        }
        self.fields.push(FieldDefinition::new(name, field_type));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldDefinition> {
        self.fields.get(index)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter()
    }
}

/// Schema description of one packet type, including its inheritance chain.
///
/// Each level describes the fields one layer of a packet hierarchy
/// contributes; `parent` links to the next level up. Serialization walks the
/// chain root-first so a reader can reconstruct base state before derived
/// state. Definitions are immutable once a stream has observed them: the same
/// type name and version must always describe the same field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDefinition {
    type_name: String,
    version: u32,
    cachable: bool,
    fields: FieldDefinitionCollection,
    parent: Option<Box<PacketDefinition>>,
}

impl PacketDefinition {
    pub fn new(type_name: impl Into<String>, version: u32) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            cachable: false,
            fields: FieldDefinitionCollection::new(),
            parent: None,
        }
    }

    pub fn with_cachable(mut self, cachable: bool) -> Self {
        self.cachable = cachable;
        self
    }

    pub fn with_parent(mut self, parent: PacketDefinition) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Adds a field to this (leaf) level. Duplicate names are rejected
    /// against this level only; levels are independent namespaces.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        field_type: FieldType,
    ) -> SerializationResult<()> {
        self.fields.add(name, field_type)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn cachable(&self) -> bool {
        self.cachable
    }

    pub fn fields(&self) -> &FieldDefinitionCollection {
        &self.fields
    }

    pub fn parent(&self) -> Option<&PacketDefinition> {
        self.parent.as_deref()
    }

    /// Number of levels in the chain, this one included.
    pub fn nesting_depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.nesting_depth())
    }

    /// Levels ordered root-first, which is also wire order.
    pub fn levels(&self) -> Vec<&PacketDefinition> {
        let mut levels = match &self.parent {
            Some(parent) => parent.levels(),
            None => Vec::new(),
        };
        levels.push(self);
        levels
    }

    /// Total field count across every level.
    pub fn total_fields(&self) -> usize {
        self.levels().iter().map(|l| l.fields.len()).sum()
    }

    /// Flattened (level, field) pairs in wire order.
    pub fn flattened_fields(&self) -> Vec<&FieldDefinition> {
        self.levels()
            .into_iter()
            .flat_map(|l| l.fields.iter())
            .collect()
    }

    /// Locates `name` across all levels, returning its flattened slot index.
    pub fn flattened_position(&self, name: &str) -> Option<usize> {
        self.flattened_fields().iter().position(|f| f.name == name)
    }
}
