use crate::error::{
    Result, SerializationError, SerializationErrorKind, SerializationResult,
};
use crate::field_reader::FieldReader;
use crate::field_writer::{CodecState, FieldWriter};
use crate::packet_definition::PacketDefinition;
use crate::serialized_packet::SerializedPacket;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Upper bound on a single packet body; a length prefix beyond this is
/// treated as stream corruption rather than an allocation request.
const MAX_PACKET_LEN: u64 = 16 * 1024 * 1024;

/// Guard byte emitted before each packet when `stream-guards` is enabled.
#[cfg(feature = "stream-guards")]
const GUARD_PREAMBLE: u8 = 0xFB;
/// Guard byte emitted after each packet when `stream-guards` is enabled.
#[cfg(feature = "stream-guards")]
const GUARD_POSTAMBLE: u8 = 0xFC;

/// Serializes packets to a byte stream.
///
/// Each packet is written as a variable-length u64 length prefix followed by
/// the body: a type token, then the field values in definition order. Type
/// tokens work like string interning: the first packet of a type carries its
/// full [`PacketDefinition`] inline and every later packet of that type
/// references it by index. String dedup and the timestamp reference span the
/// stream through the embedded [`FieldWriter`].
///
/// A packet that fails to encode rolls the session state back and leaves the
/// underlying stream untouched, so one bad packet never poisons the stream.
pub struct PacketWriter<W: Write> {
    inner: W,
    fields: FieldWriter,
    definitions: Vec<Arc<PacketDefinition>>,
    index: HashMap<String, u32>,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            fields: FieldWriter::new(),
            definitions: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Number of packet definitions the stream has registered so far.
    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Writes one packet. On an encoding error the stream and session state
    /// are unchanged; on an I/O error the stream must be considered dead.
    pub fn write(&mut self, record: &SerializedPacket) -> Result<()> {
        let new_definition = match self.encode_body(record) {
            Ok(new_definition) => new_definition,
            Err(err) => {
                self.fields.rollback();
                return Err(err.into());
            }
        };
        let body = self.fields.take_buffer();

        let mut prefix = FieldWriter::new();
        prefix.write_u64(body.len() as u64);
        let prefix = prefix.take_buffer();

        #[cfg(feature = "stream-guards")]
        self.inner.write_all(&[GUARD_PREAMBLE])?;
        self.inner.write_all(&prefix)?;
        self.inner.write_all(&body)?;
        #[cfg(feature = "stream-guards")]
        self.inner.write_all(&[GUARD_POSTAMBLE])?;

        self.fields.commit();
        if let Some(definition) = new_definition {
            self.definitions.push(Arc::clone(&definition));
            self.index
                .insert(definition.type_name().to_owned(), self.definitions.len() as u32);
        }
        Ok(())
    }

    /// Encodes the type token and fields into the scratch buffer; returns the
    /// definition when this packet introduced one.
    fn encode_body(
        &mut self,
        record: &SerializedPacket,
    ) -> SerializationResult<Option<Arc<PacketDefinition>>> {
        let definition = record.definition();
        let new_definition = match self.index.get(definition.type_name()) {
            Some(&token) => {
                let known = &self.definitions[token as usize - 1];
                if known.as_ref() != definition.as_ref() {
                    return Err(SerializationError::stream(
                        SerializationErrorKind::DefinitionMismatch {
                            type_name: definition.type_name().to_owned(),
                        },
                    ));
                }
                self.fields.write_u32(token);
                None
            }
            None => {
                let token = self.definitions.len() as u32 + 1;
                self.fields.write_u32(token);
                self.encode_definition(definition);
                Some(Arc::clone(definition))
            }
        };

        for (slot, field) in definition.flattened_fields().iter().enumerate() {
            let value = record.slot_value(slot)?;
            debug_assert_eq!(value.kind(), field.field_type);
            self.fields.write_value(value)?;
        }
        Ok(new_definition)
    }

    fn encode_definition(&mut self, definition: &PacketDefinition) {
        self.fields.write_bool(definition.cachable());
        let levels = definition.levels();
        self.fields.write_u32(levels.len() as u32);
        self.fields.write_string(Some(definition.type_name()));
        for level in levels {
            self.fields.write_string(Some(level.type_name()));
            self.fields.write_u32(level.version());
            self.fields.write_u32(level.fields().len() as u32);
            for field in level.fields().iter() {
                self.fields.write_string(Some(&field.name));
                self.fields.write_u32(field.field_type.code());
            }
        }
    }
}

/// Deserializes packets from a byte stream, mirroring [`PacketWriter`].
///
/// Errors split two ways, visible through
/// [`SerializationError::stream_failed`]: a framing error (bad guard byte,
/// bad length prefix, truncated body) means no further byte can be trusted
/// and iteration must stop; a body-level error (unknown field type, bad
/// definition) discards just that packet, since the body was already consumed
/// in full, so `read` may simply be called again.
pub struct PacketReader<R: Read> {
    inner: R,
    state: CodecState,
    definitions: Vec<Arc<PacketDefinition>>,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: CodecState::new(),
            definitions: Vec::new(),
        }
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    /// Reads the next packet. `Ok(None)` is a clean end of stream.
    pub fn read(&mut self) -> Result<Option<SerializedPacket>> {
        #[cfg(feature = "stream-guards")]
        {
            let mut guard = [0u8; 1];
            match self.inner.read_exact(&mut guard) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            if guard[0] != GUARD_PREAMBLE {
                return Err(SerializationError::stream(
                    SerializationErrorKind::BadGuardByte(guard[0]),
                )
                .into());
            }
        }

        let length = match self.read_length_prefix()? {
            Some(length) => length,
            None => return Ok(None),
        };
        if length == 0 || length > MAX_PACKET_LEN {
            return Err(
                SerializationError::stream(SerializationErrorKind::BadLengthPrefix(length)).into(),
            );
        }

        let mut body = vec![0u8; length as usize];
        self.inner.read_exact(&mut body).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SerializationError::stream(SerializationErrorKind::UnexpectedEnd).into()
            } else {
                crate::error::PipelineError::from(e)
            }
        })?;

        #[cfg(feature = "stream-guards")]
        {
            let mut guard = [0u8; 1];
            self.inner
                .read_exact(&mut guard)
                .map_err(|_| SerializationError::stream(SerializationErrorKind::UnexpectedEnd))?;
            if guard[0] != GUARD_POSTAMBLE {
                return Err(SerializationError::stream(
                    SerializationErrorKind::BadGuardByte(guard[0]),
                )
                .into());
            }
        }

        match self.decode_body(&body) {
            Ok(packet) => {
                self.state.commit();
                Ok(Some(packet))
            }
            Err(err) => {
                // The body was consumed whole; rolling back the session state
                // keeps the string table consistent for the next packet.
                self.state.rollback();
                Err(err.into())
            }
        }
    }

    /// Reads the varint length prefix byte-wise; `None` means clean EOF at a
    /// packet boundary.
    fn read_length_prefix(&mut self) -> Result<Option<u64>> {
        let mut result = 0u64;
        for i in 0..9 {
            let mut byte = [0u8; 1];
            match self.inner.read_exact(&mut byte) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if i == 0 {
                        return Ok(None);
                    }
                    return Err(SerializationError::stream(
                        SerializationErrorKind::UnexpectedEnd,
                    )
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
            let b = byte[0];
            if i == 8 {
                return Ok(Some(result | (b as u64) << 56));
            }
            if b & 0x80 == 0 {
                return Ok(Some(result | (b as u64) << (7 * i)));
            }
            result |= ((b & 0x7F) as u64) << (7 * i);
        }
        unreachable!("length prefix loop always returns by the ninth byte")
    }

    fn decode_body(&mut self, body: &[u8]) -> SerializationResult<SerializedPacket> {
        let mut reader = FieldReader::new(body, &mut self.state);
        let token = reader.read_u32()?;

        let (definition, is_new) = if token == 0 {
            return Err(SerializationError::packet(
                SerializationErrorKind::UnknownTypeIndex(token),
            ));
        } else if (token as usize) <= self.definitions.len() {
            (Arc::clone(&self.definitions[token as usize - 1]), false)
        } else if token as usize == self.definitions.len() + 1 {
            (Arc::new(Self::decode_definition(&mut reader)?), true)
        } else {
            return Err(SerializationError::packet(
                SerializationErrorKind::UnknownTypeIndex(token),
            ));
        };

        let mut packet = SerializedPacket::new(Arc::clone(&definition));
        let fields = definition.flattened_fields();
        for (slot, field) in fields.iter().enumerate() {
            let value = reader.read_value(field.field_type)?;
            packet.set_slot(slot, value);
        }

        if is_new {
            self.definitions.push(definition);
        }
        Ok(packet)
    }

    fn decode_definition(reader: &mut FieldReader<'_>) -> SerializationResult<PacketDefinition> {
        let cachable = reader.read_bool()?;
        let depth = reader.read_u32()? as usize;
        let qualified_name = reader.read_string()?.unwrap_or_default();

        let mut chain: Option<PacketDefinition> = None;
        for _ in 0..depth {
            let type_name = reader.read_string()?.unwrap_or_default();
            let version = reader.read_u32()?;
            let field_count = reader.read_u32()? as usize;
            let mut level = PacketDefinition::new(type_name, version);
            if let Some(parent) = chain.take() {
                level = level.with_parent(parent);
            }
            for _ in 0..field_count {
                let name = reader.read_string()?.unwrap_or_default();
                let field_type =
                    crate::packet_definition::FieldType::from_code(reader.read_u32()?)?;
                level.add_field(name, field_type)?;
            }
            chain = Some(level);
        }

        let mut definition = chain.ok_or_else(|| {
            SerializationError::packet(SerializationErrorKind::DefinitionMismatch {
                type_name: qualified_name.clone(),
            })
        })?;
        definition = definition.with_cachable(cachable);
        debug_assert_eq!(definition.type_name(), qualified_name);
        Ok(definition)
    }
}
