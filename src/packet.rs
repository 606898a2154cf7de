use crate::error::SerializationResult;
use crate::packet_definition::{FieldType, PacketDefinition};
use crate::serialized_packet::{FieldValue, SerializedPacket};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A unit of data or control flowing through the pipeline.
///
/// Every packet type supplies its own static field-descriptor table through
/// `definition()` and fills a [`SerializedPacket`] in `write_fields`; there is
/// no runtime reflection anywhere in the serialization path. Packets are
/// shared across threads behind `Arc`, so the mutable bookkeeping the
/// dispatcher stamps onto them (sequence, timestamp, principal) lives in the
/// interior-mutable [`PacketHeader`] each packet embeds.
pub trait Packet: Send + Sync + fmt::Debug {
    /// Qualified type name; the stream-level definition cache key.
    fn type_name(&self) -> &'static str;

    /// Schema version of this packet type's field layout.
    fn version(&self) -> u32;

    /// The packet's field table, one definition level per inheritance layer.
    fn definition(&self) -> PacketDefinition;

    /// Copies this packet's values into `record` in definition order.
    fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()>;

    /// The dispatcher-stamped bookkeeping shared by all packet types.
    fn header(&self) -> &PacketHeader;

    /// Packets that must be sequenced and written before this one. One level
    /// only; the dispatcher recurses to handle deeper chains.
    fn required_packets(&self) -> Vec<Arc<dyn Packet>> {
        Vec::new()
    }

    /// `Some` marks a cached packet: invariant content, deduplicated by this
    /// id, appearing exactly once per stream.
    fn cache_id(&self) -> Option<Uuid> {
        None
    }

    /// Whether the publisher should resolve and attach the current security
    /// principal before dispatch.
    fn wants_principal(&self) -> bool {
        false
    }

    /// Command packets are control flow, not data; they bypass sequencing.
    fn command(&self) -> Option<MessengerCommand> {
        None
    }
}

/// Dispatcher bookkeeping embedded in every packet.
///
/// `sequence` uses 0 as the "not yet stamped" sentinel and is assigned
/// exactly once by the publisher dispatch thread; first writer wins. The
/// timestamp is likewise set only if still unset, so a caller-supplied
/// timestamp survives dispatch.
#[derive(Debug, Default)]
pub struct PacketHeader {
    sequence: AtomicI64,
    timestamp: Mutex<Option<DateTime<Utc>>>,
    principal: Mutex<Option<String>>,
}

impl PacketHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Stamps the sequence if unstamped; returns whether this call won.
    pub fn stamp_sequence(&self, sequence: i64) -> bool {
        self.sequence
            .compare_exchange(0, sequence, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        *self.timestamp.lock()
    }

    /// Sets the timestamp only if it has not been set yet.
    pub fn stamp_timestamp(&self, timestamp: DateTime<Utc>) {
        let mut slot = self.timestamp.lock();
        if slot.is_none() {
            *slot = Some(timestamp);
        }
    }

    pub fn principal(&self) -> Option<String> {
        self.principal.lock().clone()
    }

    pub fn set_principal(&self, principal: String) {
        *self.principal.lock() = Some(principal);
    }

    /// Writes the header-contributed fields; every packet's root definition
    /// level carries these.
    pub fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()> {
        record.set("sequence", FieldValue::Int64(self.sequence()))?;
        record.set(
            "timestamp",
            FieldValue::DateTime(self.timestamp().unwrap_or_else(default_epoch)),
        )?;
        Ok(())
    }

    /// The root definition level shared by every packet type.
    pub fn base_definition() -> PacketDefinition {
        let mut def = PacketDefinition::new("PacketBase", 1);
        // Cannot fail: names are statically unique.
        let _ = def.add_field("sequence", FieldType::Int64);
        let _ = def.add_field("timestamp", FieldType::DateTime);
        def
    }
}

fn default_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Wire-level control vocabulary. The integer codes are part of the stream
/// and inter-process protocol and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessengerCommand {
    None = 0,
    Flush = 1,
    CloseFile = 2,
    ExitMode = 3,
    CloseMessenger = 4,
    ShowLiveView = 5,
    OpenRemoteViewer = 6,
}

impl MessengerCommand {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use MessengerCommand::*;
        Some(match code {
            0 => None,
            1 => Flush,
            2 => CloseFile,
            3 => ExitMode,
            4 => CloseMessenger,
            5 => ShowLiveView,
            6 => OpenRemoteViewer,
            _ => return Option::None,
        })
    }
}

/// A control-signal packet.
#[derive(Debug)]
pub struct CommandPacket {
    header: PacketHeader,
    command: MessengerCommand,
}

impl CommandPacket {
    pub fn new(command: MessengerCommand) -> Self {
        Self {
            header: PacketHeader::new(),
            command,
        }
    }

    pub fn arc(command: MessengerCommand) -> Arc<dyn Packet> {
        Arc::new(Self::new(command))
    }
}

impl Packet for CommandPacket {
    fn type_name(&self) -> &'static str {
        "CommandPacket"
    }

    fn version(&self) -> u32 {
        1
    }

    fn definition(&self) -> PacketDefinition {
        let mut def =
            PacketDefinition::new(self.type_name(), self.version()).with_parent(PacketHeader::base_definition());
        let _ = def.add_field("command", FieldType::UInt32);
        def
    }

    fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()> {
        self.header.write_fields(record)?;
        record.set("command", FieldValue::UInt32(self.command.code()))
    }

    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn command(&self) -> Option<MessengerCommand> {
        Some(self.command)
    }
}
