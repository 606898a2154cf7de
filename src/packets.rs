//! Concrete data packets carried by the pipeline.
//!
//! Each type supplies its static field table (no reflection) and declares its
//! dependency packets; the publisher stamps sequence numbers depth-first so a
//! dependency always sequences below its dependents.

use crate::error::SerializationResult;
use crate::packet::{Packet, PacketHeader};
use crate::packet_definition::{FieldType, PacketDefinition};
use crate::serialized_packet::{FieldValue, SerializedPacket};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Log message severity, ordered most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Severity {
    Critical = 1,
    Error = 2,
    Warning = 4,
    Information = 8,
    Verbose = 16,
}

/// Describes one application thread; written once per thread per stream.
#[derive(Debug)]
pub struct ThreadInfoPacket {
    header: PacketHeader,
    id: Uuid,
    pub thread_id: u64,
    pub thread_name: Option<String>,
    pub is_background: bool,
}

impl ThreadInfoPacket {
    pub fn new(thread_id: u64, thread_name: Option<String>, is_background: bool) -> Self {
        Self {
            header: PacketHeader::new(),
            id: Uuid::new_v4(),
            thread_id,
            thread_name,
            is_background,
        }
    }

    /// Captures the calling thread.
    pub fn for_current_thread() -> Self {
        let current = std::thread::current();
        // Thread ids are opaque; hash the debug form into a stable number.
        let thread_id = {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            current.id().hash(&mut hasher);
            hasher.finish()
        };
        Self::new(thread_id, current.name().map(str::to_owned), false)
    }
}

impl Packet for ThreadInfoPacket {
    fn type_name(&self) -> &'static str {
        "ThreadInfoPacket"
    }

    fn version(&self) -> u32 {
        1
    }

    fn definition(&self) -> PacketDefinition {
        let mut def = PacketDefinition::new(self.type_name(), self.version())
            .with_parent(PacketHeader::base_definition())
            .with_cachable(true);
        let _ = def.add_field("id", FieldType::Guid);
        let _ = def.add_field("thread_id", FieldType::UInt64);
        let _ = def.add_field("thread_name", FieldType::String);
        let _ = def.add_field("is_background", FieldType::Bool);
        def
    }

    fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()> {
        self.header.write_fields(record)?;
        record.set("id", FieldValue::Guid(self.id))?;
        record.set("thread_id", FieldValue::UInt64(self.thread_id))?;
        record.set("thread_name", FieldValue::String(self.thread_name.clone()))?;
        record.set("is_background", FieldValue::Bool(self.is_background))
    }

    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn cache_id(&self) -> Option<Uuid> {
        Some(self.id)
    }
}

/// Identifies the application user a packet was produced under; derived from
/// the resolved principal, written once per distinct user.
#[derive(Debug)]
pub struct ApplicationUserPacket {
    header: PacketHeader,
    id: Uuid,
    pub user_name: String,
    pub caption: Option<String>,
}

impl ApplicationUserPacket {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            header: PacketHeader::new(),
            id: Uuid::new_v4(),
            user_name: user_name.into(),
            caption: None,
        }
    }
}

impl Packet for ApplicationUserPacket {
    fn type_name(&self) -> &'static str {
        "ApplicationUserPacket"
    }

    fn version(&self) -> u32 {
        1
    }

    fn definition(&self) -> PacketDefinition {
        let mut def = PacketDefinition::new(self.type_name(), self.version())
            .with_parent(PacketHeader::base_definition())
            .with_cachable(true);
        let _ = def.add_field("id", FieldType::Guid);
        let _ = def.add_field("user_name", FieldType::String);
        let _ = def.add_field("caption", FieldType::String);
        def
    }

    fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()> {
        self.header.write_fields(record)?;
        record.set("id", FieldValue::Guid(self.id))?;
        record.set("user_name", FieldValue::String(Some(self.user_name.clone())))?;
        record.set("caption", FieldValue::String(self.caption.clone()))
    }

    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn cache_id(&self) -> Option<Uuid> {
        Some(self.id)
    }
}

/// One log event. Requires its thread-info packet, so readers can always
/// resolve the originating thread no matter where a stream is cut.
#[derive(Debug)]
pub struct LogMessagePacket {
    header: PacketHeader,
    pub severity: Severity,
    pub category: String,
    pub caption: String,
    pub description: Option<String>,
    /// Outermost-first rendered exception chain, empty when none.
    pub exception_chain: Vec<String>,
    thread_info: Mutex<Option<Arc<ThreadInfoPacket>>>,
}

impl LogMessagePacket {
    pub fn new(severity: Severity, category: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            header: PacketHeader::new(),
            severity,
            category: category.into(),
            caption: caption.into(),
            description: None,
            exception_chain: Vec::new(),
            thread_info: Mutex::new(None),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_exception_chain(mut self, chain: Vec<String>) -> Self {
        self.exception_chain = chain;
        self
    }

    /// Attaches the thread-info dependency this message was produced on.
    pub fn set_thread_info(&self, thread_info: Arc<ThreadInfoPacket>) {
        *self.thread_info.lock() = Some(thread_info);
    }

    pub fn thread_info(&self) -> Option<Arc<ThreadInfoPacket>> {
        self.thread_info.lock().clone()
    }
}

impl Packet for LogMessagePacket {
    fn type_name(&self) -> &'static str {
        "LogMessagePacket"
    }

    fn version(&self) -> u32 {
        1
    }

    fn definition(&self) -> PacketDefinition {
        let mut def = PacketDefinition::new(self.type_name(), self.version())
            .with_parent(PacketHeader::base_definition());
        let _ = def.add_field("severity", FieldType::Int32);
        let _ = def.add_field("category", FieldType::String);
        let _ = def.add_field("caption", FieldType::String);
        let _ = def.add_field("description", FieldType::String);
        let _ = def.add_field("exception_chain", FieldType::StringArray);
        let _ = def.add_field("thread_id", FieldType::UInt64);
        def
    }

    fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()> {
        self.header.write_fields(record)?;
        record.set("severity", FieldValue::Int32(self.severity as i32))?;
        record.set("category", FieldValue::String(Some(self.category.clone())))?;
        record.set("caption", FieldValue::String(Some(self.caption.clone())))?;
        record.set("description", FieldValue::String(self.description.clone()))?;
        record.set(
            "exception_chain",
            FieldValue::StringArray(self.exception_chain.clone()),
        )?;
        let thread_id = self.thread_info().map(|t| t.thread_id).unwrap_or(0);
        record.set("thread_id", FieldValue::UInt64(thread_id))
    }

    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn required_packets(&self) -> Vec<Arc<dyn Packet>> {
        match self.thread_info() {
            Some(info) => vec![info as Arc<dyn Packet>],
            None => Vec::new(),
        }
    }

    fn wants_principal(&self) -> bool {
        true
    }
}

/// Summarizes one capture session; cached so it serializes exactly once.
#[derive(Debug)]
pub struct SessionSummaryPacket {
    header: PacketHeader,
    pub session_id: Uuid,
    pub application: String,
    pub environment: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl SessionSummaryPacket {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            header: PacketHeader::new(),
            session_id: Uuid::new_v4(),
            application: application.into(),
            environment: None,
            started_at: chrono::Utc::now(),
        }
    }
}

impl Packet for SessionSummaryPacket {
    fn type_name(&self) -> &'static str {
        "SessionSummaryPacket"
    }

    fn version(&self) -> u32 {
        1
    }

    fn definition(&self) -> PacketDefinition {
        let mut def = PacketDefinition::new(self.type_name(), self.version())
            .with_parent(PacketHeader::base_definition())
            .with_cachable(true);
        let _ = def.add_field("session_id", FieldType::Guid);
        let _ = def.add_field("application", FieldType::String);
        let _ = def.add_field("environment", FieldType::String);
        let _ = def.add_field("started_at", FieldType::DateTime);
        def
    }

    fn write_fields(&self, record: &mut SerializedPacket) -> SerializationResult<()> {
        self.header.write_fields(record)?;
        record.set("session_id", FieldValue::Guid(self.session_id))?;
        record.set(
            "application",
            FieldValue::String(Some(self.application.clone())),
        )?;
        record.set("environment", FieldValue::String(self.environment.clone()))?;
        record.set("started_at", FieldValue::DateTime(self.started_at))
    }

    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn cache_id(&self) -> Option<Uuid> {
        Some(self.session_id)
    }
}
