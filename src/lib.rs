//! # Telemetry Pipeline
//!
//! An in-process, multi-destination telemetry pipeline with a compact
//! self-describing binary packet format:
//!
//! * **Central sequencing**: every packet gets a monotonic sequence number
//!   and timestamp from one dispatcher thread, so ordering is total across
//!   all destinations
//! * **Per-sink isolation**: each destination runs on its own thread behind
//!   its own bounded queue; a slow or broken sink never stalls the
//!   application or its sibling sinks
//! * **Compact storage**: variable-length integer encoding, string
//!   deduplication, and tick-delta timestamps keep the stream small
//!
//! ## Key Features
//!
//! * Bounded queues with selectable overflow handling (park the caller or
//!   drop and count)
//! * Write-through mode for messages that must be durable before the call
//!   returns, forced globally once the application begins exiting
//! * Self-describing streams: each packet type carries its full field
//!   definition inline on first use, so readers need no shared schema
//! * Fault isolation and self-healing: sink panics are contained and dead
//!   dispatch threads are respawned
//!
//! ## Main Components
//!
//! * [`Publisher`]: the central sequencer and dispatcher (one per session)
//! * [`Messenger`]: the sink contract; [`FileMessenger`] and
//!   [`NetworkMessenger`] are the built-in destinations
//! * [`PacketWriter`] / [`PacketReader`]: the binary stream codec
//! * [`Packet`]: the trait application packet types implement
//!
//! ## Quick Start
//!
//! ```no_run
//! use telemetry_pipeline::{
//!     FileMessenger, FileSinkConfig, LogMessagePacket, MessengerHost, Publisher,
//!     PublisherConfig, Severity,
//! };
//! use std::sync::Arc;
//!
//! let publisher = Publisher::new(PublisherConfig::default());
//!
//! // Attach a rotating file destination.
//! let file_config = FileSinkConfig::default();
//! let sink_config = file_config.sink.clone();
//! let sink = FileMessenger::new(file_config, "my-session");
//! publisher
//!     .register_messenger(MessengerHost::new(Box::new(sink), sink_config))
//!     .unwrap();
//!
//! // Publish a log message.
//! let message = LogMessagePacket::new(Severity::Information, "app", "started");
//! publisher.publish(&[Arc::new(message)], false);
//!
//! // Make sure everything is on disk before exiting.
//! publisher.close();
//! ```

pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod field_reader;
pub mod field_writer;
pub mod file_messenger;
pub mod messenger;
pub mod network_messenger;
pub mod notifier;
pub mod packet;
pub mod packet_cache;
pub mod packet_definition;
pub mod packet_queue;
pub mod packet_stream;
pub mod packets;
pub mod publisher;
pub mod serialized_packet;
pub mod string_list;

pub use config::{
    FileSinkConfig, NetworkSinkConfig, OverflowMode, PublisherConfig, SinkConfig,
};
pub use discovery::{clean_stale, DiscoveryRecord};
pub use error::{PipelineError, Result, SerializationError, SerializationErrorKind};
pub use file_messenger::FileMessenger;
pub use messenger::{
    MaintenanceRequest, Messenger, MessengerContext, MessengerHost, MessengerState,
};
pub use network_messenger::NetworkMessenger;
pub use packet::{CommandPacket, MessengerCommand, Packet, PacketHeader};
pub use packet_definition::{FieldDefinition, FieldType, PacketDefinition};
pub use packet_stream::{PacketReader, PacketWriter};
pub use packets::{
    ApplicationUserPacket, LogMessagePacket, SessionSummaryPacket, Severity, ThreadInfoPacket,
};
pub use publisher::{
    ApplicationUserResolver, PacketFilter, PrincipalResolver, Publisher, PublisherHandle,
};
pub use serialized_packet::{FieldValue, SerializedPacket};
