use std::io;
use thiserror::Error;

/// Errors produced while encoding or decoding the binary packet stream.
///
/// `stream_failed` distinguishes two very different situations: a single
/// packet that cannot be decoded (the reader can skip to the next length
/// boundary and continue) versus a framing-level failure after which no
/// further byte of the stream can be trusted and reading must stop.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SerializationError {
    pub kind: SerializationErrorKind,
    pub stream_failed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerializationErrorKind {
    #[error("unexpected end of stream")]
    UnexpectedEnd,

    #[error("invalid packet length prefix: {0}")]
    BadLengthPrefix(u64),

    #[error("unknown field type code {0}")]
    UnknownFieldType(u32),

    #[error("unknown string index {0}")]
    UnknownStringIndex(u32),

    #[error("unknown packet type index {0}")]
    UnknownTypeIndex(u32),

    #[error("packet definition for '{type_name}' does not match the definition already in the stream")]
    DefinitionMismatch { type_name: String },

    #[error("duplicate field name '{0}' in packet definition")]
    DuplicateField(String),

    #[error("field '{field}' of type {expected} cannot accept a {actual} value")]
    IncompatibleField {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("no field named '{0}' in packet definition")]
    NoSuchField(String),

    #[error("field '{0}' was never assigned a value")]
    MissingField(String),

    #[error("invalid UTF-8 in encoded string")]
    InvalidUtf8,

    #[error("malformed variable-length integer")]
    InvalidVarint,

    #[error("invalid guard byte 0x{0:02x}")]
    BadGuardByte(u8),

    #[error("invalid date-time encoding marker {0}")]
    BadDateTimeMarker(u32),

    #[error("timestamp out of representable range")]
    TimestampOutOfRange,
}

impl SerializationError {
    /// An error scoped to the current packet; the stream remains readable.
    pub fn packet(kind: SerializationErrorKind) -> Self {
        Self {
            kind,
            stream_failed: false,
        }
    }

    /// A framing-level error; the stream is no longer trustworthy.
    pub fn stream(kind: SerializationErrorKind) -> Self {
        Self {
            kind,
            stream_failed: true,
        }
    }
}

/// Top-level error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("sink '{name}' failed: {reason}")]
    SinkFailed { name: &'static str, reason: String },

    #[error("sink '{0}' is not initialized")]
    NotInitialized(&'static str),

    #[error("the pipeline has been closed")]
    Closed,

    #[error("discovery record is malformed: {0}")]
    BadDiscoveryRecord(String),

    #[error("{0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result alias for codec-level operations.
pub type SerializationResult<T> = std::result::Result<T, SerializationError>;
