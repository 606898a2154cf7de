use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What to do with writes that arrive while the primary queue is saturated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowMode {
    /// Park the packet in the overflow queue; the producer blocks until the
    /// packet is admitted to the primary queue.
    #[default]
    OverflowQueueThenBlock,
    /// Discard the packet and count it; the producer never blocks.
    Drop,
}

/// Configuration shared by every per-sink dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Primary queue length above which writes overflow.
    pub max_queue_length: usize,
    pub overflow_mode: OverflowMode,
    /// Forces every write to behave as write-through.
    pub force_synchronous: bool,
    /// Idle interval after which the sink is flushed automatically.
    pub auto_flush_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 2000,
            overflow_mode: OverflowMode::default(),
            force_synchronous: false,
            auto_flush_interval: Duration::from_secs(2),
        }
    }
}

/// Configuration for the rotating file sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSinkConfig {
    pub sink: SinkConfig,
    /// Directory log files are written into; created on initialize.
    pub folder: PathBuf,
    /// Rotate once the active file exceeds this many bytes.
    pub max_file_size: u64,
    /// Rotate once the active file has been open this long.
    pub max_file_duration: Duration,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            folder: PathBuf::from("telemetry"),
            max_file_size: 16 * 1024 * 1024,
            max_file_duration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Configuration for the TCP sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSinkConfig {
    pub sink: SinkConfig,
    /// Remote endpoint, `host:port`.
    pub address: String,
    pub connect_timeout: Duration,
}

impl Default for NetworkSinkConfig {
    fn default() -> Self {
        Self {
            sink: SinkConfig {
                // A slow network must drop rather than stall the host app.
                overflow_mode: OverflowMode::Drop,
                ..SinkConfig::default()
            },
            address: "127.0.0.1:29971".to_owned(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for the central publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Global ingress queue length above which publishes overflow.
    pub max_queue_length: usize,
    pub session_name: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 2000,
            session_name: "session".to_owned(),
        }
    }
}
