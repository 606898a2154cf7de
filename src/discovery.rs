use crate::error::{PipelineError, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// File extension for discovery records.
pub const DISCOVERY_EXTENSION: &str = "gpd";

/// Record length on disk: three little-endian i32s.
const RECORD_LEN: usize = 12;

/// Timeout for the liveness connect probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// A discovery record advertising a running publisher.
///
/// Each process writes one fixed-size file named after its process id into a
/// shared directory; local viewers scan that directory to find sessions they
/// can attach to. The record is deliberately tiny and fixed-length so a
/// half-written file is detectable by size alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub process_id: i32,
    pub publisher_port: i32,
    pub subscriber_port: i32,
}

impl DiscoveryRecord {
    pub fn new(process_id: i32, publisher_port: i32, subscriber_port: i32) -> Self {
        Self {
            process_id,
            publisher_port,
            subscriber_port,
        }
    }

    /// Record for the current process.
    pub fn for_current_process(publisher_port: i32, subscriber_port: i32) -> Self {
        Self::new(std::process::id() as i32, publisher_port, subscriber_port)
    }

    /// The path this record lives at under `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.{}", self.process_id, DISCOVERY_EXTENSION))
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&self.process_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.publisher_port.to_le_bytes());
        buf[8..12].copy_from_slice(&self.subscriber_port.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_LEN {
            return Err(PipelineError::BadDiscoveryRecord(format!(
                "expected {RECORD_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[0..4]);
        let process_id = i32::from_le_bytes(word);
        word.copy_from_slice(&buf[4..8]);
        let publisher_port = i32::from_le_bytes(word);
        word.copy_from_slice(&buf[8..12]);
        let subscriber_port = i32::from_le_bytes(word);
        Ok(Self::new(process_id, publisher_port, subscriber_port))
    }

    /// Writes the record into `dir`, creating the directory if needed.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = self.path_in(dir);
        let mut file = File::create(&path)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        info!(path = %path.display(), "wrote discovery record");
        Ok(path)
    }

    /// Reads a record back, enforcing the exact on-disk length.
    pub fn read_from(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; RECORD_LEN];
        file.read_exact(&mut buf)?;
        // Exactly twelve bytes; trailing data means the file is not ours.
        let mut extra = [0u8; 1];
        if file.read(&mut extra)? != 0 {
            return Err(PipelineError::BadDiscoveryRecord(
                "record longer than expected".to_owned(),
            ));
        }
        Self::decode(&buf)
    }

    /// Whether the advertised publisher is actually there: the process must
    /// exist and its publisher port must accept a connection. Either check
    /// alone lies: pids get recycled and ports get reused.
    pub fn is_alive(&self) -> bool {
        process_exists(self.process_id) && self.port_accepts()
    }

    fn port_accepts(&self) -> bool {
        if self.publisher_port <= 0 || self.publisher_port > u16::MAX as i32 {
            return false;
        }
        let addr = SocketAddr::from(([127, 0, 0, 1], self.publisher_port as u16));
        TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
    }
}

#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_exists(pid: i32) -> bool {
    // No portable cheap check; fall back to the port probe alone.
    pid > 0
}

/// Removes every discovery record in `dir` whose publisher is gone and
/// returns how many were removed. Unreadable or wrongly-sized files count as
/// stale too.
pub fn clean_stale(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DISCOVERY_EXTENSION) {
            continue;
        }
        let stale = match DiscoveryRecord::read_from(&path) {
            Ok(record) => !record.is_alive(),
            Err(_) => true,
        };
        if stale && fs::remove_file(&path).is_ok() {
            debug!(path = %path.display(), "removed stale discovery record");
            removed += 1;
        }
    }
    Ok(removed)
}
