use crate::config::{FileSinkConfig, SinkConfig};
use crate::error::{PipelineError, Result};
use crate::messenger::{MaintenanceRequest, Messenger, MessengerContext};
use crate::packet::{MessengerCommand, Packet};
use crate::packet_stream::PacketWriter;
use crate::serialized_packet::SerializedPacket;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Write adaptor that tracks how many bytes have passed through, so rotation
/// thresholds can be checked without stat-ing the file on every packet.
struct CountingWriter<W: Write> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// File sink: writes the packet stream to numbered files in a session
/// folder, rotating through maintenance mode when the active file passes the
/// configured size or age threshold.
///
/// Each rotated-in file is a complete, independently readable stream: it is
/// re-primed with the pipeline's header packets, and its codec state (string
/// table, reference timestamp) starts fresh.
pub struct FileMessenger {
    config: FileSinkConfig,
    session_name: String,
    context: Option<MessengerContext>,
    writer: Option<PacketWriter<CountingWriter<BufWriter<File>>>>,
    bytes_written: Arc<AtomicU64>,
    file_opened_at: Instant,
    file_index: u32,
    current_path: Option<PathBuf>,
}

impl FileMessenger {
    pub fn new(config: FileSinkConfig, session_name: impl Into<String>) -> Self {
        Self {
            config,
            session_name: session_name.into(),
            context: None,
            writer: None,
            bytes_written: Arc::new(AtomicU64::new(0)),
            file_opened_at: Instant::now(),
            file_index: 0,
            current_path: None,
        }
    }

    /// The file currently being written, if one is open.
    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current_path.as_ref()
    }

    fn file_path(&self, index: u32) -> PathBuf {
        self.config
            .folder
            .join(format!("{}-{}.glf", self.session_name, index))
    }

    fn open_next_file(&mut self) -> Result<()> {
        self.file_index += 1;
        let path = self.file_path(self.file_index);
        let file = File::create(&path)?;
        self.bytes_written.store(0, Ordering::Relaxed);
        let counting = CountingWriter {
            inner: BufWriter::new(file),
            written: Arc::clone(&self.bytes_written),
        };
        self.writer = Some(PacketWriter::new(counting));
        self.file_opened_at = Instant::now();
        self.current_path = Some(path.clone());
        info!(path = %path.display(), "opened telemetry file");

        // A fresh file means a fresh stream; it must carry the cached header
        // packets before anything else.
        if let Some(context) = self.context.clone() {
            for header in context.snapshot_headers() {
                if let Err(e) = self.encode(&header) {
                    warn!(error = %e, "failed to prime new file with header packet");
                }
            }
        }
        Ok(())
    }

    fn close_current_file(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "flush on close failed");
            }
        }
        self.current_path = None;
    }

    fn encode(&mut self, packet: &Arc<dyn Packet>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(PipelineError::NotInitialized("file"))?;
        let mut record = SerializedPacket::new(Arc::new(packet.definition()));
        packet.write_fields(&mut record)?;
        writer.write(&record)?;
        Ok(())
    }

    fn rotation_due(&self) -> bool {
        self.bytes_written.load(Ordering::Relaxed) >= self.config.max_file_size
            || self.file_opened_at.elapsed() >= self.config.max_file_duration
    }
}

impl Messenger for FileMessenger {
    fn name(&self) -> &'static str {
        "file"
    }

    fn initialize(&mut self, context: &MessengerContext, _config: &SinkConfig) -> Result<()> {
        fs::create_dir_all(&self.config.folder)?;
        self.context = Some(context.clone());
        self.open_next_file()
    }

    fn on_write(
        &mut self,
        packet: &Arc<dyn Packet>,
        write_through: bool,
        maintenance: &mut MaintenanceRequest,
    ) -> Result<()> {
        self.encode(packet)?;
        if write_through {
            if let Some(writer) = self.writer.as_mut() {
                writer.flush()?;
            }
        }
        if self.rotation_due() {
            *maintenance = (*maintenance).max(MaintenanceRequest::Regular);
        }
        Ok(())
    }

    fn on_flush(&mut self, maintenance: &mut MaintenanceRequest) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        if self.rotation_due() {
            *maintenance = (*maintenance).max(MaintenanceRequest::Regular);
        }
        Ok(())
    }

    fn on_maintenance(&mut self) -> Result<()> {
        debug!(index = self.file_index, "rotating telemetry file");
        self.close_current_file();
        self.open_next_file()
    }

    fn on_command(&mut self, command: MessengerCommand) {
        if command == MessengerCommand::CloseFile {
            // The host turns this into an Explicit maintenance run.
            debug!("close-file command received");
        }
    }

    fn on_exit(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "flush on exit failed");
            }
        }
    }

    fn on_close(&mut self) {
        self.close_current_file();
    }
}
