use crate::config::{NetworkSinkConfig, SinkConfig};
use crate::error::{PipelineError, Result};
use crate::messenger::{MaintenanceRequest, Messenger, MessengerContext};
use crate::packet::Packet;
use crate::packet_stream::PacketWriter;
use crate::serialized_packet::SerializedPacket;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// TCP sink: streams packets to a live viewer or relay.
///
/// The connection is lazy: nothing is opened until the first packet arrives,
/// and a failed write drops the connection so the next write retries from
/// scratch (one connect attempt per write, never a blocking retry loop; a
/// remote viewer that is down must not slow the pipeline). Each new
/// connection is a fresh stream, re-primed with the header packets.
pub struct NetworkMessenger {
    config: NetworkSinkConfig,
    context: Option<MessengerContext>,
    writer: Option<PacketWriter<TcpStream>>,
    connect_failures: u64,
    write_failures: u64,
}

impl NetworkMessenger {
    pub fn new(config: NetworkSinkConfig) -> Self {
        Self {
            config,
            context: None,
            writer: None,
            connect_failures: 0,
            write_failures: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    fn connect(&mut self) -> Result<()> {
        let address = self
            .config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                PipelineError::Config(format!("unresolvable address {}", self.config.address))
            })?;
        let stream = TcpStream::connect_timeout(&address, self.config.connect_timeout)?;
        stream.set_nodelay(true)?;
        info!(address = %self.config.address, "connected to remote viewer");
        let mut writer = PacketWriter::new(stream);

        if let Some(context) = self.context.clone() {
            for header in context.snapshot_headers() {
                write_packet(&mut writer, &header)?;
            }
        }
        self.writer = Some(writer);
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        self.connect().map_err(|e| {
            self.connect_failures += 1;
            debug!(error = %e, failures = self.connect_failures, "connect failed");
            e
        })
    }
}

fn write_packet(writer: &mut PacketWriter<TcpStream>, packet: &Arc<dyn Packet>) -> Result<()> {
    let mut record = SerializedPacket::new(Arc::new(packet.definition()));
    packet.write_fields(&mut record)?;
    writer.write(&record)?;
    Ok(())
}

impl Messenger for NetworkMessenger {
    fn name(&self) -> &'static str {
        "network"
    }

    fn initialize(&mut self, context: &MessengerContext, _config: &SinkConfig) -> Result<()> {
        // Deliberately no connect here: the destination may not exist yet,
        // and the sink must start regardless.
        self.context = Some(context.clone());
        Ok(())
    }

    fn on_write(
        &mut self,
        packet: &Arc<dyn Packet>,
        _write_through: bool,
        _maintenance: &mut MaintenanceRequest,
    ) -> Result<()> {
        self.ensure_connected()?;
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = write_packet(writer, packet) {
                self.write_failures += 1;
                self.writer = None;
                warn!(error = %e, "write to remote viewer failed; connection dropped");
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_flush(&mut self, _maintenance: &mut MaintenanceRequest) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                self.write_failures += 1;
                self.writer = None;
                warn!(error = %e, "flush to remote viewer failed; connection dropped");
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                debug!(error = %e, "final flush to remote viewer failed");
            }
        }
    }
}
