use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use telemetry_pipeline::{
    LogMessagePacket, MaintenanceRequest, Messenger, MessengerContext, MessengerHost,
    MessengerState, OverflowMode, Packet, Result, Severity, SinkConfig,
};

/// Shared counters a test sink reports into.
#[derive(Default)]
struct SinkStats {
    writes: AtomicUsize,
    flushes: AtomicUsize,
    maintenance_runs: AtomicUsize,
    closes: AtomicUsize,
    captions: Mutex<Vec<String>>,
}

struct RecordingSink {
    stats: Arc<SinkStats>,
    request_maintenance: bool,
    panic_on_first_write: AtomicBool,
}

impl RecordingSink {
    fn new(stats: Arc<SinkStats>) -> Self {
        Self {
            stats,
            request_maintenance: false,
            panic_on_first_write: AtomicBool::new(false),
        }
    }
}

impl Messenger for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn initialize(&mut self, _context: &MessengerContext, _config: &SinkConfig) -> Result<()> {
        Ok(())
    }

    fn on_write(
        &mut self,
        packet: &Arc<dyn Packet>,
        _write_through: bool,
        maintenance: &mut MaintenanceRequest,
    ) -> Result<()> {
        if self.panic_on_first_write.swap(false, Ordering::SeqCst) {
            panic!("simulated sink failure");
        }
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        self.stats
            .captions
            .lock()
            .unwrap()
            .push(packet.type_name().to_owned());
        if self.request_maintenance {
            *maintenance = MaintenanceRequest::Regular;
        }
        Ok(())
    }

    fn on_flush(&mut self, _maintenance: &mut MaintenanceRequest) -> Result<()> {
        self.stats.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_maintenance(&mut self) -> Result<()> {
        self.stats.maintenance_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Parks inside `on_write` until the test releases it, so the queue can be
/// filled deterministically behind a busy dispatcher.
struct BlockingSink {
    entered: SyncSender<()>,
    release: Receiver<()>,
    writes: Arc<AtomicUsize>,
}

impl Messenger for BlockingSink {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn initialize(&mut self, _context: &MessengerContext, _config: &SinkConfig) -> Result<()> {
        Ok(())
    }

    fn on_write(
        &mut self,
        _packet: &Arc<dyn Packet>,
        _write_through: bool,
        _maintenance: &mut MaintenanceRequest,
    ) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered.try_send(());
        let _ = self.release.recv();
        Ok(())
    }
}

fn message(caption: &str) -> Arc<dyn Packet> {
    Arc::new(LogMessagePacket::new(Severity::Information, "test", caption))
}

#[test]
fn test_writes_reach_the_sink() {
    let stats = Arc::new(SinkStats::default());
    let host = MessengerHost::new(
        Box::new(RecordingSink::new(Arc::clone(&stats))),
        SinkConfig::default(),
    );
    host.initialize(&MessengerContext::new()).unwrap();

    for i in 0..3 {
        host.write(message(&format!("msg-{i}")), false);
    }
    host.flush();

    assert_eq!(stats.writes.load(Ordering::SeqCst), 3);
    assert!(stats.flushes.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_write_through_is_synchronous() {
    let stats = Arc::new(SinkStats::default());
    let host = MessengerHost::new(
        Box::new(RecordingSink::new(Arc::clone(&stats))),
        SinkConfig::default(),
    );
    host.initialize(&MessengerContext::new()).unwrap();

    host.write(message("durable"), true);
    // The call may not return before the sink has seen the packet.
    assert_eq!(stats.writes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_overflow_counts_exactly() {
    let (entered_tx, entered_rx) = mpsc::sync_channel(1);
    let (release_tx, release_rx) = mpsc::channel();
    let writes = Arc::new(AtomicUsize::new(0));
    let config = SinkConfig {
        max_queue_length: 4,
        overflow_mode: OverflowMode::Drop,
        ..SinkConfig::default()
    };
    let host = MessengerHost::new(
        Box::new(BlockingSink {
            entered: entered_tx,
            release: release_rx,
            writes: Arc::clone(&writes),
        }),
        config,
    );
    host.initialize(&MessengerContext::new()).unwrap();

    // Occupy the dispatcher, then fill the queue to its cap.
    host.write(message("busy"), false);
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("dispatcher should pick up the first packet");
    for i in 0..4 {
        host.write(message(&format!("fill-{i}")), false);
    }
    assert_eq!(host.dropped_count(), 0, "under the cap nothing drops");

    // Everything past the cap is discarded and counted, never blocked.
    for i in 0..3 {
        host.write(message(&format!("extra-{i}")), false);
    }
    assert_eq!(host.dropped_count(), 3);

    // Release the dispatcher for every queued packet and drain.
    for _ in 0..5 {
        let _ = release_tx.send(());
    }
    host.close();
    assert_eq!(writes.load(Ordering::SeqCst), 5, "cap plus the in-flight packet");
}

#[test]
fn test_header_writes_bypass_overflow_cap() {
    let (entered_tx, entered_rx) = mpsc::sync_channel(1);
    let (release_tx, release_rx) = mpsc::channel();
    let writes = Arc::new(AtomicUsize::new(0));
    let config = SinkConfig {
        max_queue_length: 4,
        overflow_mode: OverflowMode::Drop,
        ..SinkConfig::default()
    };
    let host = MessengerHost::new(
        Box::new(BlockingSink {
            entered: entered_tx,
            release: release_rx,
            writes: Arc::clone(&writes),
        }),
        config,
    );
    host.initialize(&MessengerContext::new()).unwrap();

    // Occupy the dispatcher, then fill the queue to its cap.
    host.write(message("busy"), false);
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("dispatcher should pick up the first packet");
    for i in 0..4 {
        host.write(message(&format!("fill-{i}")), false);
    }

    // A plain write past the cap drops; a header write must land anyway,
    // since a lost header would corrupt every stream opened afterwards.
    host.write(message("discarded"), false);
    host.write_header(message("session-header"), false);
    assert_eq!(host.dropped_count(), 1, "only the plain write drops");

    for _ in 0..6 {
        let _ = release_tx.send(());
    }
    host.close();
    assert_eq!(
        writes.load(Ordering::SeqCst),
        6,
        "in-flight, four queued, and the header"
    );
}

#[test]
fn test_panicking_sink_does_not_hang_writers() {
    let stats = Arc::new(SinkStats::default());
    let sink = RecordingSink::new(Arc::clone(&stats));
    sink.panic_on_first_write.store(true, Ordering::SeqCst);
    let host = MessengerHost::new(Box::new(sink), SinkConfig::default());
    host.initialize(&MessengerContext::new()).unwrap();

    // A synchronous write into a panicking hook must still return.
    host.write(message("boom"), true);
    host.write(message("after"), true);

    assert_eq!(stats.writes.load(Ordering::SeqCst), 1, "only the second write lands");
    host.close();
}

#[test]
fn test_maintenance_requested_by_writes() {
    let stats = Arc::new(SinkStats::default());
    let mut sink = RecordingSink::new(Arc::clone(&stats));
    sink.request_maintenance = true;
    let host = MessengerHost::new(Box::new(sink), SinkConfig::default());
    host.initialize(&MessengerContext::new()).unwrap();

    host.write(message("rotate-me"), true);
    assert!(stats.maintenance_runs.load(Ordering::SeqCst) >= 1);
    host.close();
}

#[test]
fn test_close_is_terminal() {
    let stats = Arc::new(SinkStats::default());
    let host = MessengerHost::new(
        Box::new(RecordingSink::new(Arc::clone(&stats))),
        SinkConfig::default(),
    );
    host.initialize(&MessengerContext::new()).unwrap();

    host.write(message("last"), false);
    host.close();
    assert_eq!(host.state(), MessengerState::Closed);
    assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    let written = stats.writes.load(Ordering::SeqCst);

    // Writes after close complete immediately without reaching the sink.
    host.write(message("ignored"), true);
    assert_eq!(stats.writes.load(Ordering::SeqCst), written);
}

#[test]
fn test_write_before_initialize_completes_unwritten() {
    let stats = Arc::new(SinkStats::default());
    let host = MessengerHost::new(
        Box::new(RecordingSink::new(Arc::clone(&stats))),
        SinkConfig::default(),
    );

    // Must not block or panic; the packet is simply released.
    host.write(message("early"), true);
    assert_eq!(stats.writes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_force_synchronous_configuration() {
    let stats = Arc::new(SinkStats::default());
    let config = SinkConfig {
        force_synchronous: true,
        ..SinkConfig::default()
    };
    let host = MessengerHost::new(
        Box::new(RecordingSink::new(Arc::clone(&stats))),
        config,
    );
    host.initialize(&MessengerContext::new()).unwrap();

    // Even a plain write behaves as write-through.
    host.write(message("sync"), false);
    assert_eq!(stats.writes.load(Ordering::SeqCst), 1);
}
