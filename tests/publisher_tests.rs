use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use telemetry_pipeline::{
    LogMessagePacket, MaintenanceRequest, Messenger, MessengerContext, MessengerHost, Packet,
    Publisher, PublisherConfig, Result, Severity, SinkConfig, ThreadInfoPacket,
};

/// Sink that records (type name, sequence) for every packet it is handed.
struct RecordingSink {
    seen: Arc<Mutex<Vec<(String, i64)>>>,
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
        _maintenance: &mut MaintenanceRequest,
    ) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((packet.type_name().to_owned(), packet.header().sequence()));
        Ok(())
    }
}

fn recording_publisher() -> (Publisher, Arc<Mutex<Vec<(String, i64)>>>) {
    let publisher = Publisher::new(PublisherConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    publisher
        .register_messenger(MessengerHost::new(
            Box::new(RecordingSink {
                seen: Arc::clone(&seen),
            }),
            SinkConfig::default(),
        ))
        .unwrap();
    (publisher, seen)
}

fn message(caption: &str) -> Arc<dyn Packet> {
    Arc::new(LogMessagePacket::new(Severity::Information, "test", caption))
}

#[test]
fn test_sequence_numbers_are_monotonic() {
    let (publisher, seen) = recording_publisher();
    for i in 0..20 {
        publisher.publish(&[message(&format!("m{i}"))], false);
    }
    publisher.flush();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    for pair in seen.windows(2) {
        assert!(
            pair[0].1 < pair[1].1,
            "sequence must strictly increase: {} then {}",
            pair[0].1,
            pair[1].1
        );
    }
    publisher.close();
}

#[test]
fn test_dependency_sequenced_before_dependent() {
    let (publisher, seen) = recording_publisher();

    let thread_info = Arc::new(ThreadInfoPacket::for_current_thread());
    let message = LogMessagePacket::new(Severity::Warning, "test", "with-dependency");
    message.set_thread_info(Arc::clone(&thread_info));
    publisher.publish(&[Arc::new(message)], true);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "ThreadInfoPacket");
    assert_eq!(seen[1].0, "LogMessagePacket");
    assert!(
        seen[0].1 < seen[1].1,
        "the dependency must carry the lower sequence"
    );
    publisher.close();
}

#[test]
fn test_cached_dependency_written_once() {
    let (publisher, seen) = recording_publisher();

    let thread_info = Arc::new(ThreadInfoPacket::for_current_thread());
    for i in 0..3 {
        let message = LogMessagePacket::new(Severity::Verbose, "test", format!("m{i}"));
        message.set_thread_info(Arc::clone(&thread_info));
        publisher.publish(&[Arc::new(message)], false);
    }
    publisher.flush();

    let seen = seen.lock().unwrap();
    let thread_packets = seen.iter().filter(|(n, _)| n == "ThreadInfoPacket").count();
    let messages = seen.iter().filter(|(n, _)| n == "LogMessagePacket").count();
    assert_eq!(thread_packets, 1, "cached packet appears exactly once");
    assert_eq!(messages, 3);
    publisher.close();
}

#[test]
fn test_write_through_commits_before_returning() {
    let (publisher, seen) = recording_publisher();
    publisher.publish(&[message("durable")], true);
    assert_eq!(seen.lock().unwrap().len(), 1);
    publisher.close();
}

#[test]
fn test_filter_cancels_without_hanging() {
    let (publisher, seen) = recording_publisher();
    publisher.add_filter(|packet: &Arc<dyn Packet>| packet.type_name() != "LogMessagePacket");

    // Even a synchronous publish of a cancelled packet must return.
    publisher.publish(&[message("cancelled")], true);
    publisher.flush();
    assert!(
        seen.lock().unwrap().is_empty(),
        "cancelled packets never reach a sink"
    );
    publisher.close();
}

#[test]
fn test_close_releases_publishers() {
    let (publisher, seen) = recording_publisher();
    publisher.publish(&[message("before")], false);
    publisher.close();
    assert!(publisher.is_closed());
    let written = seen.lock().unwrap().len();

    // Publishing after close completes immediately, written nowhere.
    publisher.publish(&[message("after")], true);
    assert_eq!(seen.lock().unwrap().len(), written);
}

#[test]
fn test_subscribers_observe_committed_packets() {
    let (publisher, _seen) = recording_publisher();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    publisher.subscribe(move |_packet| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    publisher.publish(&[message("observe-me")], true);

    // Delivery is asynchronous on the notifier thread.
    let deadline = Instant::now() + Duration::from_secs(5);
    while notified.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    publisher.close();
}

/// Filter that parks the dispatch thread until released, so the ingress
/// queue can be filled deterministically.
struct ParkingFilter {
    entered: SyncSender<()>,
    release: Receiver<()>,
}

impl telemetry_pipeline::PacketFilter for ParkingFilter {
    fn process(&mut self, _packet: &Arc<dyn Packet>) -> bool {
        let _ = self.entered.try_send(());
        let _ = self.release.recv();
        true
    }
}

#[test]
fn test_nonblocking_handle_drops_instead_of_waiting() {
    let publisher = Publisher::new(PublisherConfig {
        max_queue_length: 4,
        ..PublisherConfig::default()
    });
    let (entered_tx, entered_rx) = mpsc::sync_channel(1);
    let (release_tx, release_rx) = mpsc::channel();
    publisher.add_filter(ParkingFilter {
        entered: entered_tx,
        release: release_rx,
    });

    // Occupy the dispatcher, then fill the ingress queue to its cap.
    publisher.publish(&[message("busy")], false);
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("dispatcher should pick up the first packet");
    for i in 0..4 {
        publisher.publish(&[message(&format!("fill-{i}"))], false);
    }
    assert_eq!(publisher.dropped_count(), 0);

    // A pipeline-internal handle must never park; its packets are dropped
    // and counted once the queue is saturated.
    let handle = publisher.nonblocking_handle();
    for i in 0..3 {
        handle.publish(&[message(&format!("extra-{i}"))], false);
    }
    assert_eq!(publisher.dropped_count(), 3);

    for _ in 0..8 {
        let _ = release_tx.send(());
    }
    publisher.close();
}

#[test]
fn test_principal_attached_once_per_batch() {
    let (publisher, _seen) = recording_publisher();
    let resolutions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resolutions);
    publisher.set_principal_resolver(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Some("svc-account".to_owned())
    });

    let batch: Vec<Arc<dyn Packet>> = vec![message("one"), message("two"), message("three")];
    publisher.publish(&batch, true);

    assert_eq!(
        resolutions.load(Ordering::SeqCst),
        1,
        "one lookup serves the whole batch"
    );
    for packet in &batch {
        assert_eq!(packet.header().principal().as_deref(), Some("svc-account"));
    }
    publisher.close();
}
