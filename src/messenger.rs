use crate::config::{OverflowMode, SinkConfig};
use crate::envelope::PacketEnvelope;
use crate::error::Result;
use crate::packet::{CommandPacket, MessengerCommand, Packet};
use crate::packet_queue::{Admission, PacketQueue};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Lifecycle of a per-sink dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    Uninitialized,
    Initialized,
    Idle,
    Dispatching,
    MaintenanceMode,
    Exiting,
    Exited,
    Closed,
}

/// Maintenance a sink asks its host to run.
///
/// `Regular` is threshold-driven (file size, file age); `Explicit` is a
/// client request (CloseFile) and runs even when thresholds say otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MaintenanceRequest {
    #[default]
    None,
    Regular,
    Explicit,
}

/// Read-only view a sink gets of the pipeline's header packets, so it can
/// prime a fresh stream (new file, new connection) with the cached packets
/// every stream must carry.
#[derive(Clone, Default)]
pub struct MessengerContext {
    headers: Arc<Mutex<Vec<Arc<dyn Packet>>>>,
}

impl MessengerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_headers(&self) -> Vec<Arc<dyn Packet>> {
        self.headers.lock().clone()
    }

    pub(crate) fn push_header(&self, packet: Arc<dyn Packet>) {
        self.headers.lock().push(packet);
    }
}

/// The sink contract: what a concrete destination implements against the
/// host dispatcher.
///
/// Every hook except `initialize` is invoked through a guard that catches
/// errors and panics, logs them, and keeps the dispatch thread alive: a
/// buggy sink must never take the pipeline down. `initialize` errors
/// propagate and prevent the sink from starting at all.
pub trait Messenger: Send {
    fn name(&self) -> &'static str;

    /// Called exactly once before any write. Errors stop the sink.
    fn initialize(&mut self, context: &MessengerContext, config: &SinkConfig) -> Result<()>;

    /// Called when live configuration changes.
    fn configuration_updated(&mut self, _config: &SinkConfig) {}

    /// Writes one packet. Raise `maintenance` to ask for housekeeping.
    fn on_write(
        &mut self,
        packet: &Arc<dyn Packet>,
        write_through: bool,
        maintenance: &mut MaintenanceRequest,
    ) -> Result<()>;

    /// Pushes buffered data to the destination.
    fn on_flush(&mut self, _maintenance: &mut MaintenanceRequest) -> Result<()> {
        Ok(())
    }

    /// Housekeeping (rotation, reconnect). Runs with no host locks held.
    fn on_maintenance(&mut self) -> Result<()> {
        Ok(())
    }

    /// Observes any command addressed to this sink.
    fn on_command(&mut self, _command: MessengerCommand) {}

    /// The application is exiting; writes become synchronous after this.
    fn on_exit(&mut self) {}

    /// Terminal; the sink will never be called again.
    fn on_close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    NotStarted,
    Running,
    Failed,
    Restarting,
}

struct HostQueue {
    queue: PacketQueue,
    state: MessengerState,
    in_maintenance: bool,
    exiting: bool,
    closed: bool,
    dirty: bool,
    last_activity: Instant,
}

struct HostShared {
    config: SinkConfig,
    queue: Mutex<HostQueue>,
    work: Condvar,
    sink: Mutex<Box<dyn Messenger>>,
    thread: Mutex<ThreadState>,
    failed: AtomicBool,
    dropped: AtomicU64,
}

/// Per-sink dispatcher: owns the sink's queue pair and its dedicated
/// dispatch thread.
///
/// The host gives every sink the same guarantees: admission control with a
/// selectable overflow policy, maintenance mode that suspends the queue cap
/// while housekeeping runs, synchronous writes when asked (or forced, once
/// the application is exiting), fault isolation around every sink hook, and
/// a supervisor that respawns the dispatch thread if it ever dies. One slow
/// or broken sink stalls only its own queue, never the publisher or its
/// sibling sinks.
pub struct MessengerHost {
    name: &'static str,
    shared: Arc<HostShared>,
}

impl MessengerHost {
    pub fn new(sink: Box<dyn Messenger>, config: SinkConfig) -> Self {
        let name = sink.name();
        let max_queue_length = config.max_queue_length;
        Self {
            name,
            shared: Arc::new(HostShared {
                config,
                queue: Mutex::new(HostQueue {
                    queue: PacketQueue::new(max_queue_length),
                    state: MessengerState::Uninitialized,
                    in_maintenance: false,
                    exiting: false,
                    closed: false,
                    dirty: false,
                    last_activity: Instant::now(),
                }),
                work: Condvar::new(),
                sink: Mutex::new(sink),
                thread: Mutex::new(ThreadState::NotStarted),
                failed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> MessengerState {
        self.shared.queue.lock().state
    }

    /// Packets discarded by the Drop overflow policy.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().queue.len()
    }

    /// Initializes the sink and starts the dispatch thread. Initialization
    /// errors propagate; the sink never starts.
    pub fn initialize(&self, context: &MessengerContext) -> Result<()> {
        {
            let mut sink = self.shared.sink.lock();
            sink.initialize(context, &self.shared.config)?;
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.state = MessengerState::Initialized;
        }
        self.ensure_dispatch_thread();
        Ok(())
    }

    pub fn configuration_updated(&self, config: &SinkConfig) {
        let mut sink = self.shared.sink.lock();
        sink.configuration_updated(config);
    }

    /// Queues `packet` for this sink. Blocks while the packet is parked in
    /// overflow, and through commit when the write is (or has become)
    /// synchronous. Never blocks under the Drop overflow policy.
    pub fn write(&self, packet: Arc<dyn Packet>, write_through: bool) {
        let envelope = Arc::new(PacketEnvelope::new(packet, write_through, false));
        self.write_envelope(envelope);
    }

    /// Queues a header packet. Header packets prime every stream the sink
    /// opens (session info, cached definitions), so losing one corrupts all
    /// later output: like commands, they are admitted even past the cap and
    /// are never dropped by the overflow policy.
    pub fn write_header(&self, packet: Arc<dyn Packet>, write_through: bool) {
        let envelope = Arc::new(PacketEnvelope::new(packet, write_through, true));
        self.write_envelope(envelope);
    }

    /// Posts a command packet; commands are admitted even past the cap.
    pub fn post_command(&self, command: MessengerCommand, write_through: bool) {
        let envelope = Arc::new(PacketEnvelope::new(
            CommandPacket::arc(command),
            write_through,
            false,
        ));
        self.write_envelope(envelope);
    }

    /// Posts Flush and blocks until everything before it is committed.
    pub fn flush(&self) {
        self.post_command(MessengerCommand::Flush, true);
    }

    /// Posts CloseMessenger and blocks until the sink has shut down.
    pub fn close(&self) {
        self.post_command(MessengerCommand::CloseMessenger, true);
    }

    fn write_envelope(&self, envelope: Arc<PacketEnvelope>) {
        // Cheap unsynchronized read; the supervisor double-checks under lock.
        if self.shared.failed.load(Ordering::Relaxed) {
            self.ensure_dispatch_thread();
        }

        let (admission, synchronous) = {
            let mut queue = self.shared.queue.lock();
            if queue.closed || queue.state == MessengerState::Uninitialized {
                if queue.state == MessengerState::Uninitialized {
                    warn!(sink = self.name, "write before initialize; completing unwritten");
                }
                drop(queue);
                envelope.force_complete();
                return;
            }

            let ignore_cap =
                queue.in_maintenance || envelope.is_command() || envelope.is_header();
            if !ignore_cap
                && queue.queue.would_overflow()
                && self.shared.config.overflow_mode == OverflowMode::Drop
            {
                drop(queue);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                envelope.force_complete();
                return;
            }

            let admission = queue.queue.enqueue(Arc::clone(&envelope), ignore_cap);
            queue.last_activity = Instant::now();
            // Once the sink is exiting every write is synchronous so shutdown
            // flushes fully.
            let synchronous = self.shared.config.force_synchronous
                || envelope.write_through()
                || queue.exiting;
            self.shared.work.notify_one();
            (admission, synchronous)
        };

        if admission == Admission::Overflowed {
            envelope.wait_while_pending();
        }
        if synchronous {
            envelope.wait_committed();
        }
    }

    /// Spawns (or respawns) the dispatch thread, double-checking under the
    /// supervisor lock to avoid duplicate spawns.
    fn ensure_dispatch_thread(&self) {
        let mut thread = self.shared.thread.lock();
        match *thread {
            ThreadState::Running | ThreadState::Restarting => return,
            ThreadState::NotStarted | ThreadState::Failed => {}
        }
        if *thread == ThreadState::Failed {
            // If the app is on its way out a respawn cannot help; release
            // everything still queued instead.
            let mut queue = self.shared.queue.lock();
            if queue.exiting || queue.closed {
                queue.queue.force_complete_all();
                return;
            }
        }
        *thread = ThreadState::Restarting;

        let shared = Arc::clone(&self.shared);
        let name = self.name;
        let spawned = std::thread::Builder::new()
            .name(format!("telemetry-sink-{name}"))
            .spawn(move || {
                let loop_shared = Arc::clone(&shared);
                let outcome = catch_unwind(AssertUnwindSafe(move || {
                    dispatch_loop(&loop_shared);
                }));
                if outcome.is_err() {
                    error!(sink = name, "sink dispatch thread died; flagging for respawn");
                    shared.failed.store(true, Ordering::Relaxed);
                    *shared.thread.lock() = ThreadState::Failed;
                    let mut queue = shared.queue.lock();
                    if queue.exiting || queue.closed {
                        queue.queue.force_complete_all();
                    }
                }
            });
        match spawned {
            Ok(_) => {
                *thread = ThreadState::Running;
                self.shared.failed.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                *thread = ThreadState::Failed;
                error!(sink = self.name, error = %e, "failed to spawn sink dispatch thread");
            }
        }
    }
}

/// Runs one sink hook under the fault guard: errors and panics are logged
/// and swallowed so the dispatch thread survives any sink misbehavior.
fn guarded<F>(sink: &str, operation: &str, f: F)
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(sink, operation, error = %e, "sink hook failed");
        }
        Err(_) => {
            error!(sink, operation, "sink hook panicked");
        }
    }
}

fn dispatch_loop(shared: &Arc<HostShared>) {
    let name = {
        let sink = shared.sink.lock();
        sink.name()
    };
    debug!(sink = name, "sink dispatch thread started");

    loop {
        let mut auto_flush = false;
        let envelope = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.in_maintenance
                    && queue.queue.primary_len() < queue.queue.max_length()
                {
                    queue.in_maintenance = false;
                    queue.state = MessengerState::Dispatching;
                }
                if let Some(envelope) = queue.queue.dequeue() {
                    if !queue.closed {
                        queue.state = if queue.in_maintenance {
                            MessengerState::MaintenanceMode
                        } else if queue.exiting {
                            MessengerState::Exiting
                        } else {
                            MessengerState::Dispatching
                        };
                    }
                    break Some(envelope);
                }
                if queue.closed {
                    queue.state = MessengerState::Closed;
                    break None;
                }
                queue.state = if queue.exiting {
                    // Exiting with an empty queue: fully drained.
                    MessengerState::Exited
                } else {
                    MessengerState::Idle
                };
                // Periodic wake drives the auto-flush check.
                let timed_out = shared
                    .work
                    .wait_for(&mut queue, std::time::Duration::from_secs(1))
                    .timed_out();
                if timed_out
                    && queue.dirty
                    && queue.last_activity.elapsed() >= shared.config.auto_flush_interval
                {
                    queue.dirty = false;
                    auto_flush = true;
                    break None;
                }
            }
        };

        let Some(envelope) = envelope else {
            if auto_flush {
                let mut maintenance = MaintenanceRequest::None;
                guarded(name, "flush", || {
                    shared.sink.lock().on_flush(&mut maintenance)
                });
                run_maintenance(shared, name, maintenance);
                continue;
            }
            debug!(sink = name, "sink dispatch thread closing");
            return;
        };

        let mut maintenance = MaintenanceRequest::None;
        let mut closing = false;

        if let Some(command) = envelope.packet().command() {
            guarded(name, "command", || {
                shared.sink.lock().on_command(command);
                Ok(())
            });
            match command {
                MessengerCommand::Flush => {
                    let mut queue = shared.queue.lock();
                    queue.dirty = false;
                    drop(queue);
                    guarded(name, "flush", || {
                        shared.sink.lock().on_flush(&mut maintenance)
                    });
                }
                MessengerCommand::CloseFile => {
                    maintenance = MaintenanceRequest::Explicit;
                }
                MessengerCommand::ExitMode => {
                    let mut queue = shared.queue.lock();
                    queue.exiting = true;
                    queue.state = MessengerState::Exiting;
                    drop(queue);
                    guarded(name, "exit", || {
                        shared.sink.lock().on_exit();
                        Ok(())
                    });
                }
                MessengerCommand::CloseMessenger => {
                    guarded(name, "close", || {
                        shared.sink.lock().on_close();
                        Ok(())
                    });
                    closing = true;
                }
                MessengerCommand::None
                | MessengerCommand::ShowLiveView
                | MessengerCommand::OpenRemoteViewer => {}
            }
        } else {
            guarded(name, "write", || {
                shared.sink.lock().on_write(
                    envelope.packet(),
                    envelope.write_through(),
                    &mut maintenance,
                )
            });
            shared.queue.lock().dirty = true;
        }

        run_maintenance(shared, name, maintenance);

        if closing {
            // The terminal state must be visible before the close envelope
            // commits, so a blocked close() observes Closed on return.
            let mut queue = shared.queue.lock();
            queue.closed = true;
            queue.exiting = true;
            queue.state = MessengerState::Closed;
            // Anything still queued will never be written; release waiters.
            queue.queue.force_complete_all();
            drop(queue);
            envelope.set_committed();
            debug!(sink = name, "sink closed");
            return;
        }
        envelope.set_committed();
    }
}

/// Enters maintenance mode if requested and runs the sink's maintenance hook
/// with no locks held, so producers keep queueing (cap suspended) while the
/// sink does housekeeping.
fn run_maintenance(shared: &Arc<HostShared>, name: &str, request: MaintenanceRequest) {
    if request == MaintenanceRequest::None {
        return;
    }
    {
        let mut queue = shared.queue.lock();
        queue.in_maintenance = true;
        queue.state = MessengerState::MaintenanceMode;
        queue.queue.drain_overflow_all();
    }
    guarded(name, "maintenance", || shared.sink.lock().on_maintenance());
    let mut queue = shared.queue.lock();
    if queue.queue.primary_len() < queue.queue.max_length() {
        queue.in_maintenance = false;
        if !queue.closed && !queue.exiting {
            queue.state = MessengerState::Dispatching;
        }
    }
}
