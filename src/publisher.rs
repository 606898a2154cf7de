use crate::config::PublisherConfig;
use crate::envelope::PacketEnvelope;
use crate::error::Result;
use crate::messenger::{MessengerContext, MessengerHost};
use crate::notifier::Notifier;
use crate::packet::{CommandPacket, MessengerCommand, Packet};
use crate::packet_cache::PacketCache;
use crate::packet_queue::PacketQueue;
use crate::packets::ApplicationUserPacket;
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Inspects packets before dispatch; returning `false` cancels the packet.
/// A cancelled packet skips every sink but its envelope still completes, so
/// no waiter hangs on it.
pub trait PacketFilter: Send {
    fn process(&mut self, packet: &Arc<dyn Packet>) -> bool;
}

impl<F> PacketFilter for F
where
    F: FnMut(&Arc<dyn Packet>) -> bool + Send,
{
    fn process(&mut self, packet: &Arc<dyn Packet>) -> bool {
        self(packet)
    }
}

/// Resolves the current security principal. Invoked at most once per
/// published batch, only when a packet asks for it.
pub trait PrincipalResolver: Send {
    fn resolve(&mut self) -> Option<String>;
}

impl<F> PrincipalResolver for F
where
    F: FnMut() -> Option<String> + Send,
{
    fn resolve(&mut self) -> Option<String> {
        self()
    }
}

/// Maps a resolved principal to an application-user packet, which the
/// dispatcher sequences ahead of the packet that wanted it.
pub trait ApplicationUserResolver: Send {
    fn resolve(&mut self, principal: &str) -> Option<Arc<ApplicationUserPacket>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    NotStarted,
    Running,
    Failed,
    Restarting,
}

struct PublisherQueue {
    queue: PacketQueue,
    closed: bool,
}

struct PublisherShared {
    queue: Mutex<PublisherQueue>,
    work: Condvar,
    messengers: Mutex<Vec<Arc<MessengerHost>>>,
    context: MessengerContext,
    cache: Mutex<PacketCache>,
    filters: Mutex<Vec<Box<dyn PacketFilter>>>,
    principal_resolver: Mutex<Option<Box<dyn PrincipalResolver>>>,
    user_resolver: Mutex<Option<Box<dyn ApplicationUserResolver>>>,
    notifier: Notifier,
    /// Latched by ExitMode; every later write behaves as write-through.
    force_write_through: AtomicBool,
    shutdown: AtomicBool,
    thread: Mutex<ThreadState>,
    failed: AtomicBool,
    dropped: AtomicU64,
}

/// The central sequencer and dispatcher.
///
/// One `Publisher` owns the single global queue and the one thread that
/// stamps every packet's sequence number and timestamp, then fans it out to
/// every registered sink. `Publisher` itself is the producer handle
/// application threads use, and it may block. Code running inside the pipeline
/// (the dispatch thread, sink threads, notification subscribers) gets a
/// [`PublisherHandle`] instead, whose capabilities forbid blocking: the
/// consumer of a queue must never become a producer that waits on it, and
/// here that rule is carried by the handle type rather than a thread-local
/// flag.
pub struct Publisher {
    shared: Arc<PublisherShared>,
}

/// A capability-scoped producer handle.
///
/// `can_block = false` makes every publish best-effort: the handle never
/// waits on pending or committed state, and its data packets are silently
/// dropped (and counted) rather than parked when the queue is saturated.
/// `can_notify = false` additionally suppresses subscriber fan-out for the
/// packets it publishes, preventing notification feedback loops.
#[derive(Clone)]
pub struct PublisherHandle {
    shared: Arc<PublisherShared>,
    can_block: bool,
    can_notify: bool,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> Self {
        let shared = Arc::new(PublisherShared {
            queue: Mutex::new(PublisherQueue {
                queue: PacketQueue::new(config.max_queue_length),
                closed: false,
            }),
            work: Condvar::new(),
            messengers: Mutex::new(Vec::new()),
            context: MessengerContext::new(),
            cache: Mutex::new(PacketCache::new()),
            filters: Mutex::new(Vec::new()),
            principal_resolver: Mutex::new(None),
            user_resolver: Mutex::new(None),
            notifier: Notifier::new(),
            force_write_through: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(ThreadState::NotStarted),
            failed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let publisher = Self { shared };
        publisher.ensure_dispatch_thread();
        publisher
    }

    /// Initializes `host` against this publisher and registers it for
    /// dispatch. Initialization failures propagate and the sink is not
    /// registered; the pipeline keeps running without it.
    pub fn register_messenger(&self, host: MessengerHost) -> Result<Arc<MessengerHost>> {
        host.initialize(&self.shared.context)?;
        let host = Arc::new(host);
        // Prime the new sink with the header packets already in the stream.
        for header in self.shared.context.snapshot_headers() {
            host.write_header(header, false);
        }
        self.shared.messengers.lock().push(Arc::clone(&host));
        Ok(host)
    }

    pub fn add_filter(&self, filter: impl PacketFilter + 'static) {
        self.shared.filters.lock().push(Box::new(filter));
    }

    pub fn set_principal_resolver(&self, resolver: impl PrincipalResolver + 'static) {
        *self.shared.principal_resolver.lock() = Some(Box::new(resolver));
    }

    pub fn set_user_resolver(&self, resolver: impl ApplicationUserResolver + 'static) {
        *self.shared.user_resolver.lock() = Some(Box::new(resolver));
    }

    /// Subscribes to committed packets; delivery is asynchronous on the
    /// notifier's thread.
    pub fn subscribe(&self, subscriber: impl Fn(&Arc<dyn Packet>) + Send + 'static) {
        self.shared.notifier.subscribe(subscriber);
    }

    /// The blocking producer handle (what application code uses).
    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle {
            shared: Arc::clone(&self.shared),
            can_block: true,
            can_notify: true,
        }
    }

    /// A handle for code running inside the pipeline: never blocks.
    pub fn nonblocking_handle(&self) -> PublisherHandle {
        PublisherHandle {
            shared: Arc::clone(&self.shared),
            can_block: false,
            can_notify: true,
        }
    }

    /// A handle for notification subscribers: never blocks, never re-notifies.
    pub fn notifier_handle(&self) -> PublisherHandle {
        PublisherHandle {
            shared: Arc::clone(&self.shared),
            can_block: false,
            can_notify: false,
        }
    }

    /// Publishes a batch; see [`PublisherHandle::publish`].
    pub fn publish(&self, packets: &[Arc<dyn Packet>], write_through: bool) {
        self.ensure_dispatch_thread_if_failed();
        self.handle().publish(packets, write_through);
    }

    /// Blocks until everything queued before this call is committed.
    pub fn flush(&self) {
        self.publish(&[CommandPacket::arc(MessengerCommand::Flush)], true);
    }

    /// Latches exit mode: all further writes are synchronous so final
    /// messages are durably flushed before the process can exit.
    pub fn exit_mode(&self) {
        self.publish(&[CommandPacket::arc(MessengerCommand::ExitMode)], true);
    }

    /// Closes the pipeline: every sink is closed, remaining waiters are
    /// released, and the dispatch thread ends. Idempotent.
    pub fn close(&self) {
        self.publish(&[CommandPacket::arc(MessengerCommand::CloseMessenger)], true);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    /// Data packets dropped at global ingress on behalf of non-blocking
    /// handles.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn ensure_dispatch_thread_if_failed(&self) {
        // Cheap unsynchronized read; the supervisor double-checks under lock.
        if self.shared.failed.load(Ordering::Relaxed) {
            self.ensure_dispatch_thread();
        }
    }

    fn ensure_dispatch_thread(&self) {
        let mut thread = self.shared.thread.lock();
        match *thread {
            ThreadState::Running | ThreadState::Restarting => return,
            ThreadState::NotStarted | ThreadState::Failed => {}
        }
        if *thread == ThreadState::Failed && self.shared.shutdown.load(Ordering::Relaxed) {
            // Exiting; a respawn cannot help. Release all waiters instead.
            self.shared.queue.lock().queue.force_complete_all();
            return;
        }
        *thread = ThreadState::Restarting;

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("telemetry-publisher".to_owned())
            .spawn(move || {
                let loop_shared = Arc::clone(&shared);
                let outcome = catch_unwind(AssertUnwindSafe(move || {
                    dispatch_loop(&loop_shared);
                }));
                if outcome.is_err() {
                    error!("publisher dispatch thread died; flagging for respawn");
                    shared.failed.store(true, Ordering::Relaxed);
                    *shared.thread.lock() = ThreadState::Failed;
                    if shared.shutdown.load(Ordering::Relaxed) {
                        shared.queue.lock().queue.force_complete_all();
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
                error!(error = %e, "failed to spawn publisher dispatch thread");
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        // Best-effort close without blocking; the dispatch thread finishes
        // the shutdown on its own.
        let mut queue = self.shared.queue.lock();
        if !queue.closed && !self.shared.shutdown.load(Ordering::Relaxed) {
            let envelope = Arc::new(PacketEnvelope::new(
                CommandPacket::arc(MessengerCommand::CloseMessenger),
                false,
                false,
            ));
            queue.queue.enqueue(envelope, true);
            self.shared.work.notify_one();
        }
    }
}

impl PublisherHandle {
    /// Publishes a batch of packets.
    ///
    /// Admission: each packet goes to the main queue when there is room;
    /// otherwise to the overflow queue, unless this handle must not block
    /// and the packet is not a command, in which case the packet is silently
    /// dropped (and counted) to protect the dispatch pipeline from waiting
    /// on itself. Only the last packet of the batch carries write-through;
    /// if that exact packet was dropped, a synthetic Flush command is queued
    /// in its place so a blocking caller still waits for everything before
    /// it.
    ///
    /// A blocking handle returns once every packet is off the overflow
    /// queue and, for write-through, once the final packet commits. A
    /// non-blocking handle returns immediately after enqueueing.
    pub fn publish(&self, packets: &[Arc<dyn Packet>], write_through: bool) {
        if packets.is_empty() {
            return;
        }
        self.resolve_principals(packets);

        let force = self.shared.force_write_through.load(Ordering::Relaxed);
        let last = packets.len() - 1;
        let mut wait_for: Vec<Arc<PacketEnvelope>> = Vec::new();
        let mut commit_target: Option<Arc<PacketEnvelope>> = None;

        for (i, packet) in packets.iter().enumerate() {
            let is_last = i == last;
            let effective_wt = (write_through || force) && is_last;
            let is_command = packet.command().is_some();

            let mut envelope = PacketEnvelope::new(Arc::clone(packet), effective_wt, false);
            envelope.set_suppress_notify(!self.can_notify);
            let envelope = Arc::new(envelope);

            let mut queue = self.shared.queue.lock();
            if queue.closed {
                drop(queue);
                envelope.force_complete();
                continue;
            }

            if !is_command && !self.can_block && queue.queue.would_overflow() {
                drop(queue);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                envelope.force_complete();
                if effective_wt {
                    // Preserve the blocking contract for everything already
                    // queued: a flush commits no earlier than those packets.
                    let flush = Arc::new(PacketEnvelope::new(
                        CommandPacket::arc(MessengerCommand::Flush),
                        true,
                        false,
                    ));
                    let mut queue = self.shared.queue.lock();
                    if !queue.closed {
                        queue.queue.enqueue(Arc::clone(&flush), true);
                        self.shared.work.notify_one();
                        commit_target = Some(flush);
                    }
                }
                continue;
            }

            // Commands are always admitted so control flow cannot be lost to
            // backpressure.
            queue.queue.enqueue(Arc::clone(&envelope), is_command);
            self.shared.work.notify_one();
            drop(queue);

            if self.can_block {
                wait_for.push(Arc::clone(&envelope));
                if effective_wt {
                    commit_target = Some(envelope);
                }
            }
        }

        if self.can_block {
            for envelope in wait_for {
                envelope.wait_while_pending();
            }
            if let Some(envelope) = commit_target {
                envelope.wait_committed();
            }
        }
    }

    /// Resolves the security principal at most once for the whole batch and
    /// stamps it onto every packet that wants one.
    fn resolve_principals(&self, packets: &[Arc<dyn Packet>]) {
        let mut resolved: Option<Option<String>> = None;
        for packet in packets {
            if !packet.wants_principal() || packet.header().principal().is_some() {
                continue;
            }
            let principal = resolved.get_or_insert_with(|| {
                self.shared
                    .principal_resolver
                    .lock()
                    .as_mut()
                    .and_then(|r| r.resolve())
            });
            if let Some(name) = principal {
                packet.header().set_principal(name.clone());
            }
        }
    }
}

struct DispatchState {
    next_sequence: i64,
    /// Reentrancy guard: set while the user resolver runs so a resolver that
    /// logs cannot recurse into itself.
    in_resolve_user: bool,
}

fn dispatch_loop(shared: &Arc<PublisherShared>) {
    debug!("publisher dispatch thread started");
    let mut state = DispatchState {
        next_sequence: 1,
        in_resolve_user: false,
    };

    loop {
        let envelope = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(envelope) = queue.queue.dequeue() {
                    break envelope;
                }
                if queue.closed {
                    debug!("publisher dispatch thread closing");
                    return;
                }
                shared.work.wait(&mut queue);
            }
        };

        if let Some(command) = envelope.packet().command() {
            if handle_command(shared, &envelope, command) {
                return;
            }
            continue;
        }

        dispatch_data_packet(shared, &envelope, &mut state);
    }
}

/// Handles a command envelope; returns true when the dispatch thread should
/// end (terminal CloseMessenger).
fn handle_command(
    shared: &Arc<PublisherShared>,
    envelope: &Arc<PacketEnvelope>,
    command: MessengerCommand,
) -> bool {
    match command {
        MessengerCommand::ExitMode => {
            shared.force_write_through.store(true, Ordering::Relaxed);
            let messengers = shared.messengers.lock().clone();
            for host in &messengers {
                host.post_command(MessengerCommand::ExitMode, false);
            }
            envelope.set_committed();
            false
        }
        MessengerCommand::CloseMessenger => {
            shared.shutdown.store(true, Ordering::Relaxed);
            let messengers = shared.messengers.lock().clone();
            for host in &messengers {
                // Blocking here is safe: the publisher thread waits on each
                // sink's queue, never on its own.
                host.close();
            }
            shared.notifier.close();
            let mut queue = shared.queue.lock();
            queue.closed = true;
            queue.queue.force_complete_all();
            drop(queue);
            envelope.set_committed();
            true
        }
        other => {
            let write_through = envelope.write_through();
            let messengers = shared.messengers.lock().clone();
            for host in &messengers {
                host.post_command(other, write_through);
            }
            envelope.set_committed();
            false
        }
    }
}

fn dispatch_data_packet(
    shared: &Arc<PublisherShared>,
    envelope: &Arc<PacketEnvelope>,
    state: &mut DispatchState,
) {
    let packet = Arc::clone(envelope.packet());

    // Dependencies first, depth-first, each stamped exactly once (the
    // sequence==0 sentinel marks the unstamped).
    let mut batch: Vec<Arc<dyn Packet>> = Vec::new();

    // The application-user packet leads the batch when a principal resolved
    // and a resolver is registered, so readers meet the user before any
    // packet attributed to them.
    if let Some(user_packet) = resolve_user_packet(shared, &packet, state) {
        batch.push(user_packet as Arc<dyn Packet>);
    }
    collect_unstamped(&packet, &mut batch);

    let now = Utc::now();
    for member in &batch {
        member.header().stamp_timestamp(now);
        if member.header().stamp_sequence(state.next_sequence) {
            state.next_sequence += 1;
        }
    }

    let write_through = envelope.write_through()
        || shared.force_write_through.load(Ordering::Relaxed);
    let messengers = shared.messengers.lock().clone();

    for member in batch {
        // Cached packets appear exactly once per stream; the first sighting
        // becomes a header that primes every sink registered later.
        let mut is_header = false;
        if member.cache_id().is_some() {
            let mut cache = shared.cache.lock();
            match cache.add_or_get(&member) {
                Some((_, true)) => {
                    drop(cache);
                    shared.context.push_header(Arc::clone(&member));
                    is_header = true;
                }
                Some((_, false)) => continue,
                None => {}
            }
        }

        if !run_filters(shared, &member) {
            // Cancelled: skip every sink but never strand a waiter.
            continue;
        }

        for host in &messengers {
            // Sink faults are isolated inside the host; a failing sink is
            // its own problem, not its siblings'.
            if is_header {
                host.write_header(Arc::clone(&member), write_through);
            } else {
                host.write(Arc::clone(&member), write_through);
            }
        }
    }

    envelope.set_committed();

    if !envelope.suppress_notify() {
        shared.notifier.notify(&packet);
    }
}

/// Depth-first dependency walk collecting every not-yet-sequenced packet,
/// dependencies ahead of dependents.
fn collect_unstamped(packet: &Arc<dyn Packet>, batch: &mut Vec<Arc<dyn Packet>>) {
    if packet.header().sequence() != 0 {
        return;
    }
    if batch.iter().any(|p| Arc::ptr_eq(p, packet)) {
        return;
    }
    for dependency in packet.required_packets() {
        collect_unstamped(&dependency, batch);
    }
    batch.push(Arc::clone(packet));
}

fn run_filters(shared: &Arc<PublisherShared>, packet: &Arc<dyn Packet>) -> bool {
    let mut filters = shared.filters.lock();
    for filter in filters.iter_mut() {
        let keep = catch_unwind(AssertUnwindSafe(|| filter.process(packet)));
        match keep {
            Ok(true) => {}
            Ok(false) => return false,
            Err(_) => {
                warn!("packet filter panicked; packet kept");
            }
        }
    }
    true
}

fn resolve_user_packet(
    shared: &Arc<PublisherShared>,
    packet: &Arc<dyn Packet>,
    state: &mut DispatchState,
) -> Option<Arc<ApplicationUserPacket>> {
    if state.in_resolve_user {
        return None;
    }
    let principal = packet.header().principal()?;
    let mut resolver = shared.user_resolver.lock();
    let resolver = resolver.as_mut()?;

    state.in_resolve_user = true;
    let resolved = catch_unwind(AssertUnwindSafe(|| resolver.resolve(&principal)));
    state.in_resolve_user = false;

    match resolved {
        Ok(user) => user,
        Err(_) => {
            warn!("application user resolver panicked");
            None
        }
    }
}
