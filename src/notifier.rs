use crate::packet::Packet;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type Subscriber = Box<dyn Fn(&Arc<dyn Packet>) + Send>;

struct NotifierShared {
    queue: Mutex<VecDeque<Arc<dyn Packet>>>,
    work: Condvar,
    subscribers: Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
}

/// In-process subscriber fan-out.
///
/// The publisher hands committed packets here instead of invoking
/// subscribers inline: notifications run on the notifier's own thread so a
/// slow subscriber never delays dispatch, and anything a subscriber logs
/// re-enters the pipeline through a must-not-notify handle, which is what
/// breaks the feedback loop.
pub struct Notifier {
    shared: Arc<NotifierShared>,
    started: AtomicBool,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(NotifierShared {
                queue: Mutex::new(VecDeque::new()),
                work: Condvar::new(),
                subscribers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a subscriber; the notification thread starts lazily with
    /// the first one.
    pub fn subscribe(&self, subscriber: impl Fn(&Arc<dyn Packet>) + Send + 'static) {
        self.shared.subscribers.lock().push(Box::new(subscriber));
        if !self.started.swap(true, Ordering::AcqRel) {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("telemetry-notifier".to_owned())
                .spawn(move || notification_loop(&shared));
            if let Err(e) = spawned {
                error!(error = %e, "failed to spawn notifier thread");
                self.started.store(false, Ordering::Release);
            }
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.shared.subscribers.lock().is_empty()
    }

    /// Queues a committed packet for asynchronous fan-out. A no-op with no
    /// subscribers, so the common unsubscribed case costs one lock.
    pub fn notify(&self, packet: &Arc<dyn Packet>) {
        if !self.has_subscribers() || self.shared.closed.load(Ordering::Relaxed) {
            return;
        }
        self.shared.queue.lock().push_back(Arc::clone(packet));
        self.shared.work.notify_one();
    }

    /// Stops the notification thread after it drains what is queued.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        self.shared.work.notify_all();
    }
}

fn notification_loop(shared: &Arc<NotifierShared>) {
    debug!("notifier thread started");
    loop {
        let packet = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(packet) = queue.pop_front() {
                    break Some(packet);
                }
                if shared.closed.load(Ordering::Relaxed) {
                    break None;
                }
                shared.work.wait(&mut queue);
            }
        };
        let Some(packet) = packet else {
            debug!("notifier thread closing");
            return;
        };

        let subscribers = shared.subscribers.lock();
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&packet))).is_err() {
                error!("notification subscriber panicked");
            }
        }
    }
}
