use crate::packet::Packet;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Synchronization wrapper around one queued packet.
///
/// Producers blocked in a write-through publish wait here for `committed`;
/// producers parked behind a saturated queue wait for `pending` to clear.
/// `committed` is a one-way latch, `pending` toggles. Dispatch threads only
/// ever signal these flags, never wait on them; that asymmetry is the
/// deadlock-avoidance rule of the whole pipeline.
#[derive(Debug)]
pub struct PacketEnvelope {
    packet: Arc<dyn Packet>,
    write_through: bool,
    is_command: bool,
    is_header: bool,
    suppress_notify: bool,
    state: Mutex<EnvelopeState>,
    signal: Condvar,
}

#[derive(Debug, Default)]
struct EnvelopeState {
    committed: bool,
    pending: bool,
}

impl PacketEnvelope {
    pub fn new(packet: Arc<dyn Packet>, write_through: bool, is_header: bool) -> Self {
        let is_command = packet.command().is_some();
        Self {
            packet,
            write_through,
            is_command,
            is_header,
            suppress_notify: false,
            state: Mutex::new(EnvelopeState::default()),
            signal: Condvar::new(),
        }
    }

    /// Marks the envelope as originating from a must-not-notify handle, so
    /// commit does not fan out to in-process subscribers (prevents
    /// notification feedback loops).
    pub fn set_suppress_notify(&mut self, suppress: bool) {
        self.suppress_notify = suppress;
    }

    pub fn suppress_notify(&self) -> bool {
        self.suppress_notify
    }

    pub fn packet(&self) -> &Arc<dyn Packet> {
        &self.packet
    }

    pub fn write_through(&self) -> bool {
        self.write_through
    }

    pub fn is_command(&self) -> bool {
        self.is_command
    }

    pub fn is_header(&self) -> bool {
        self.is_header
    }

    pub fn is_committed(&self) -> bool {
        self.state.lock().committed
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Latches committed (false -> true only) and wakes every waiter.
    pub fn set_committed(&self) {
        let mut state = self.state.lock();
        if !state.committed {
            state.committed = true;
            self.signal.notify_all();
        }
    }

    pub fn set_pending(&self, pending: bool) {
        let mut state = self.state.lock();
        if state.pending != pending {
            state.pending = pending;
            self.signal.notify_all();
        }
    }

    /// Marks the envelope complete without it ever being written; used on
    /// shutdown so no caller waits forever on a packet that will never land.
    pub fn force_complete(&self) {
        let mut state = self.state.lock();
        state.pending = false;
        state.committed = true;
        self.signal.notify_all();
    }

    /// Blocks until the envelope leaves the overflow/pending state.
    pub fn wait_while_pending(&self) {
        let mut state = self.state.lock();
        while state.pending {
            self.signal.wait(&mut state);
        }
    }

    /// Blocks until the envelope is committed.
    pub fn wait_committed(&self) {
        let mut state = self.state.lock();
        while !state.committed {
            self.signal.wait(&mut state);
        }
    }
}
