use crate::envelope::PacketEnvelope;
use std::collections::VecDeque;
use std::sync::Arc;

/// Where an enqueued envelope landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Primary,
    Overflowed,
}

/// The primary/overflow FIFO pair behind every dispatcher.
///
/// The overflow queue only ever drains into the primary queue from its front,
/// and only while the primary queue is under its cap, so FIFO order across
/// both queues is exactly enqueue order. Envelopes parked in overflow are
/// marked pending; draining clears the mark and wakes their producers.
///
/// The queue itself is not synchronized; the owning dispatcher guards it with
/// its queue lock.
#[derive(Debug)]
pub struct PacketQueue {
    primary: VecDeque<Arc<PacketEnvelope>>,
    overflow: VecDeque<Arc<PacketEnvelope>>,
    max_length: usize,
}

impl PacketQueue {
    pub fn new(max_length: usize) -> Self {
        Self {
            primary: VecDeque::new(),
            overflow: VecDeque::new(),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.overflow.is_empty()
    }

    /// Whether the next enqueue would overflow (cap honored).
    pub fn would_overflow(&self) -> bool {
        !self.overflow.is_empty() || self.primary.len() >= self.max_length
    }

    /// Admits `envelope`. With `ignore_cap` (maintenance mode) the primary
    /// queue accepts unconditionally so writers never block on size while
    /// housekeeping runs.
    pub fn enqueue(&mut self, envelope: Arc<PacketEnvelope>, ignore_cap: bool) -> Admission {
        if !ignore_cap && self.would_overflow() {
            envelope.set_pending(true);
            self.overflow.push_back(envelope);
            Admission::Overflowed
        } else {
            self.primary.push_back(envelope);
            Admission::Primary
        }
    }

    /// Moves overflowed envelopes into the primary queue while it has room,
    /// releasing their producers.
    pub fn drain_overflow(&mut self) {
        while self.primary.len() < self.max_length {
            match self.overflow.pop_front() {
                Some(envelope) => {
                    envelope.set_pending(false);
                    self.primary.push_back(envelope);
                }
                None => break,
            }
        }
    }

    /// Moves every overflowed envelope regardless of the cap; used when
    /// entering maintenance mode for fairness.
    pub fn drain_overflow_all(&mut self) {
        while let Some(envelope) = self.overflow.pop_front() {
            envelope.set_pending(false);
            self.primary.push_back(envelope);
        }
    }

    /// Removes the next envelope in FIFO order, backfilling from overflow.
    pub fn dequeue(&mut self) -> Option<Arc<PacketEnvelope>> {
        let next = self.primary.pop_front();
        if next.is_some() {
            self.drain_overflow();
        }
        next
    }

    /// Completes and discards everything still queued; shutdown path.
    pub fn force_complete_all(&mut self) {
        for envelope in self.primary.drain(..).chain(self.overflow.drain(..)) {
            envelope.force_complete();
        }
    }
}
