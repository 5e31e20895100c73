//! Priority-aware bounded outbound queue
//!
//! Messages leave in FIFO order. When the queue is full the policy is:
//!
//! 1. drop the oldest queued screen frame, if any
//! 2. otherwise drop an incoming screen frame
//! 3. otherwise (all audio, incoming audio) drop the oldest audio frame
//!
//! Producers never wait on it; the single writer task awaits [`OutboundQueue::pop`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::error::SendError;
use crate::protocol::{MediaKind, WireMessage};

/// Outcome of a successful [`OutboundQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting the oldest screen frame (its seq)
    DroppedOldestScreen(u64),
    /// The incoming screen frame was discarded
    DroppedIncoming,
    /// Queued after evicting the oldest audio frame (its seq)
    DroppedOldestAudio(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    /// No new messages; the writer drains what is left
    Sealed,
    Closed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped_screen: u64,
    pub dropped_audio: u64,
}

struct Inner {
    messages: VecDeque<WireMessage>,
    gate: Gate,
    stats: QueueStats,
}

pub struct OutboundQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::with_capacity(capacity),
                gate: Gate::Open,
                stats: QueueStats::default(),
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue without waiting; fails once the queue is sealed or closed
    pub fn push(&self, msg: WireMessage) -> Result<Enqueued, SendError> {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.gate != Gate::Open {
                return Err(SendError::ConnectionClosed);
            }

            let outcome = if inner.messages.len() < self.capacity {
                Enqueued::Queued
            } else if let Some(pos) = inner
                .messages
                .iter()
                .position(|m| m.kind == MediaKind::Screen)
            {
                let evicted = inner.messages.remove(pos).map(|m| m.seq).unwrap_or_default();
                inner.stats.dropped_screen += 1;
                Enqueued::DroppedOldestScreen(evicted)
            } else if msg.kind == MediaKind::Screen {
                inner.stats.dropped_screen += 1;
                return Ok(Enqueued::DroppedIncoming);
            } else {
                let evicted = inner.messages.pop_front().map(|m| m.seq).unwrap_or_default();
                inner.stats.dropped_audio += 1;
                Enqueued::DroppedOldestAudio(evicted)
            };

            inner.messages.push_back(msg);
            inner.stats.enqueued += 1;
            outcome
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Next message in FIFO order; `None` once closed, or sealed and drained
    pub async fn pop(&self) -> Option<WireMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                match inner.gate {
                    Gate::Closed => return None,
                    Gate::Sealed | Gate::Open => {
                        if let Some(msg) = inner.messages.pop_front() {
                            return Some(msg);
                        }
                        if inner.gate == Gate::Sealed {
                            return None;
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// Drop every queued message of `kind`, returning how many went
    pub fn discard(&self, kind: MediaKind) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.kind != kind);
        let dropped = before - inner.messages.len();
        if kind == MediaKind::Screen {
            inner.stats.dropped_screen += dropped as u64;
        } else {
            inner.stats.dropped_audio += dropped as u64;
        }
        dropped
    }

    /// Refuse new messages but let the writer drain the rest
    pub fn seal(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.gate == Gate::Open {
                inner.gate = Gate::Sealed;
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Refuse new messages and drop the rest
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.gate = Gate::Closed;
            inner.messages.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().gate == Gate::Open
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Kinds and seqs currently queued, front first
    pub fn snapshot(&self) -> Vec<(MediaKind, u64)> {
        self.inner
            .lock()
            .messages
            .iter()
            .map(|m| (m.kind, m.seq))
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }
}
