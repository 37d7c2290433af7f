//! Operations issued before the client is ready.
//!
//! Publishes and subscribes are held here until the ready transition, then
//! drained exactly once. Both queues drain oldest-first, publishes before
//! subscribes.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use crate::delivery::Handler;

/// A buffered publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub queue: String,
    pub payload: Bytes,
}

/// A buffered subscribe.
#[derive(Debug, Clone)]
pub struct PendingSubscribe {
    pub queue: String,
    pub handler: Handler,
}

/// Pre-ready operation buffer.
#[derive(Debug, Default)]
pub struct PendingOperationBuffer {
    publishes: VecDeque<PendingPublish>,
    subscribes: VecDeque<PendingSubscribe>,
}

impl PendingOperationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_publish(&mut self, queue: impl Into<String>, payload: Bytes) {
        let queue = queue.into();
        debug!(queue = %queue, "Buffering publish until ready");
        self.publishes.push_back(PendingPublish { queue, payload });
    }

    pub fn enqueue_subscribe(&mut self, queue: impl Into<String>, handler: Handler) {
        let queue = queue.into();
        debug!(queue = %queue, handler = handler.name(), "Buffering subscribe until ready");
        self.subscribes.push_back(PendingSubscribe { queue, handler });
    }

    /// Drop buffered subscribes for `queue`, optionally only those for `handler`.
    ///
    /// Returns how many entries were removed.
    pub fn remove_pending_subscribe(&mut self, queue: &str, handler: Option<&Handler>) -> usize {
        let before = self.subscribes.len();
        self.subscribes.retain(|entry| {
            let matches = entry.queue == queue
                && handler.map_or(true, |h| entry.handler.same_as(h));
            !matches
        });
        let removed = before - self.subscribes.len();
        debug!(queue = %queue, removed, "Removed buffered subscribes");
        removed
    }

    pub fn publish_len(&self) -> usize {
        self.publishes.len()
    }

    pub fn subscribe_len(&self) -> usize {
        self.subscribes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishes.is_empty() && self.subscribes.is_empty()
    }

    /// Take everything buffered, leaving the buffer empty.
    ///
    /// The caller dispatches publishes first, then subscribes, each in the
    /// order they were enqueued.
    pub fn drain(&mut self) -> (Vec<PendingPublish>, Vec<PendingSubscribe>) {
        (
            self.publishes.drain(..).collect(),
            self.subscribes.drain(..).collect(),
        )
    }
}
