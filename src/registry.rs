//! Active consumer registrations.

use std::collections::HashMap;

use uuid::Uuid;

use crate::delivery::Handler;

/// Consumer tag format: `{uuid}-{queue}-{handler name}`.
pub fn consumer_tag(queue: &str, handler: &Handler) -> String {
    format!("{}-{}-{}", Uuid::new_v4(), queue, handler.name())
}

/// One consumer known to the broker.
#[derive(Debug, Clone)]
pub struct ConsumerRegistration {
    pub consumer_tag: String,
    pub queue: String,
    pub handler: Handler,
    /// Registration order, so lookups return tags oldest-first.
    seq: u64,
}

/// Consumers keyed by tag.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, ConsumerRegistration>,
    next_seq: u64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        consumer_tag: impl Into<String>,
        queue: impl Into<String>,
        handler: Handler,
    ) {
        let consumer_tag = consumer_tag.into();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.consumers.insert(
            consumer_tag.clone(),
            ConsumerRegistration {
                consumer_tag,
                queue: queue.into(),
                handler,
                seq,
            },
        );
    }

    /// Tags on `queue`, optionally only those for `handler`, oldest first.
    pub fn find(&self, queue: &str, handler: Option<&Handler>) -> Vec<String> {
        let mut matches: Vec<&ConsumerRegistration> = self
            .consumers
            .values()
            .filter(|r| r.queue == queue && handler.map_or(true, |h| r.handler.same_as(h)))
            .collect();
        matches.sort_by_key(|r| r.seq);
        matches.into_iter().map(|r| r.consumer_tag.clone()).collect()
    }

    pub fn remove(&mut self, consumer_tag: &str) -> Option<ConsumerRegistration> {
        self.consumers.remove(consumer_tag)
    }

    /// All tags, oldest first.
    pub fn tags(&self) -> Vec<String> {
        let mut all: Vec<&ConsumerRegistration> = self.consumers.values().collect();
        all.sort_by_key(|r| r.seq);
        all.into_iter().map(|r| r.consumer_tag.clone()).collect()
    }

    /// Forget every consumer; used once the channel is gone.
    pub fn clear(&mut self) {
        self.consumers.clear();
    }
}
