//! Subscription registry and delivery accounting.

use courier_protocol::Message;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// How a delivered message reaches its consumer.
pub(crate) enum Deliver {
    /// Bounded queue feeding the dispatcher task that runs the handler.
    Queue(mpsc::Sender<Message>),
    /// One-shot waiter for a synchronous request round trip.
    Waiter(Option<oneshot::Sender<Message>>),
}

/// A registered subscription.
pub(crate) struct SubEntry {
    pub subject: String,
    pub queue_group: Option<String>,
    pub received: u64,
    pub max: Option<u64>,
    pub deliver: Deliver,
}

impl SubEntry {
    /// Deliveries left before auto-unsubscribe, when a max is set.
    pub fn remaining(&self) -> Option<u64> {
        self.max.map(|max| max.saturating_sub(self.received))
    }
}

/// Result of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliverOutcome {
    Delivered,
    /// No subscription for the sid; the message is silently dropped. Covers
    /// messages in flight for an id that was already unsubscribed.
    NoSubscription,
    /// The subscription's bounded queue is full; the message is dropped.
    QueueFull,
}

/// Maps subscription ids to records and applies the delivery and
/// auto-unsubscribe accounting.
#[derive(Default)]
pub(crate) struct Registry {
    subs: HashMap<u64, SubEntry>,
}

impl Registry {
    pub fn insert(&mut self, sid: u64, entry: SubEntry) {
        self.subs.insert(sid, entry);
    }

    pub fn remove(&mut self, sid: u64) -> Option<SubEntry> {
        self.subs.remove(&sid)
    }

    pub fn contains(&self, sid: u64) -> bool {
        self.subs.contains_key(&sid)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &SubEntry)> {
        self.subs.iter()
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }

    /// Records a delivery for `sid` and hands the message to its consumer.
    /// Removes the subscription once it reaches its max.
    pub fn deliver(&mut self, sid: u64, msg: Message) -> DeliverOutcome {
        let Some(entry) = self.subs.get_mut(&sid) else {
            return DeliverOutcome::NoSubscription;
        };

        entry.received += 1;
        let done = entry.max.is_some_and(|max| entry.received >= max);

        let outcome = match &mut entry.deliver {
            Deliver::Queue(tx) => match tx.try_send(msg) {
                Ok(()) => DeliverOutcome::Delivered,
                Err(_) => DeliverOutcome::QueueFull,
            },
            Deliver::Waiter(waiter) => {
                if let Some(tx) = waiter.take() {
                    // the waiter may have timed out and dropped its receiver
                    let _ = tx.send(msg);
                }
                DeliverOutcome::Delivered
            }
        };

        if done {
            self.subs.remove(&sid);
        }
        outcome
    }

    /// Applies `UNSUB <sid> [max]` bookkeeping. With no max, or when the
    /// subscription already reached the given max, the entry is removed;
    /// otherwise it stays registered with the new max so later deliveries
    /// still fire. Returns whether the entry was removed.
    pub fn apply_unsub(&mut self, sid: u64, max: Option<u64>) -> bool {
        let Some(entry) = self.subs.get_mut(&sid) else {
            return false;
        };
        match max {
            Some(max) if entry.received < max => {
                entry.max = Some(max);
                false
            }
            _ => {
                self.subs.remove(&sid);
                true
            }
        }
    }
}
