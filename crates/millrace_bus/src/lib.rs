//! In-process subject bus.
//!
//! Dot-separated subjects with NATS-style wildcard subscriptions: `*`
//! matches exactly one token, `>` matches one or more trailing tokens.
//! Queue-group subscriptions deliver each message to exactly one member of
//! the group, round-robin. The external deployment bridges these subjects to
//! the platform bus; inside the core everything is a tokio channel.
//!
//! Delivery is at-most-once per subscription: a dropped receiver is pruned
//! on the next publish that would have reached it.

mod subject;

pub use subject::{validate_pattern, validate_subject, Pattern, SubjectError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Subject(#[from] SubjectError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message as delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Decode the JSON payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Receiving half of a subscription.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Await the next message. Returns None once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Non-blocking poll, for drain loops in tests and shutdown paths.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

struct PlainSub {
    pattern: Pattern,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct GroupSub {
    pattern: Pattern,
    members: Vec<mpsc::UnboundedSender<BusMessage>>,
    next: usize,
}

#[derive(Default)]
struct BusState {
    plain: Vec<PlainSub>,
    /// Keyed by (pattern text, group name).
    groups: HashMap<(String, String), GroupSub>,
}

/// Shared in-process bus handle. Clone is cheap.
#[derive(Clone, Default)]
pub struct Bus {
    state: Arc<Mutex<BusState>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a JSON-encoded payload to every matching subscription.
    ///
    /// Returns the number of deliveries made. Queue groups count as one
    /// delivery regardless of member count.
    pub fn publish<T: Serialize>(&self, subject: &str, payload: &T) -> Result<usize, BusError> {
        validate_subject(subject)?;
        let bytes = serde_json::to_vec(payload)?;
        let msg = BusMessage {
            subject: subject.to_string(),
            payload: bytes,
        };

        let mut delivered = 0;
        let mut state = self.state.lock().expect("bus state poisoned");

        // Plain subscriptions: fan out to all matches, pruning dead receivers.
        state.plain.retain(|sub| {
            if !sub.pattern.matches(subject) {
                return !sub.sender.is_closed();
            }
            match sub.sender.send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        // Queue groups: one member per group, round-robin.
        state.groups.retain(|_, group| {
            group.members.retain(|m| !m.is_closed());
            if group.members.is_empty() {
                return false;
            }
            if group.pattern.matches(subject) {
                let start = group.next % group.members.len();
                for offset in 0..group.members.len() {
                    let idx = (start + offset) % group.members.len();
                    if group.members[idx].send(msg.clone()).is_ok() {
                        group.next = idx + 1;
                        delivered += 1;
                        break;
                    }
                }
            }
            true
        });

        trace!(subject, delivered, "published");
        Ok(delivered)
    }

    /// Subscribe to every message matching `pattern`.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let pattern = Pattern::parse(pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .expect("bus state poisoned")
            .plain
            .push(PlainSub {
                pattern,
                sender: tx,
            });
        Ok(Subscription { receiver: rx })
    }

    /// Join a queue group on `pattern`. Each message matching the pattern is
    /// delivered to exactly one member of the group.
    pub fn queue_subscribe(&self, pattern: &str, group: &str) -> Result<Subscription, BusError> {
        let parsed = Pattern::parse(pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (pattern.to_string(), group.to_string());
        let mut state = self.state.lock().expect("bus state poisoned");
        state
            .groups
            .entry(key)
            .or_insert_with(|| GroupSub {
                pattern: parsed,
                members: Vec::new(),
                next: 0,
            })
            .members
            .push(tx);
        Ok(Subscription { receiver: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn plain_subscription_receives_matching_subjects() {
        let bus = Bus::new();
        let mut sub = bus.subscribe("snapshot.refresh.*").unwrap();

        bus.publish("snapshot.refresh.TRN", &Ping { n: 1 }).unwrap();
        bus.publish("snapshot.progress.7", &Ping { n: 2 }).unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "snapshot.refresh.TRN");
        assert_eq!(msg.decode::<Ping>().unwrap(), Ping { n: 1 });
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn gt_wildcard_matches_trailing_tokens() {
        let bus = Bus::new();
        let mut sub = bus.subscribe("snapshot.cancel.>").unwrap();

        bus.publish("snapshot.cancel.12", &Ping { n: 1 }).unwrap();
        assert_eq!(sub.recv().await.unwrap().subject, "snapshot.cancel.12");

        // `>` requires at least one trailing token
        let count = bus.publish("snapshot.cancel", &Ping { n: 2 }).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one_member() {
        let bus = Bus::new();
        let mut a = bus.queue_subscribe("work.*", "pool").unwrap();
        let mut b = bus.queue_subscribe("work.*", "pool").unwrap();

        for n in 0..4 {
            let delivered = bus.publish("work.item", &Ping { n }).unwrap();
            assert_eq!(delivered, 1);
        }

        let mut got_a = 0;
        let mut got_b = 0;
        while a.try_recv().is_some() {
            got_a += 1;
        }
        while b.try_recv().is_some() {
            got_b += 1;
        }
        assert_eq!(got_a + got_b, 4);
        // Round-robin spreads the load
        assert_eq!(got_a, 2);
        assert_eq!(got_b, 2);
    }

    #[tokio::test]
    async fn dropped_group_member_is_skipped() {
        let bus = Bus::new();
        let a = bus.queue_subscribe("work.*", "pool").unwrap();
        let mut b = bus.queue_subscribe("work.*", "pool").unwrap();
        drop(a);

        for n in 0..3 {
            bus.publish("work.item", &Ping { n }).unwrap();
        }
        let mut got = 0;
        while b.try_recv().is_some() {
            got += 1;
        }
        assert_eq!(got, 3);
    }

    #[tokio::test]
    async fn publish_rejects_wildcard_subjects() {
        let bus = Bus::new();
        assert!(bus.publish("snapshot.*", &Ping { n: 1 }).is_err());
    }
}
