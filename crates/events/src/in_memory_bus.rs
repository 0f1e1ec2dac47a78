//! Process-local fan-out bus, used by tests and single-node setups.

use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InMemoryBusError {
    #[error("event bus is closed")]
    Closed,
}

#[derive(Debug)]
struct Fanout<M> {
    senders: Vec<mpsc::Sender<M>>,
    closed: bool,
    delivered: u64,
}

/// Every subscriber gets its own copy of every message published after it
/// subscribed. Subscribers whose receiving end was dropped are forgotten on
/// the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    fanout: Mutex<Fanout<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn fanout(&self) -> MutexGuard<'_, Fanout<M>> {
        self.fanout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting messages. Existing subscriptions keep what they
    /// already received; later publishes fail with [`InMemoryBusError::Closed`].
    pub fn close(&self) {
        let mut fanout = self.fanout();
        fanout.closed = true;
        fanout.senders.clear();
    }

    /// Messages handed to live subscribers so far, counted per subscriber.
    pub fn delivered(&self) -> u64 {
        self.fanout().delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout().senders.len()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            fanout: Mutex::new(Fanout {
                senders: Vec::new(),
                closed: false,
                delivered: 0,
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut fanout = self.fanout();
        if fanout.closed {
            return Err(InMemoryBusError::Closed);
        }
        fanout.senders.retain(|tx| tx.send(message.clone()).is_ok());
        let reached = fanout.senders.len() as u64;
        fanout.delivered += reached;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        let mut fanout = self.fanout();
        if !fanout.closed {
            fanout.senders.push(tx);
        }
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_every_message() {
        let bus = InMemoryEventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish("created").unwrap();
        bus.publish("paid").unwrap();

        assert_eq!(first.drain(), vec!["created", "paid"]);
        assert_eq!(second.drain(), vec!["created", "paid"]);
        assert_eq!(bus.delivered(), 4);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe());
        let live = bus.subscribe();

        bus.publish(1u32).unwrap();

        assert_eq!(live.drain(), vec![1]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn closed_bus_refuses_messages() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        bus.publish("created").unwrap();
        bus.close();

        assert_eq!(bus.publish("paid"), Err(InMemoryBusError::Closed));
        assert_eq!(sub.drain(), vec!["created"]);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.subscribe().drain().is_empty());
    }
}
