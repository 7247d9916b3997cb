//! Named-topic message transport.
//!
//! Topics carry marshalled text. Every subscriber of a topic receives every
//! message sent after it subscribed.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};

/// A point-to-many message transport addressed by topic name.
pub trait Transport: Send + Sync + 'static {
    /// Send a message to every current subscriber of a topic.
    fn send(&self, topic: &str, message: String) -> EngineResult<()>;

    /// Subscribe to a topic. Messages sent before this call are not seen.
    fn subscribe(&self, topic: &str) -> EngineResult<Subscription>;
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    receiver: Receiver<String>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, receiver: Receiver<String>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive a message, blocking until one is available.
    pub fn recv(&self) -> EngineResult<String> {
        self.receiver
            .recv()
            .map_err(|_| EngineError::Transport(format!("Topic closed: {}", self.topic)))
    }

    /// Receive a message, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the wait elapsed without a message.
    pub fn recv_timeout(&self, timeout: Duration) -> EngineResult<Option<String>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Transport(format!(
                "Topic closed: {}",
                self.topic
            ))),
        }
    }

    /// Receive a message without blocking.
    pub fn try_recv(&self) -> EngineResult<Option<String>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(EngineError::Transport(format!(
                "Topic closed: {}",
                self.topic
            ))),
        }
    }
}

/// In-process transport backed by `std::sync::mpsc` channels.
#[derive(Default)]
pub struct InMemoryTransport {
    subscribers: Mutex<HashMap<String, Vec<Sender<String>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.lock().get(topic).map_or(0, |s| s.len())
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, topic: &str, message: String) -> EngineResult<()> {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(topic) {
            // Dropped subscriptions are pruned on the next send.
            senders.retain(|sender| sender.send(message.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(topic);
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> EngineResult<Subscription> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription::new(topic, receiver))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[test]
    fn every_subscriber_sees_every_message() {
        let transport = InMemoryTransport::new();
        let a = transport.subscribe("status").unwrap();
        let b = transport.subscribe("status").unwrap();
        let other = transport.subscribe("other").unwrap();

        transport.send("status", "one".into()).unwrap();
        transport.send("status", "two".into()).unwrap();

        assert_eq!(a.try_recv().unwrap().as_deref(), Some("one"));
        assert_eq!(a.try_recv().unwrap().as_deref(), Some("two"));
        assert_eq!(b.recv().unwrap(), "one");
        assert!(other.try_recv().unwrap().is_none());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let transport = InMemoryTransport::new();
        let kept = transport.subscribe("t").unwrap();
        drop(transport.subscribe("t").unwrap());
        assert_eq!(transport.subscriber_count("t"), 2);

        transport.send("t", "x".into()).unwrap();
        assert_eq!(transport.subscriber_count("t"), 1);
        assert_eq!(kept.recv_timeout(Duration::from_millis(10)).unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn sending_without_subscribers_is_fine() {
        let transport = InMemoryTransport::new();
        assert!(transport.send("nobody", "hello".into()).is_ok());
    }
}
