//! In-memory transport for tests/dev.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportError, TransportMessage};

/// Receiving end of an [`InMemoryTransport`] subscription.
#[derive(Debug)]
pub struct TransportSubscription {
    receiver: mpsc::UnboundedReceiver<TransportMessage>,
}

impl TransportSubscription {
    /// Wait for the next message; `None` once the transport is dropped.
    pub async fn recv(&mut self) -> Option<TransportMessage> {
        self.receiver.recv().await
    }

    /// Take a message if one is ready.
    pub fn try_recv(&mut self) -> Option<TransportMessage> {
        self.receiver.try_recv().ok()
    }
}

/// In-memory pub/sub transport.
///
/// - No IO
/// - Best-effort fan-out to every live subscriber
/// - Keeps a log of everything sent so tests can assert on hand-offs
/// - Failures can be injected per call or per topic
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportMessage>>>,
    sent: Mutex<Vec<TransportMessage>>,
    failing_topics: Mutex<HashSet<String>>,
    fail_next: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> TransportSubscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        TransportSubscription { receiver: rx }
    }

    /// Messages accepted so far, in send order.
    pub fn sent(&self) -> Vec<TransportMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or_default()
    }

    /// Reject the next `n` sends.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject every send to `topic` until [`InMemoryTransport::heal_topic`].
    pub fn fail_topic(&self, topic: impl Into<String>) {
        if let Ok(mut topics) = self.failing_topics.lock() {
            topics.insert(topic.into());
        }
    }

    pub fn heal_topic(&self, topic: &str) {
        if let Ok(mut topics) = self.failing_topics.lock() {
            topics.remove(topic);
        }
    }

    fn should_fail(&self, topic: &str) -> bool {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        injected
            || self
                .failing_topics
                .lock()
                .map(|topics| topics.contains(topic))
                .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        if self.should_fail(&message.topic) {
            return Err(TransportError::Unavailable(format!(
                "injected failure for topic '{}'",
                message.topic
            )));
        }

        {
            let mut subs = self
                .subscribers
                .lock()
                .map_err(|_| TransportError::Unavailable("subscriber lock poisoned".to_string()))?;

            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        self.sent
            .lock()
            .map_err(|_| TransportError::Unavailable("sent log lock poisoned".to_string()))?
            .push(message);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;

    fn message(topic: &str) -> TransportMessage {
        TransportMessage {
            topic: topic.to_string(),
            group: None,
            headers: Headers::new(),
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let transport = InMemoryTransport::new();
        let mut a = transport.subscribe();
        let mut b = transport.subscribe();

        transport.send(message("orders.placed")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().topic, "orders.placed");
        assert_eq!(b.recv().await.unwrap().topic, "orders.placed");
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let transport = InMemoryTransport::new();
        transport.fail_next(1);

        assert!(transport.send(message("t")).await.is_err());
        assert!(transport.send(message("t")).await.is_ok());
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn failing_topic_rejects_until_healed() {
        let transport = InMemoryTransport::new();
        transport.fail_topic("bad");

        assert!(transport.send(message("bad")).await.is_err());
        assert!(transport.send(message("good")).await.is_ok());

        transport.heal_topic("bad");
        assert!(transport.send(message("bad")).await.is_ok());
    }
}
