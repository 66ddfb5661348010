//! In-process broker and dead-letter sink.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::{DeadLetter, DeadLetterSink, Message, MessageBroker};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct Stored {
    payload: Bytes,
    routing_key: Option<String>,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: Mutex<VecDeque<Stored>>,
    notify: Notify,
}

/// Broker that keeps every queue in memory.
///
/// Every delivery gets a fresh tag. Acked and nacked tags are recorded so
/// callers can assert on settlement. `connect` starts a new session: any
/// delivery still unsettled goes back to the head of its queue and its old
/// tag stops being valid.
#[derive(Default)]
pub struct MemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    unacked: DashMap<u64, (String, Stored)>,
    next_tag: AtomicU64,
    unavailable: AtomicBool,
    failing_receives: AtomicU32,
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<(u64, bool)>>,
    rejected: Mutex<Vec<Message>>,
    settled: Mutex<HashMap<u64, u32>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn publish(&self, queue: &str, payload: impl Into<Bytes>) {
        self.push(queue, payload.into(), None);
    }

    pub fn publish_with_key(&self, queue: &str, routing_key: &str, payload: impl Into<Bytes>) {
        self.push(queue, payload.into(), Some(routing_key.to_string()));
    }

    fn push(&self, queue: &str, payload: Bytes, routing_key: Option<String>) {
        let state = self.queue(queue);
        state.ready.lock().push_back(Stored {
            payload,
            routing_key,
            delivery_count: 0,
        });
        state.notify.notify_one();
    }

    /// Toggle connectivity as seen by `connect` and `receive`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail with a connection error.
    pub fn fail_next_receives(&self, count: u32) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|q| q.ready.lock().len())
            .unwrap_or(0)
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.nacked.lock().clone()
    }

    /// Messages nacked without requeue.
    pub fn rejected(&self) -> Vec<Message> {
        self.rejected.lock().clone()
    }

    /// How many times each tag was settled (acked or nacked).
    pub fn settle_counts(&self) -> HashMap<u64, u32> {
        self.settled.lock().clone()
    }

    fn take_unacked(&self, tag: u64) -> Result<(String, Stored), BrokerError> {
        *self.settled.lock().entry(tag).or_insert(0) += 1;
        self.unacked
            .remove(&tag)
            .map(|(_, v)| v)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }

    fn redeliver_unacked(&self) {
        let mut tags: Vec<u64> = self.unacked.iter().map(|entry| *entry.key()).collect();
        tags.sort_unstable();
        // Newest first so push_front restores delivery order.
        for tag in tags.into_iter().rev() {
            if let Some((_, (queue, stored))) = self.unacked.remove(&tag) {
                let state = self.queue(&queue);
                state.ready.lock().push_front(stored);
                state.notify.notify_one();
            }
        }
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if !self.unavailable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection("memory broker unavailable".to_string()))
        }
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.check_available()?;
        self.redeliver_unacked();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Message, BrokerError> {
        let failing = self
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Connection("injected receive failure".to_string()));
        }
        self.check_available()?;

        let state = self.queue(queue);
        loop {
            let notified = state.notify.notified();
            let next = state.ready.lock().pop_front();
            if let Some(mut stored) = next {
                stored.delivery_count += 1;
                let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                let message = Message {
                    payload: stored.payload.clone(),
                    delivery_tag: tag,
                    redelivered: stored.delivery_count > 1,
                    delivery_count: stored.delivery_count,
                    queue: queue.to_string(),
                    routing_key: stored.routing_key.clone(),
                };
                self.unacked.insert(tag, (queue.to_string(), stored));
                return Ok(message);
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.take_unacked(delivery_tag)?;
        self.acked.lock().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let (queue, stored) = self.take_unacked(delivery_tag)?;
        self.nacked.lock().push((delivery_tag, requeue));
        if requeue {
            let state = self.queue(&queue);
            state.ready.lock().push_back(stored);
            state.notify.notify_one();
        } else {
            self.rejected.lock().push(Message {
                payload: stored.payload,
                delivery_tag,
                redelivered: stored.delivery_count > 1,
                delivery_count: stored.delivery_count,
                queue,
                routing_key: stored.routing_key,
            });
        }
        Ok(())
    }
}

/// Dead-letter sink that keeps letters in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    failing: AtomicBool,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    /// Make `publish` fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Custom("dead-letter sink unavailable".to_string()));
        }
        self.letters.lock().push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_ack() {
        let broker = MemoryBroker::new();
        broker.publish("mail", "hello");

        let msg = broker.receive("mail").await.unwrap();
        assert_eq!(msg.payload, Bytes::from("hello"));
        assert_eq!(msg.delivery_count, 1);
        assert!(!msg.redelivered);

        broker.ack(msg.delivery_tag).await.unwrap();
        assert_eq!(broker.acked(), vec![msg.delivery_tag]);
        assert!(matches!(
            broker.ack(msg.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
        assert_eq!(broker.settle_counts()[&msg.delivery_tag], 2);
    }

    #[tokio::test]
    async fn test_requeue_increments_delivery_count() {
        let broker = MemoryBroker::new();
        broker.publish_with_key("orders", "eu", "{}");

        let first = broker.receive("orders").await.unwrap();
        broker.nack(first.delivery_tag, true).await.unwrap();

        let second = broker.receive("orders").await.unwrap();
        assert_ne!(first.delivery_tag, second.delivery_tag);
        assert_eq!(second.delivery_count, 2);
        assert!(second.redelivered);
        assert_eq!(second.routing_key.as_deref(), Some("eu"));

        broker.nack(second.delivery_tag, false).await.unwrap();
        assert_eq!(broker.rejected().len(), 1);
        assert_eq!(broker.ready_len("orders"), 0);
        assert_eq!(broker.unacked_len(), 0);
    }

    #[tokio::test]
    async fn test_connect_redelivers_unsettled_in_order() {
        let broker = MemoryBroker::new();
        broker.publish("jobs", "a");
        broker.publish("jobs", "b");
        broker.publish("jobs", "c");
        let a = broker.receive("jobs").await.unwrap();
        let b = broker.receive("jobs").await.unwrap();
        assert_eq!(broker.unacked_len(), 2);

        broker.connect().await.unwrap();
        assert_eq!(broker.unacked_len(), 0);
        assert_eq!(broker.ready_len("jobs"), 3);
        assert!(matches!(
            broker.ack(a.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));

        let again: Vec<_> = [
            broker.receive("jobs").await.unwrap(),
            broker.receive("jobs").await.unwrap(),
            broker.receive("jobs").await.unwrap(),
        ]
        .into_iter()
        .map(|m| (m.payload, m.delivery_count))
        .collect();
        assert_eq!(
            again,
            vec![
                (Bytes::from("a"), 2),
                (Bytes::from("b"), 2),
                (Bytes::from("c"), 1),
            ]
        );
        assert_ne!(a.delivery_tag, b.delivery_tag);
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let broker = Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("late").await })
        };
        tokio::task::yield_now().await;
        broker.publish("late", "now");

        let msg = waiter.await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from("now"));
    }

    #[tokio::test]
    async fn test_unavailable_and_injected_failures() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(broker.connect().await.is_err());
        broker.set_available(true);
        assert!(broker.connect().await.is_ok());

        broker.fail_next_receives(1);
        broker.publish("q", "x");
        assert!(matches!(
            broker.receive("q").await,
            Err(BrokerError::Connection(_))
        ));
        assert!(broker.receive("q").await.is_ok());
    }
}
