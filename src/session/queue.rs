//! Per-session outbound queue
//!
//! The router pushes matched messages in from any task; the owning session
//! drains from the head. A QoS 1 message stays at the head, tagged with the
//! packet identifier it was sent under, until the matching PUBACK pops it.

use crate::constants::limits::DUPLICATE_WINDOW;
use crate::types::Message;
use crate::QoS;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Default cap on messages buffered for one session
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Cloneable handle to one session's outbound queue
///
/// Clones share the same buffer. The router only ever holds these handles, so
/// there is no strong link back to the session that drains it.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    client_id: String,
    state: Mutex<QueueState>,
    data_available: Notify,
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<Message>,
    capacity: usize,
    next_packet_id: u16,
    dropped: u64,
    /// Inbound `QoS` 1 packet ids the session acknowledged most recently
    acknowledged_inbound: VecDeque<u16>,
}

impl QueueState {
    fn head_in_flight(&self) -> bool {
        self.messages
            .front()
            .is_some_and(|message| message.packet_id.is_some())
    }

    fn tag_head(&mut self) -> Option<Message> {
        let packet_id = self.next_packet_id;
        let head = self.messages.front_mut()?;
        head.packet_id = Some(packet_id);
        let message = head.clone();
        self.next_packet_id = if packet_id == u16::MAX { 1 } else { packet_id + 1 };
        Some(message)
    }
}

impl OutboundQueue {
    #[must_use]
    pub fn new(client_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                client_id: client_id.into(),
                state: Mutex::new(QueueState {
                    messages: VecDeque::new(),
                    capacity,
                    next_packet_id: 1,
                    dropped: 0,
                    acknowledged_inbound: VecDeque::with_capacity(DUPLICATE_WINDOW),
                }),
                data_available: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The guarded state stays consistent across a panicking holder
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Appends a message and wakes the owning session
    ///
    /// Returns `false` when the queue is full and the message was dropped.
    pub fn push(&self, message: Message) -> bool {
        {
            let mut state = self.lock();
            if state.messages.len() >= state.capacity {
                state.dropped += 1;
                tracing::warn!(
                    client_id = %self.inner.client_id,
                    topic = %message.topic,
                    "Outbound queue full, dropping message"
                );
                return false;
            }
            let mut message = message;
            message.packet_id = None;
            message.dup = false;
            state.messages.push_back(message);
        }
        self.inner.data_available.notify_one();
        true
    }

    /// Peeks the head message
    #[must_use]
    pub fn front(&self) -> Option<Message> {
        self.lock().messages.front().cloned()
    }

    /// Removes the head message after confirmed delivery
    pub fn pop(&self) -> Option<Message> {
        self.lock().messages.pop_front()
    }

    /// Tags the head with a fresh packet identifier and returns it for sending
    ///
    /// Identifiers cycle through 1..=65535 per queue, so they survive a
    /// reconnect of a persistent session along with the queue itself.
    pub fn assign_head_packet_id(&self) -> Option<Message> {
        self.lock().tag_head()
    }

    /// Takes the next message to write
    ///
    /// A `QoS` 0 head leaves the queue right away. A `QoS` 1 head is tagged
    /// with a packet identifier and stays until acknowledged. Returns `None`
    /// while the head is in flight or the queue is empty.
    pub fn next_dispatch(&self) -> Option<Message> {
        let mut state = self.lock();
        if state.head_in_flight() {
            return None;
        }
        if state.messages.front()?.qos == QoS::AtMostOnce {
            return state.messages.pop_front();
        }
        state.tag_head()
    }

    /// Pops the head if it is the in-flight message sent as `packet_id`
    pub fn acknowledge(&self, packet_id: u16) -> Option<Message> {
        let mut state = self.lock();
        if state
            .messages
            .front()
            .is_some_and(|message| message.packet_id == Some(packet_id))
        {
            state.messages.pop_front()
        } else {
            None
        }
    }

    /// Returns the in-flight head marked as a duplicate, for resending on resume
    #[must_use]
    pub fn redelivery(&self) -> Option<Message> {
        let mut state = self.lock();
        if !state.head_in_flight() {
            return None;
        }
        let head = state.messages.front_mut()?;
        head.dup = true;
        Some(head.clone())
    }

    /// Drops queued messages for which `keep` returns false
    ///
    /// An in-flight head is never removed; its PUBACK must still find it.
    /// Returns the number of messages removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let mut state = self.lock();
        let before = state.messages.len();
        let pinned = if state.head_in_flight() {
            state.messages.pop_front()
        } else {
            None
        };
        state.messages.retain(|message| keep(message));
        if let Some(head) = pinned {
            state.messages.push_front(head);
        }
        before - state.messages.len()
    }

    /// Records an inbound `QoS` 1 packet id the session has PUBACKed
    ///
    /// The window lives with the queue, so a persistent session that resumes
    /// still recognizes a DUP=1 resend of a publish acknowledged before the
    /// reconnect. Only the last `DUPLICATE_WINDOW` ids are kept.
    pub fn remember_inbound_ack(&self, packet_id: u16) {
        let mut state = self.lock();
        if state.acknowledged_inbound.contains(&packet_id) {
            return;
        }
        if state.acknowledged_inbound.len() == DUPLICATE_WINDOW {
            state.acknowledged_inbound.pop_front();
        }
        state.acknowledged_inbound.push_back(packet_id);
    }

    #[must_use]
    pub fn inbound_acknowledged(&self, packet_id: u16) -> bool {
        self.lock().acknowledged_inbound.contains(&packet_id)
    }

    /// Distinct topics of the queued messages
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let state = self.lock();
        let mut topics: Vec<String> = Vec::new();
        for message in &state.messages {
            if !topics.contains(&message.topic) {
                topics.push(message.topic.clone());
            }
        }
        topics
    }

    /// Discards everything, including an in-flight head
    pub fn clear(&self) {
        self.lock().messages.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Re-arms the data-available signal, e.g. after a PUBACK freed the head
    pub fn wake(&self) {
        self.inner.data_available.notify_one();
    }

    /// Resolves once data has been pushed since the last wakeup was consumed
    pub async fn notified(&self) {
        self.inner.data_available.notified().await;
    }

    /// Whether two handles refer to the same queue
    #[must_use]
    pub fn same_queue(&self, other: &OutboundQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(topic: &str, qos: QoS) -> Message {
        Message::new(topic, &b"payload"[..], qos)
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new("c1", 10);
        assert!(queue.push(msg("a", QoS::AtMostOnce)));
        assert!(queue.push(msg("b", QoS::AtMostOnce)));
        assert_eq!(queue.front().unwrap().topic, "a");
        assert_eq!(queue.pop().unwrap().topic, "a");
        assert_eq!(queue.pop().unwrap().topic, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_drops_new_messages() {
        let queue = OutboundQueue::new("c1", 1);
        assert!(queue.push(msg("a", QoS::AtMostOnce)));
        assert!(!queue.push(msg("b", QoS::AtMostOnce)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_qos1_head_waits_for_matching_ack() {
        let queue = OutboundQueue::new("c1", 10);
        queue.push(msg("a", QoS::AtLeastOnce));
        queue.push(msg("b", QoS::AtLeastOnce));

        let sent = queue.assign_head_packet_id().unwrap();
        assert_eq!(sent.packet_id, Some(1));
        assert!(queue.acknowledge(2).is_none());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.acknowledge(1).unwrap().topic, "a");
        assert_eq!(queue.assign_head_packet_id().unwrap().packet_id, Some(2));
    }

    #[test]
    fn test_packet_id_wraps_past_zero() {
        let queue = OutboundQueue::new("c1", 10);
        queue.lock().next_packet_id = u16::MAX;
        queue.push(msg("a", QoS::AtLeastOnce));
        assert_eq!(queue.assign_head_packet_id().unwrap().packet_id, Some(u16::MAX));
        queue.acknowledge(u16::MAX);
        queue.push(msg("b", QoS::AtLeastOnce));
        assert_eq!(queue.assign_head_packet_id().unwrap().packet_id, Some(1));
    }

    #[test]
    fn test_next_dispatch_by_qos() {
        let queue = OutboundQueue::new("c1", 10);
        queue.push(msg("zero", QoS::AtMostOnce));
        queue.push(msg("one", QoS::AtLeastOnce));
        queue.push(msg("after", QoS::AtMostOnce));

        let first = queue.next_dispatch().unwrap();
        assert_eq!((first.topic.as_str(), first.packet_id), ("zero", None));
        let second = queue.next_dispatch().unwrap();
        assert_eq!(second.packet_id, Some(1));
        assert!(queue.next_dispatch().is_none());

        queue.acknowledge(1);
        assert_eq!(queue.next_dispatch().unwrap().topic, "after");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_distinct_topics() {
        let queue = OutboundQueue::new("c1", 10);
        for topic in ["a", "b", "a"] {
            queue.push(msg(topic, QoS::AtMostOnce));
        }
        assert_eq!(queue.topics(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_redelivery_marks_dup() {
        let queue = OutboundQueue::new("c1", 10);
        queue.push(msg("a", QoS::AtLeastOnce));
        assert!(queue.redelivery().is_none());

        queue.assign_head_packet_id();
        let resend = queue.redelivery().unwrap();
        assert!(resend.dup);
        assert_eq!(resend.packet_id, Some(1));
    }

    #[test]
    fn test_retain_keeps_in_flight_head() {
        let queue = OutboundQueue::new("c1", 10);
        queue.push(msg("secret/a", QoS::AtLeastOnce));
        queue.push(msg("secret/b", QoS::AtMostOnce));
        queue.push(msg("public/c", QoS::AtMostOnce));
        queue.assign_head_packet_id();

        let removed = queue.retain(|m| !m.topic.starts_with("secret/"));
        assert_eq!(removed, 1);
        assert_eq!(queue.pop().unwrap().topic, "secret/a");
        assert_eq!(queue.pop().unwrap().topic, "public/c");
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = OutboundQueue::new("c1", 10);
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.notified().await });
        tokio::task::yield_now().await;
        queue.push(msg("a", QoS::AtMostOnce));
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_before_wait_stores_permit() {
        let queue = OutboundQueue::new("c1", 10);
        queue.push(msg("a", QoS::AtMostOnce));
        tokio::time::timeout(Duration::from_secs(1), queue.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_inbound_ack_window_survives_on_shared_handle() {
        let queue = OutboundQueue::new("c1", 10);
        let resumed = queue.clone();
        queue.remember_inbound_ack(5);
        assert!(resumed.inbound_acknowledged(5));

        for id in 100..100 + DUPLICATE_WINDOW as u16 {
            queue.remember_inbound_ack(id);
        }
        assert!(!resumed.inbound_acknowledged(5));
        assert!(resumed.inbound_acknowledged(100));
        assert!(!OutboundQueue::new("c1", 10).inbound_acknowledged(100));
    }

    #[test]
    fn test_same_queue() {
        let a = OutboundQueue::new("c1", 10);
        let b = a.clone();
        let c = OutboundQueue::new("c1", 10);
        assert!(a.same_queue(&b));
        assert!(!a.same_queue(&c));
    }
}
