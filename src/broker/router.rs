//! Subscription router
//!
//! Single owner of routing state: the session registry, the topic tree and
//! the retained-message store, all behind one lock. Sessions only ever see
//! their own [`OutboundQueue`]; the router holds clones of those queues, never
//! the sessions themselves.
//!
//! Publish fan-out collects the matching queues under the read lock and pushes
//! into them after releasing it, so a slow consumer never holds up routing.

use crate::broker::config::BrokerConfig;
use crate::broker::event::{Event, EventDetail, EventHandler};
use crate::broker::stats::BrokerStats;
use crate::broker::topic_tree::{TopicTree, TreeSubscriber};
use crate::error::{MqttError, Result};
use crate::session::queue::OutboundQueue;
use crate::types::Message;
use crate::validation::topic_matches_filter;
use crate::QoS;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// Which node currently serves a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOwner {
    Local,
    /// Served by the named peer; kept here so ownership can migrate back
    Remote(String),
}

/// Registry entry for one client id
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub client_id: String,
    pub owner: SessionOwner,
    pub persistent: bool,
    /// A local connection is attached right now
    pub connected: bool,
    pub queue: OutboundQueue,
    /// Bumped on every local registration; stale connections compare against it
    pub generation: u64,
    takeover: Arc<Notify>,
}

impl SessionRecord {
    fn remote(client_id: &str, node: &str, queue: OutboundQueue) -> Self {
        Self {
            client_id: client_id.to_string(),
            owner: SessionOwner::Remote(node.to_string()),
            persistent: true,
            connected: false,
            queue,
            generation: 0,
            takeover: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.owner == SessionOwner::Local
    }
}

/// Outcome of registering a newly connected client
#[derive(Debug, Clone)]
pub struct Registration {
    pub queue: OutboundQueue,
    /// A persistent session existed and was picked up
    pub resumed: bool,
    pub generation: u64,
    /// Signalled when a later connection takes this client id over
    pub takeover: Arc<Notify>,
}

#[derive(Debug, Default)]
struct RouterState {
    sessions: HashMap<String, SessionRecord>,
    tree: TopicTree,
    retained: HashMap<String, Message>,
    next_generation: u64,
}

impl RouterState {
    fn drop_session(&mut self, client_id: &str) {
        self.sessions.remove(client_id);
        let filters = self.tree.remove_client(client_id);
        debug!(client_id, removed = filters.len(), "Dropped session subscriptions");
    }
}

/// Topic tree plus session registry
#[derive(Debug)]
pub struct SubscriptionRouter {
    node_id: String,
    state: RwLock<RouterState>,
    upgrade_outgoing_qos: bool,
    queue_capacity: usize,
    stats: Arc<BrokerStats>,
}

impl SubscriptionRouter {
    #[must_use]
    pub fn new(node_id: impl Into<String>, queue_capacity: usize, stats: Arc<BrokerStats>) -> Self {
        Self {
            node_id: node_id.into(),
            state: RwLock::new(RouterState::default()),
            upgrade_outgoing_qos: false,
            queue_capacity,
            stats,
        }
    }

    #[must_use]
    pub fn from_config(config: &BrokerConfig, stats: Arc<BrokerStats>) -> Self {
        Self::new(config.effective_node_id(), config.queue_capacity, stats)
            .with_upgrade_outgoing_qos(config.upgrade_outgoing_qos)
    }

    #[must_use]
    pub fn with_upgrade_outgoing_qos(mut self, upgrade: bool) -> Self {
        self.upgrade_outgoing_qos = upgrade;
        self
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registers a locally connected client
    ///
    /// A persistent CONNECT picks up an existing persistent record, local or
    /// replicated from a peer, keeping its queue and subscriptions. Anything
    /// else starts from an empty queue and drops the old subscriptions. A live
    /// local connection for the same id is told to close.
    pub async fn register_session(&self, client_id: &str, clean_session: bool) -> Registration {
        let mut state = self.state.write().await;
        state.next_generation += 1;
        let generation = state.next_generation;

        let existing = state.sessions.remove(client_id);
        if let Some(old) = existing.as_ref().filter(|old| old.is_local() && old.connected) {
            info!(client_id, "Taking over live session");
            old.takeover.notify_one();
        }

        let (queue, resumed) = match existing {
            Some(old) if !clean_session && old.persistent => (old.queue, true),
            Some(_) => {
                state.tree.remove_client(client_id);
                (OutboundQueue::new(client_id, self.queue_capacity), false)
            }
            None => (OutboundQueue::new(client_id, self.queue_capacity), false),
        };

        let takeover = Arc::new(Notify::new());
        state.sessions.insert(
            client_id.to_string(),
            SessionRecord {
                client_id: client_id.to_string(),
                owner: SessionOwner::Local,
                persistent: !clean_session,
                connected: true,
                queue: queue.clone(),
                generation,
                takeover: Arc::clone(&takeover),
            },
        );
        debug!(client_id, clean_session, resumed, generation, "Registered session");

        Registration {
            queue,
            resumed,
            generation,
            takeover,
        }
    }

    /// Marks the connection of `generation` as gone
    ///
    /// Returns `false` when a newer connection already owns the record, in
    /// which case the caller must leave routing state alone.
    pub async fn detach_session(&self, client_id: &str, generation: u64) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(client_id) {
            Some(record) if record.is_local() && record.generation == generation => {
                record.connected = false;
                true
            }
            _ => false,
        }
    }

    /// Removes a session that has no live connection, with its subscriptions
    pub async fn delete_session(&self, client_id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.sessions.get(client_id).is_some_and(|r| !r.connected) {
            state.drop_session(client_id);
            return true;
        }
        false
    }

    #[must_use]
    pub async fn find_session(&self, client_id: &str) -> Option<SessionRecord> {
        self.state.read().await.sessions.get(client_id).cloned()
    }

    /// Adds or replaces `client_id`'s subscription to `filter`
    pub async fn add_subscription(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
        queue: OutboundQueue,
    ) -> bool {
        let mut state = self.state.write().await;
        let added = state
            .tree
            .insert(client_id, filter, TreeSubscriber { qos, queue });
        debug!(client_id, filter, ?qos, added, "Subscription stored");
        added
    }

    pub async fn remove_subscription(&self, client_id: &str, filter: &str) -> bool {
        let removed = self.state.write().await.tree.remove(client_id, filter);
        debug!(client_id, filter, removed, "Subscription removed");
        removed
    }

    /// Granted `QoS` of `client_id`'s subscription to exactly `filter`
    #[must_use]
    pub async fn subscription_qos(&self, client_id: &str, filter: &str) -> Option<QoS> {
        self.state
            .read()
            .await
            .tree
            .get(client_id, filter)
            .map(|s| s.qos)
    }

    /// Routes a published message to every locally served subscriber
    ///
    /// Updates the retained store first when the message carries the retain
    /// flag. Returns the number of queues the message was pushed into.
    pub async fn add_topic(&self, client_id: &str, message: &Message) -> usize {
        if message.retain {
            self.store_retained(message).await;
        }

        let targets = {
            let state = self.state.read().await;
            let mut per_client: HashMap<String, (QoS, OutboundQueue)> = HashMap::new();
            for matched in state.tree.matches(&message.topic) {
                let local = state
                    .sessions
                    .get(&matched.client_id)
                    .is_some_and(SessionRecord::is_local);
                if !local {
                    continue;
                }
                // Overlapping filters deliver once, at the highest granted QoS
                per_client
                    .entry(matched.client_id)
                    .and_modify(|(qos, _)| *qos = (*qos).max(matched.qos))
                    .or_insert((matched.qos, matched.queue));
            }
            per_client
        };

        let mut delivered = 0;
        for (subscriber, (granted, queue)) in targets {
            let mut outgoing = message.clone();
            outgoing.qos = self.outgoing_qos(granted, message.qos);
            outgoing.retain = false;
            if queue.push(outgoing) {
                delivered += 1;
            } else {
                self.stats.message_dropped();
                warn!(client_id = %subscriber, topic = %message.topic, "Dropped message for full queue");
            }
        }
        debug!(client_id, topic = %message.topic, delivered, "Routed publish");
        delivered
    }

    fn outgoing_qos(&self, granted: QoS, published: QoS) -> QoS {
        let qos = if self.upgrade_outgoing_qos {
            granted
        } else {
            granted.min(published)
        };
        qos.min(QoS::AtLeastOnce)
    }

    async fn store_retained(&self, message: &Message) {
        let mut state = self.state.write().await;
        if message.payload.is_empty() {
            state.retained.remove(&message.topic);
            debug!(topic = %message.topic, "Cleared retained message");
        } else {
            let mut retained = message.clone();
            retained.dup = false;
            retained.packet_id = None;
            state.retained.insert(message.topic.clone(), retained);
            debug!(topic = %message.topic, "Stored retained message");
        }
    }

    /// Retained messages matching `filter`, flagged for delivery as retained
    #[must_use]
    pub async fn retained_messages(&self, filter: &str) -> Vec<Message> {
        self.state
            .read()
            .await
            .retained
            .values()
            .filter(|message| topic_matches_filter(&message.topic, filter))
            .cloned()
            .map(|message| message.with_retain(true))
            .collect()
    }

    /// Purges queued messages for `client_id` that `validator` rejects
    ///
    /// An in-flight message awaiting PUBACK is kept. Returns how many were removed.
    pub async fn delete_message_with_validator<F>(&self, client_id: &str, validator: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let queue = {
            let state = self.state.read().await;
            match state.sessions.get(client_id) {
                Some(record) => record.queue.clone(),
                None => return 0,
            }
        };
        let removed = queue.retain(validator);
        if removed > 0 {
            info!(client_id, removed, "Purged queued messages that failed revalidation");
        }
        removed
    }

    #[must_use]
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    #[must_use]
    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.tree.len()
    }

    #[must_use]
    pub async fn retained_count(&self) -> usize {
        self.state.read().await.retained.len()
    }

    async fn apply_local(&self, event: &Event) -> Result<()> {
        let client_id = event.client_id.as_str();
        match &event.detail {
            EventDetail::TopicSubscribed { topic, qos } => {
                let queue = self
                    .find_session(client_id)
                    .await
                    .map(|record| record.queue)
                    .ok_or_else(|| {
                        MqttError::InvalidState(format!("subscribe for unknown session {client_id}"))
                    })?;
                self.add_subscription(client_id, topic, *qos, queue).await;
            }
            EventDetail::TopicUnsubscribed { topic } => {
                self.remove_subscription(client_id, topic).await;
            }
            EventDetail::TopicPublished { message } => {
                self.add_topic(client_id, message).await;
            }
            EventDetail::SessionDestroyed => {
                self.delete_session(client_id).await;
            }
            EventDetail::SessionCreated { .. } | EventDetail::SessionResumed => {}
        }
        Ok(())
    }

    /// Replays a change that happened on another node
    ///
    /// Every branch is idempotent: applying the same event twice leaves the
    /// same registry and tree as applying it once.
    pub async fn apply_remote(&self, event: &Event) {
        let client_id = event.client_id.as_str();
        let node = event.node.as_str();

        if let EventDetail::TopicPublished { message } = &event.detail {
            self.add_topic(client_id, message).await;
            return;
        }

        let mut state = self.state.write().await;
        let existing = state.sessions.get(client_id).cloned();
        match &event.detail {
            EventDetail::SessionCreated { .. } | EventDetail::SessionResumed
                if existing.as_ref().is_some_and(|r| r.is_local() && r.connected) =>
            {
                warn!(client_id, node, detail = ?event.detail, "Peer claims a session that is live here; ignoring");
            }
            EventDetail::SessionCreated { persistent: false } => {
                if existing.is_some() {
                    state.drop_session(client_id);
                }
            }
            EventDetail::SessionCreated { persistent: true } | EventDetail::SessionResumed => {
                let queue = match existing {
                    Some(record) => {
                        // The peer now delivers for this client
                        if record.is_local() {
                            record.queue.clear();
                            info!(client_id, node, "Released persistent session to peer");
                        }
                        record.queue
                    }
                    None => OutboundQueue::new(client_id, self.queue_capacity),
                };
                state.sessions.insert(
                    client_id.to_string(),
                    SessionRecord::remote(client_id, node, queue),
                );
            }
            EventDetail::SessionDestroyed => {
                if existing.is_some_and(|r| !r.is_local()) {
                    state.drop_session(client_id);
                }
            }
            EventDetail::TopicSubscribed { topic, qos } => match existing {
                Some(record) if !record.is_local() => {
                    state.tree.insert(
                        client_id,
                        topic,
                        TreeSubscriber {
                            qos: *qos,
                            queue: record.queue,
                        },
                    );
                }
                _ => debug!(client_id, node, topic, "Skipping subscription for session not replicated here"),
            },
            EventDetail::TopicUnsubscribed { topic } => {
                if existing.is_some_and(|r| !r.is_local()) {
                    state.tree.remove(client_id, topic);
                }
            }
            EventDetail::TopicPublished { .. } => {}
        }
    }
}

#[async_trait]
impl EventHandler for SubscriptionRouter {
    async fn handle(&self, event: &Event) -> Result<()> {
        if event.node == self.node_id {
            self.apply_local(event).await
        } else {
            self.apply_remote(event).await;
            Ok(())
        }
    }
}
