//! Cluster synchronization over a shared partitioned event log
//!
//! Every node appends its session and subscription changes to the log as JSON
//! arrays of [`ClusterNotification`]s and consumes everything the other nodes
//! append. A notification whose `launcherAddress` is one of our own addresses
//! is skipped, so a node never replays its own changes.
//!
//! The bus side never touches the log directly: [`ClusterSynchronizer::handle`]
//! hands the notification to a bounded inbox and a publisher task drains it.
//! A full inbox blocks the notifying session for at most `publish_timeout`;
//! after that the notification is dropped and a warning logged.

use crate::broker::config::ClusterConfig;
use crate::broker::event::{Event, EventDetail, EventHandler};
use crate::broker::router::SubscriptionRouter;
use crate::error::{MqttError, Result};
use crate::types::Message;
use crate::QoS;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Most notifications folded into one log record
const MAX_BATCH: usize = 64;

/// What the receiving node should do with the client's record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAction {
    Register,
    Unregister,
    /// Lookup request from management tooling; brokers ignore it
    Retrieve,
    Delete,
    Update,
}

/// Session state a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    Created,
    Resumed,
    Destroyed,
    Subscribed,
    Unsubscribed,
    Published,
}

/// One replicated change, as carried on the shared log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNotification {
    pub action: ClusterAction,
    pub client_id: String,
    pub state: NotificationState,
    /// Address of the node the change happened on
    pub launcher_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QoS>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
}

impl ClusterNotification {
    fn bare(action: ClusterAction, state: NotificationState, event: &Event) -> Self {
        Self {
            action,
            client_id: event.client_id.clone(),
            state,
            launcher_address: event.node.clone(),
            topic: None,
            qos: None,
            payload: None,
            persistent: None,
            retain: None,
        }
    }

    /// Builds the notification describing a local event
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        use ClusterAction as A;
        use NotificationState as S;

        match &event.detail {
            EventDetail::SessionCreated { persistent } => Self {
                persistent: Some(*persistent),
                ..Self::bare(A::Register, S::Created, event)
            },
            EventDetail::SessionResumed => Self::bare(A::Update, S::Resumed, event),
            EventDetail::SessionDestroyed => Self::bare(A::Unregister, S::Destroyed, event),
            EventDetail::TopicSubscribed { topic, qos } => Self {
                topic: Some(topic.clone()),
                qos: Some(*qos),
                ..Self::bare(A::Update, S::Subscribed, event)
            },
            EventDetail::TopicUnsubscribed { topic } => Self {
                topic: Some(topic.clone()),
                ..Self::bare(A::Delete, S::Unsubscribed, event)
            },
            EventDetail::TopicPublished { message } => Self {
                topic: Some(message.topic.clone()),
                qos: Some(message.qos),
                payload: Some(message.payload.to_vec()),
                retain: Some(message.retain),
                ..Self::bare(A::Update, S::Published, event)
            },
        }
    }

    /// The event to replay locally; `None` for actions brokers do not act on
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Serialization` when a field the state needs is missing
    pub fn to_event(&self) -> Result<Option<Event>> {
        if self.action == ClusterAction::Retrieve {
            return Ok(None);
        }

        let detail = match self.state {
            NotificationState::Created => EventDetail::SessionCreated {
                persistent: self.persistent.unwrap_or(false),
            },
            NotificationState::Resumed => EventDetail::SessionResumed,
            NotificationState::Destroyed => EventDetail::SessionDestroyed,
            NotificationState::Subscribed => EventDetail::TopicSubscribed {
                topic: self.require_topic()?,
                qos: self.qos.unwrap_or(QoS::AtMostOnce),
            },
            NotificationState::Unsubscribed => EventDetail::TopicUnsubscribed {
                topic: self.require_topic()?,
            },
            NotificationState::Published => {
                let payload = self.payload.clone().unwrap_or_default();
                let message = Message::new(
                    self.require_topic()?,
                    payload,
                    self.qos.unwrap_or(QoS::AtMostOnce),
                )
                .with_retain(self.retain.unwrap_or(false));
                EventDetail::TopicPublished { message }
            }
        };
        Ok(Some(Event::new(
            self.launcher_address.clone(),
            self.client_id.clone(),
            detail,
        )))
    }

    fn require_topic(&self) -> Result<String> {
        self.topic.clone().ok_or_else(|| {
            MqttError::Serialization(format!(
                "{:?} notification for {} has no topic",
                self.state, self.client_id
            ))
        })
    }
}

/// Encodes notifications as one log record value
///
/// # Errors
///
/// Returns an error if JSON serialization fails
pub fn encode_record(notifications: &[ClusterNotification]) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(notifications)?))
}

/// # Errors
///
/// Returns `MqttError::Serialization` for anything but a JSON array of notifications
pub fn decode_record(value: &[u8]) -> Result<Vec<ClusterNotification>> {
    Ok(serde_json::from_slice(value)?)
}

/// Stable partition of a client id
#[must_use]
pub fn partition_for(client_id: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(client_id.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % partitions.max(1)
}

/// One entry of the shared log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: Bytes,
}

/// Where a new consumer starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Earliest,
    Latest,
}

/// Partitioned append-only log shared by all nodes
#[async_trait]
pub trait EventLog: Send + Sync {
    fn partitions(&self) -> u32;

    /// Appends `value` to `partition`, returning its offset
    async fn append(&self, partition: u32, key: &str, value: Bytes) -> Result<u64>;

    /// Opens a consumer over every partition
    async fn consumer(&self, start: StartOffset) -> Result<Box<dyn LogConsumer>>;
}

/// Reader over all partitions of an [`EventLog`]
///
/// Records of one partition come back in offset order.
#[async_trait]
pub trait LogConsumer: Send {
    /// Waits for the next record
    async fn next(&mut self) -> Result<LogRecord>;
}

#[derive(Debug, Default)]
struct Partition {
    /// Offset of `records[0]`
    base: u64,
    records: VecDeque<LogRecord>,
}

#[derive(Debug)]
struct MemoryLogShared {
    partitions: Vec<Mutex<Partition>>,
    retention: usize,
    appended: watch::Sender<u64>,
}

impl MemoryLogShared {
    fn partition(&self, index: usize) -> MutexGuard<'_, Partition> {
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process [`EventLog`]
///
/// Clones share the same partitions, so several brokers in one process (or
/// one test) can form a cluster. Each partition keeps at most `retention`
/// records; a consumer that falls further behind skips ahead.
#[derive(Debug, Clone)]
pub struct MemoryEventLog {
    shared: Arc<MemoryLogShared>,
}

impl MemoryEventLog {
    pub const DEFAULT_RETENTION: usize = 100_000;

    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self::with_retention(partitions, Self::DEFAULT_RETENTION)
    }

    #[must_use]
    pub fn with_retention(partitions: u32, retention: usize) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            shared: Arc::new(MemoryLogShared {
                partitions: (0..partitions.max(1)).map(|_| Mutex::default()).collect(),
                retention: retention.max(1),
                appended,
            }),
        }
    }

    /// Records currently held in `partition`
    #[must_use]
    pub fn len(&self, partition: u32) -> usize {
        self.shared
            .partitions
            .get(partition as usize)
            .map_or(0, |p| p.lock().unwrap_or_else(PoisonError::into_inner).records.len())
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    fn partitions(&self) -> u32 {
        u32::try_from(self.shared.partitions.len()).unwrap_or(u32::MAX)
    }

    async fn append(&self, partition: u32, key: &str, value: Bytes) -> Result<u64> {
        let index = partition as usize;
        if index >= self.shared.partitions.len() {
            return Err(MqttError::Cluster(format!("no partition {partition}")));
        }

        let offset = {
            let mut part = self.shared.partition(index);
            let offset = part.base + part.records.len() as u64;
            part.records.push_back(LogRecord {
                partition,
                offset,
                key: key.to_string(),
                value,
            });
            while part.records.len() > self.shared.retention {
                part.records.pop_front();
                part.base += 1;
            }
            offset
        };
        self.shared.appended.send_modify(|count| *count += 1);
        Ok(offset)
    }

    async fn consumer(&self, start: StartOffset) -> Result<Box<dyn LogConsumer>> {
        let offsets = (0..self.shared.partitions.len())
            .map(|index| {
                let part = self.shared.partition(index);
                match start {
                    StartOffset::Earliest => part.base,
                    StartOffset::Latest => part.base + part.records.len() as u64,
                }
            })
            .collect();
        Ok(Box::new(MemoryLogConsumer {
            shared: Arc::clone(&self.shared),
            appended: self.shared.appended.subscribe(),
            offsets,
            next_partition: 0,
        }))
    }
}

struct MemoryLogConsumer {
    shared: Arc<MemoryLogShared>,
    appended: watch::Receiver<u64>,
    offsets: Vec<u64>,
    /// Round-robin start so one busy partition cannot starve the rest
    next_partition: usize,
}

impl MemoryLogConsumer {
    fn poll_partitions(&mut self) -> Option<LogRecord> {
        let count = self.offsets.len();
        for step in 0..count {
            let index = (self.next_partition + step) % count;
            let part = self.shared.partition(index);
            let wanted = self.offsets[index];
            if wanted < part.base {
                warn!(partition = index, skipped = part.base - wanted, "Consumer fell behind log retention");
            }
            let position = wanted.saturating_sub(part.base) as usize;
            if let Some(record) = part.records.get(position) {
                self.offsets[index] = record.offset + 1;
                self.next_partition = (index + 1) % count;
                return Some(record.clone());
            }
            self.offsets[index] = self.offsets[index].max(part.base);
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn next(&mut self) -> Result<LogRecord> {
        loop {
            // Mark the current version seen before scanning, so an append that
            // lands mid-scan still wakes the wait below
            self.appended.borrow_and_update();
            if let Some(record) = self.poll_partitions() {
                return Ok(record);
            }
            self.appended
                .changed()
                .await
                .map_err(|_| MqttError::Cluster("event log closed".to_string()))?;
        }
    }
}

/// Replicates local bus events to the log and replays remote ones
pub struct ClusterSynchronizer {
    node_id: String,
    outbox: mpsc::Sender<ClusterNotification>,
    publish_timeout: Duration,
    replicate_publishes: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusterSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSynchronizer")
            .field("node_id", &self.node_id)
            .field("replicate_publishes", &self.replicate_publishes)
            .finish_non_exhaustive()
    }
}

impl ClusterSynchronizer {
    /// Starts the publisher and consumer tasks
    ///
    /// `local_addresses` are the launcher addresses treated as our own, in
    /// addition to `node_id`. Consumption starts at the end of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the log refuses a consumer
    pub async fn start(
        config: &ClusterConfig,
        node_id: impl Into<String>,
        local_addresses: impl IntoIterator<Item = String>,
        log: Arc<dyn EventLog>,
        router: Arc<SubscriptionRouter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = node_id.into();
        let mut own: HashSet<String> = local_addresses.into_iter().collect();
        own.insert(node_id.clone());

        let (outbox, inbox) = mpsc::channel(config.inbox_capacity);
        let consumer = log.consumer(StartOffset::Latest).await?;

        let publisher = tokio::spawn(run_publisher(inbox, Arc::clone(&log)));
        let replayer = tokio::spawn(run_consumer(consumer, own, router));
        info!(node = %node_id, partitions = log.partitions(), "Cluster synchronizer started");

        Ok(Arc::new(Self {
            node_id,
            outbox,
            publish_timeout: config.publish_timeout,
            replicate_publishes: config.replicate_publishes,
            tasks: Mutex::new(vec![publisher, replayer]),
        }))
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stops both background tasks
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        debug!(node = %self.node_id, "Cluster synchronizer stopped");
    }
}

impl Drop for ClusterSynchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl EventHandler for ClusterSynchronizer {
    async fn handle(&self, event: &Event) -> Result<()> {
        if event.node != self.node_id {
            return Ok(());
        }
        if matches!(event.detail, EventDetail::TopicPublished { .. }) && !self.replicate_publishes {
            return Ok(());
        }

        let notification = ClusterNotification::from_event(event);
        match self.outbox.send_timeout(notification, self.publish_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(dropped)) => {
                warn!(
                    client_id = %dropped.client_id,
                    state = ?dropped.state,
                    "Replication inbox full, dropping notification"
                );
                Err(MqttError::Cluster("replication inbox full".to_string()))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(MqttError::Cluster("synchronizer stopped".to_string()))
            }
        }
    }
}

async fn run_publisher(mut inbox: mpsc::Receiver<ClusterNotification>, log: Arc<dyn EventLog>) {
    let partitions = log.partitions();
    while let Some(first) = inbox.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match inbox.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        // Order within a client id is kept because a client maps to one partition
        let mut by_partition: BTreeMap<u32, Vec<ClusterNotification>> = BTreeMap::new();
        for notification in batch {
            by_partition
                .entry(partition_for(&notification.client_id, partitions))
                .or_default()
                .push(notification);
        }

        for (partition, notifications) in by_partition {
            let key = notifications[0].client_id.clone();
            let appended = match encode_record(&notifications) {
                Ok(value) => log.append(partition, &key, value).await,
                Err(e) => Err(e),
            };
            match appended {
                Ok(offset) => trace!(partition, offset, count = notifications.len(), "Appended cluster record"),
                Err(e) => warn!(partition, count = notifications.len(), "Failed to append cluster record: {e}"),
            }
        }
    }
    debug!("Cluster publisher finished");
}

async fn run_consumer(
    mut consumer: Box<dyn LogConsumer>,
    own_addresses: HashSet<String>,
    router: Arc<SubscriptionRouter>,
) {
    loop {
        let record = match consumer.next().await {
            Ok(record) => record,
            Err(e) => {
                error!("Cluster log consumer stopped: {e}");
                return;
            }
        };
        let notifications = match decode_record(&record.value) {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!(partition = record.partition, offset = record.offset, "Skipping undecodable cluster record: {e}");
                continue;
            }
        };

        for notification in notifications {
            if own_addresses.contains(&notification.launcher_address) {
                continue;
            }
            match notification.to_event() {
                Ok(Some(event)) => {
                    debug!(
                        client_id = %event.client_id,
                        node = %event.node,
                        kind = %event.kind(),
                        "Applying remote event"
                    );
                    router.apply_remote(&event).await;
                }
                Ok(None) => {}
                Err(e) => warn!(client_id = %notification.client_id, "Bad cluster notification: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::stats::BrokerStats;
    use proptest::prelude::*;

    fn router(node: &str) -> Arc<SubscriptionRouter> {
        Arc::new(SubscriptionRouter::new(node, 100, Arc::new(BrokerStats::new())))
    }

    fn single_partition() -> ClusterConfig {
        ClusterConfig {
            partitions: 1,
            ..ClusterConfig::default()
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_notification_wire_shape() {
        let event = Event::new("10.0.0.1:1883", "c1", EventDetail::SessionCreated { persistent: true });
        let json = serde_json::to_value(ClusterNotification::from_event(&event)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "action": "register",
                "clientId": "c1",
                "state": "created",
                "launcherAddress": "10.0.0.1:1883",
                "persistent": true
            })
        );
    }

    #[test]
    fn test_actions_per_state() {
        let cases = [
            (EventDetail::SessionResumed, ClusterAction::Update),
            (EventDetail::SessionDestroyed, ClusterAction::Unregister),
            (
                EventDetail::TopicSubscribed { topic: "a".into(), qos: QoS::AtLeastOnce },
                ClusterAction::Update,
            ),
            (EventDetail::TopicUnsubscribed { topic: "a".into() }, ClusterAction::Delete),
        ];
        for (detail, action) in cases {
            let event = Event::new("n1", "c1", detail);
            let notification = ClusterNotification::from_event(&event);
            assert_eq!(notification.action, action);
            assert_eq!(notification.to_event().unwrap(), Some(event));
        }
    }

    #[test]
    fn test_decode_record_from_other_producers() {
        let raw = br#"[{"action":"retrieve","clientId":"c9","state":"created","launcherAddress":"x"},
                       {"action":"update","clientId":"c9","state":"published","launcherAddress":"x",
                        "topic":"t","qos":1,"payload":[104,105],"retain":true}]"#;
        let notifications = decode_record(raw).unwrap();
        assert_eq!(notifications[0].to_event().unwrap(), None);

        let event = notifications[1].to_event().unwrap().unwrap();
        let EventDetail::TopicPublished { message } = event.detail else {
            panic!("expected publish");
        };
        assert_eq!(message.payload, Bytes::from_static(b"hi"));
        assert!(message.retain);
        assert_eq!(message.qos, QoS::AtLeastOnce);

        assert!(decode_record(b"{\"not\":\"an array\"}").is_err());
    }

    #[test]
    fn test_subscribed_without_topic_is_rejected() {
        let raw = br#"[{"action":"update","clientId":"c","state":"subscribed","launcherAddress":"x"}]"#;
        let notifications = decode_record(raw).unwrap();
        assert!(matches!(notifications[0].to_event(), Err(MqttError::Serialization(_))));
    }

    proptest! {
        #[test]
        fn prop_partition_stable_and_in_range(client_id in "[a-zA-Z0-9_-]{1,32}", partitions in 1u32..64) {
            let partition = partition_for(&client_id, partitions);
            prop_assert!(partition < partitions);
            prop_assert_eq!(partition, partition_for(&client_id, partitions));
        }
    }

    #[tokio::test]
    async fn test_memory_log_ordering_and_start_offsets() {
        let log = MemoryEventLog::new(2);
        log.append(0, "a", Bytes::from_static(b"1")).await.unwrap();
        log.append(0, "a", Bytes::from_static(b"2")).await.unwrap();

        let mut earliest = log.consumer(StartOffset::Earliest).await.unwrap();
        let mut latest = log.consumer(StartOffset::Latest).await.unwrap();
        log.append(1, "b", Bytes::from_static(b"3")).await.unwrap();

        let first = earliest.next().await.unwrap();
        assert_eq!((first.partition, first.offset, &first.value[..]), (0, 0, &b"1"[..]));
        let second = earliest.next().await.unwrap();
        assert_eq!(second.offset, 1);

        let only = latest.next().await.unwrap();
        assert_eq!((only.partition, &only.value[..]), (1, &b"3"[..]));

        assert!(log.append(7, "x", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_log_retention() {
        let log = MemoryEventLog::with_retention(1, 2);
        let mut consumer = log.consumer(StartOffset::Earliest).await.unwrap();
        for value in [&b"1"[..], b"2", b"3"] {
            log.append(0, "k", Bytes::copy_from_slice(value)).await.unwrap();
        }
        assert_eq!(log.len(0), 2);
        assert_eq!(consumer.next().await.unwrap().offset, 1);
        assert_eq!(consumer.next().await.unwrap().offset, 2);
    }

    #[tokio::test]
    async fn test_two_nodes_converge() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(4));
        let router_a = router("node-a");
        let router_b = router("node-b");
        let sync_a = ClusterSynchronizer::start(
            &ClusterConfig::default(),
            "node-a",
            Vec::new(),
            Arc::clone(&log),
            Arc::clone(&router_a),
        )
        .await
        .unwrap();
        let _sync_b = ClusterSynchronizer::start(
            &ClusterConfig::default(),
            "node-b",
            Vec::new(),
            Arc::clone(&log),
            Arc::clone(&router_b),
        )
        .await
        .unwrap();

        for detail in [
            EventDetail::SessionCreated { persistent: true },
            EventDetail::TopicSubscribed { topic: "x/+".into(), qos: QoS::AtLeastOnce },
        ] {
            sync_a.handle(&Event::new("node-a", "dev1", detail)).await.unwrap();
        }

        eventually(|| async { router_b.subscription_count().await == 1 }).await;
        let record = router_b.find_session("dev1").await.unwrap();
        assert_eq!(record.owner, crate::broker::router::SessionOwner::Remote("node-a".into()));
    }

    #[tokio::test]
    async fn test_own_notifications_are_skipped() {
        let log = MemoryEventLog::new(1);
        let router_a = router("node-a");
        let _sync = ClusterSynchronizer::start(
            &single_partition(),
            "node-a",
            vec!["10.0.0.1:1883".to_string()],
            Arc::new(log.clone()),
            Arc::clone(&router_a),
        )
        .await
        .unwrap();

        let own = ClusterNotification::from_event(&Event::new(
            "10.0.0.1:1883",
            "mine",
            EventDetail::SessionCreated { persistent: true },
        ));
        let foreign = ClusterNotification::from_event(&Event::new(
            "node-b",
            "theirs",
            EventDetail::SessionCreated { persistent: true },
        ));
        log.append(0, "mine", encode_record(&[own]).unwrap()).await.unwrap();
        log.append(0, "theirs", encode_record(&[foreign]).unwrap()).await.unwrap();

        // Records of one partition are applied in order
        eventually(|| async { router_a.find_session("theirs").await.is_some() }).await;
        assert!(router_a.find_session("mine").await.is_none());
    }

    #[tokio::test]
    async fn test_replayed_record_is_idempotent() {
        let log = MemoryEventLog::new(1);
        let router_a = router("node-a");
        let _sync = ClusterSynchronizer::start(
            &single_partition(),
            "node-a",
            Vec::new(),
            Arc::new(log.clone()),
            Arc::clone(&router_a),
        )
        .await
        .unwrap();

        let record = encode_record(&[
            ClusterNotification::from_event(&Event::new(
                "node-b",
                "r1",
                EventDetail::SessionCreated { persistent: true },
            )),
            ClusterNotification::from_event(&Event::new(
                "node-b",
                "r1",
                EventDetail::TopicSubscribed { topic: "t/#".into(), qos: QoS::AtMostOnce },
            )),
        ])
        .unwrap();
        log.append(0, "r1", record.clone()).await.unwrap();
        log.append(0, "r1", record).await.unwrap();
        let marker = encode_record(&[ClusterNotification::from_event(&Event::new(
            "node-b",
            "marker",
            EventDetail::SessionCreated { persistent: true },
        ))])
        .unwrap();
        log.append(0, "marker", marker).await.unwrap();

        eventually(|| async { router_a.find_session("marker").await.is_some() }).await;
        assert_eq!(router_a.subscription_count().await, 1);
        assert_eq!(router_a.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_publishes_not_replicated_when_disabled() {
        let log = MemoryEventLog::new(1);
        let config = ClusterConfig {
            replicate_publishes: false,
            ..single_partition()
        };
        let sync = ClusterSynchronizer::start(&config, "node-a", Vec::new(), Arc::new(log.clone()), router("node-a"))
            .await
            .unwrap();

        let message = Message::new("t", Bytes::from_static(b"x"), QoS::AtMostOnce);
        sync.handle(&Event::new("node-a", "c", EventDetail::TopicPublished { message }))
            .await
            .unwrap();
        sync.handle(&Event::new("node-a", "c", EventDetail::SessionDestroyed))
            .await
            .unwrap();

        let mut consumer = log.consumer(StartOffset::Earliest).await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        let notifications = decode_record(&record.value).unwrap();
        assert!(notifications.iter().all(|n| n.state == NotificationState::Destroyed));
    }
}
