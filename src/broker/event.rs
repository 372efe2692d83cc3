//! In-process event bus
//!
//! Sessions describe what happened to them as [`Event`]s; the subscription
//! router and the cluster synchronizer react to those without the session
//! holding a reference to either. Dispatch runs on the notifying task: every
//! matching handler is awaited in registration order before `notify` returns.

use crate::error::Result;
use crate::types::Message;
use crate::QoS;
use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{trace, warn};

/// Event type bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    SessionCreated = 0x0001,
    SessionDestroyed = 0x0002,
    TopicPublished = 0x0008,
    TopicSubscribed = 0x0010,
    TopicUnsubscribed = 0x0100,
    SessionResumed = 0x0400,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::SessionCreated,
        EventKind::SessionDestroyed,
        EventKind::TopicPublished,
        EventKind::TopicSubscribed,
        EventKind::TopicUnsubscribed,
        EventKind::SessionResumed,
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.bits() == bits)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::SessionCreated => "session-created",
            EventKind::SessionDestroyed => "session-destroyed",
            EventKind::TopicPublished => "topic-published",
            EventKind::TopicSubscribed => "topic-subscribed",
            EventKind::TopicUnsubscribed => "topic-unsubscribed",
            EventKind::SessionResumed => "session-resumed",
        };
        f.write_str(name)
    }
}

/// Set of event kinds a handler is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const ALL: EventMask = EventMask(0x0001 | 0x0002 | 0x0008 | 0x0010 | 0x0100 | 0x0400);

    #[must_use]
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bits() != 0
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        EventMask(kind.bits())
    }
}

impl BitOr for EventKind {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        EventMask(self.bits() | rhs.bits())
    }
}

impl BitOr<EventKind> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        EventMask(self.0 | rhs.bits())
    }
}

/// Payload of an event, one variant per kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDetail {
    SessionCreated { persistent: bool },
    SessionDestroyed,
    SessionResumed,
    TopicSubscribed { topic: String, qos: QoS },
    TopicUnsubscribed { topic: String },
    TopicPublished { message: Message },
}

impl EventDetail {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventDetail::SessionCreated { .. } => EventKind::SessionCreated,
            EventDetail::SessionDestroyed => EventKind::SessionDestroyed,
            EventDetail::SessionResumed => EventKind::SessionResumed,
            EventDetail::TopicSubscribed { .. } => EventKind::TopicSubscribed,
            EventDetail::TopicUnsubscribed { .. } => EventKind::TopicUnsubscribed,
            EventDetail::TopicPublished { .. } => EventKind::TopicPublished,
        }
    }
}

/// A session or topic change, stamped with the node it happened on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Originating node id
    pub node: String,
    pub client_id: String,
    pub detail: EventDetail,
}

impl Event {
    #[must_use]
    pub fn new(node: impl Into<String>, client_id: impl Into<String>, detail: EventDetail) -> Self {
        Self {
            node: node.into(),
            client_id: client_id.into(),
            detail,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.detail.kind()
    }
}

/// Receiver of bus events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event
    ///
    /// # Errors
    ///
    /// Errors are logged by the bus; they never reach the notifying session
    async fn handle(&self, event: &Event) -> Result<()>;
}

type Registration = (EventMask, Arc<dyn EventHandler>);

/// Subscriber list plus synchronous dispatch
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every kind in `mask`
    pub fn subscribe(&self, mask: impl Into<EventMask>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((mask.into(), handler));
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers `event` to every matching handler, in registration order
    pub async fn notify(&self, event: &Event) {
        let kind = event.kind();
        let matching: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(mask, _)| mask.contains(kind))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        trace!(%kind, client_id = %event.client_id, handlers = matching.len(), "Dispatching event");
        for handler in matching {
            if let Err(e) = handler.handle(event).await {
                warn!(%kind, client_id = %event.client_id, "Event handler failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqttError;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &Event) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.kind()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &Event) -> Result<()> {
            Err(MqttError::Cluster("log unavailable".into()))
        }
    }

    #[test]
    fn test_kind_bits() {
        assert_eq!(EventKind::SessionCreated.bits(), 0x1);
        assert_eq!(EventKind::SessionDestroyed.bits(), 0x2);
        assert_eq!(EventKind::TopicPublished.bits(), 0x8);
        assert_eq!(EventKind::TopicSubscribed.bits(), 0x10);
        assert_eq!(EventKind::TopicUnsubscribed.bits(), 0x100);
        assert_eq!(EventKind::SessionResumed.bits(), 0x400);
        assert_eq!(EventKind::from_bits(0x400), Some(EventKind::SessionResumed));
        assert_eq!(EventKind::from_bits(0x200), None);
    }

    #[test]
    fn test_mask() {
        let mask = EventKind::TopicSubscribed | EventKind::TopicUnsubscribed;
        assert!(mask.contains(EventKind::TopicSubscribed));
        assert!(!mask.contains(EventKind::TopicPublished));
        let mask = mask | EventKind::TopicPublished;
        assert!(mask.contains(EventKind::TopicPublished));
        for kind in EventKind::ALL {
            assert!(EventMask::ALL.contains(kind));
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.subscribe(
            EventMask::ALL,
            Arc::new(Recorder { name: "router", log: Arc::clone(&log) }),
        );
        bus.subscribe(EventKind::SessionCreated, Arc::new(Failing));
        bus.subscribe(
            EventKind::SessionCreated | EventKind::SessionDestroyed,
            Arc::new(Recorder { name: "cluster", log: Arc::clone(&log) }),
        );

        bus.notify(&Event::new(
            "n1",
            "c1",
            EventDetail::SessionCreated { persistent: false },
        ))
        .await;
        bus.notify(&Event::new(
            "n1",
            "c1",
            EventDetail::TopicUnsubscribed { topic: "a".into() },
        ))
        .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "router:session-created",
                "cluster:session-created",
                "router:topic-unsubscribed"
            ]
        );
    }
}
