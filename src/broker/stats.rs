//! Broker counters
//!
//! Plain atomics updated from session loops and the router. Readers take a
//! [`StatsSnapshot`] for a consistent-enough view.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Statistics tracked by the broker
#[derive(Debug)]
pub struct BrokerStats {
    pub start_time: SystemTime,
    /// Sessions currently past CONNECT
    pub clients_connected: AtomicUsize,
    /// Sessions accepted since start
    pub clients_total: AtomicU64,
    /// Peak of `clients_connected`
    pub clients_maximum: AtomicUsize,
    /// Open transport connections, with or without a CONNECT
    pub connections_open: AtomicUsize,
    /// Connections refused because of `max_clients`
    pub connections_rejected: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub publish_received: AtomicU64,
    pub publish_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Messages lost to full outbound queues
    pub messages_dropped: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub clients_connected: usize,
    pub clients_total: u64,
    pub clients_maximum: usize,
    pub connections_open: usize,
    pub connections_rejected: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub publish_received: u64,
    pub publish_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_dropped: u64,
}

impl BrokerStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            clients_connected: AtomicUsize::new(0),
            clients_total: AtomicU64::new(0),
            clients_maximum: AtomicUsize::new(0),
            connections_open: AtomicUsize::new(0),
            connections_rejected: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            publish_received: AtomicU64::new(0),
            publish_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn client_connected(&self) {
        let current = self.clients_connected.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients_total.fetch_add(1, Ordering::Relaxed);
        self.clients_maximum.fetch_max(current, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reserves a connection slot; `false` when `max_clients` are already open
    pub fn try_open_connection(&self, max_clients: usize) -> bool {
        let reserved = self
            .connections_open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < max_clients).then_some(open + 1)
            })
            .is_ok();
        if !reserved {
            self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        }
        reserved
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn publish_received(&self, bytes: usize) {
        self.publish_received.fetch_add(1, Ordering::Relaxed);
        self.message_received(bytes);
    }

    pub fn message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn publish_sent(&self, bytes: usize) {
        self.publish_sent.fetch_add(1, Ordering::Relaxed);
        self.message_sent(bytes);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().unwrap_or_default().as_secs()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_total: self.clients_total.load(Ordering::Relaxed),
            clients_maximum: self.clients_maximum.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            publish_received: self.publish_received.load(Ordering::Relaxed),
            publish_sent: self.publish_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self::new()
    }
}
