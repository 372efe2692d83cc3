//! Broker configuration
//!
//! Plain serde structs with builder helpers. The CLI deserializes them from a
//! JSON file; embedders build them in code.

use crate::constants::limits::MAX_PACKET_SIZE;
use crate::constants::time::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_INBOX_SEND_TIMEOUT};
use crate::error::{MqttError, Result};
use crate::session::queue::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct BrokerConfig {
    /// Identity stamped on cluster notifications; empty means "use the TCP bind address"
    pub node_id: String,

    /// TCP listener address
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent clients
    pub max_clients: usize,

    /// Maximum remaining length of an inbound packet
    pub max_packet_size: u32,

    /// Maximum PUBLISH payload size; 0 disables the check
    pub message_size_limit: usize,

    /// Time a new connection has to send CONNECT
    pub connect_timeout: Duration,

    /// Deliver at the subscription `QoS` even when the publish used a lower one
    pub upgrade_outgoing_qos: bool,

    /// Admit CONNECTs without a username
    pub allow_anonymous: bool,

    /// Topic prefix applied to every session
    pub mountpoint: String,

    /// Maximum messages buffered per session
    pub queue_capacity: usize,

    /// Capacity of each session's inbound packet inbox
    pub inbox_capacity: usize,

    /// Cluster replication settings
    pub cluster: ClusterConfig,

    /// TLS configuration
    pub tls_config: Option<TlsConfig>,

    /// WebSocket configuration
    pub websocket_config: Option<WebSocketConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_clients: 10000,
            max_packet_size: MAX_PACKET_SIZE,
            message_size_limit: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upgrade_outgoing_qos: false,
            allow_anonymous: true,
            mountpoint: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            inbox_capacity: 32,
            cluster: ClusterConfig::default(),
            tls_config: None,
            websocket_config: None,
        }
    }
}

impl BrokerConfig {
    /// Creates a new broker configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file; absent fields keep their defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MqttError::Configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            MqttError::Configuration(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    /// The node identity used as cluster origin
    #[must_use]
    pub fn effective_node_id(&self) -> String {
        if self.node_id.is_empty() {
            self.bind_address.to_string()
        } else {
            self.node_id.clone()
        }
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Sets the bind address
    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Sets the maximum number of concurrent clients
    #[must_use]
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Sets the maximum packet size
    #[must_use]
    pub fn with_max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    #[must_use]
    pub fn with_message_size_limit(mut self, limit: usize) -> Self {
        self.message_size_limit = limit;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_upgrade_outgoing_qos(mut self, upgrade: bool) -> Self {
        self.upgrade_outgoing_qos = upgrade;
        self
    }

    #[must_use]
    pub fn with_allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    #[must_use]
    pub fn with_mountpoint(mut self, mountpoint: impl Into<String>) -> Self {
        self.mountpoint = mountpoint.into();
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Sets the TLS configuration
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls_config = Some(tls);
        self
    }

    /// Sets the WebSocket configuration
    #[must_use]
    pub fn with_websocket(mut self, ws: WebSocketConfig) -> Self {
        self.websocket_config = Some(ws);
        self
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid
    pub fn validate(&self) -> Result<&Self> {
        if self.max_clients == 0 {
            return Err(MqttError::Configuration(
                "max_clients must be greater than 0".to_string(),
            ));
        }

        if self.max_packet_size < 1024 || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(MqttError::Configuration(format!(
                "max_packet_size must be between 1024 and {MAX_PACKET_SIZE}"
            )));
        }

        if self.queue_capacity == 0 || self.inbox_capacity == 0 {
            return Err(MqttError::Configuration(
                "queue_capacity and inbox_capacity must be greater than 0".to_string(),
            ));
        }

        if self.mountpoint.contains(['+', '#']) {
            return Err(MqttError::Configuration(
                "mountpoint must not contain wildcards".to_string(),
            ));
        }

        self.cluster.validate()?;
        Ok(self)
    }
}

/// Cluster replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of partitions of the shared session topic
    pub partitions: u32,

    /// Capacity of the outbound replication inbox
    pub inbox_capacity: usize,

    /// How long a producer blocks on a full inbox before the event is dropped
    pub publish_timeout: Duration,

    /// Also replicate PUBLISH events so remote subscribers receive them
    pub replicate_publishes: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            inbox_capacity: 1024,
            publish_timeout: DEFAULT_INBOX_SEND_TIMEOUT,
            replicate_publishes: true,
        }
    }
}

impl ClusterConfig {
    /// # Errors
    ///
    /// Returns an error if the partition count or inbox capacity is zero
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(MqttError::Configuration(
                "cluster.partitions must be greater than 0".to_string(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(MqttError::Configuration(
                "cluster.inbox_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_file: PathBuf,

    /// Path to private key file
    pub key_file: PathBuf,

    /// Path to CA certificate file
    pub ca_file: Option<PathBuf>,

    /// Whether to require client certificates
    pub require_client_cert: bool,

    /// TLS listener address
    pub bind_address: SocketAddr,
}

impl TlsConfig {
    /// Creates a new TLS configuration listening on port 8883
    #[must_use]
    pub fn new(cert_file: PathBuf, key_file: PathBuf) -> Self {
        Self {
            cert_file,
            key_file,
            ca_file: None,
            require_client_cert: false,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8883)),
        }
    }

    /// Sets the CA certificate file
    #[must_use]
    pub fn with_ca_file(mut self, ca_file: PathBuf) -> Self {
        self.ca_file = Some(ca_file);
        self
    }

    /// Sets whether to require client certificates
    #[must_use]
    pub fn with_require_client_cert(mut self, require: bool) -> Self {
        self.require_client_cert = require;
        self
    }

    /// Sets the TLS bind address
    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.bind_address = addr.into();
        self
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// WebSocket listener address
    pub bind_address: SocketAddr,

    /// Path for WebSocket connections
    pub path: String,

    /// Subprotocol name
    pub subprotocol: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: "/mqtt".to_string(),
            subprotocol: "mqtt".to_string(),
        }
    }
}

impl WebSocketConfig {
    /// Creates a new WebSocket configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind address
    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Sets the WebSocket path
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}
