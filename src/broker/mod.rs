//! MQTT broker
//!
//! The broker is assembled from a few cooperating parts:
//!
//! - [`server::MqttBroker`] binds the TCP, TLS and WebSocket listeners and
//!   spawns one [`client_handler::ClientHandler`] per connection.
//! - [`router::SubscriptionRouter`] owns the session registry, the
//!   subscription tree and the retained messages.
//! - [`event::EventBus`] carries session and subscription events from the
//!   handlers to the router and to the [`cluster::ClusterSynchronizer`],
//!   which replicates them to peer brokers over a partitioned event log.
//!
//! # Example
//!
//! ```rust,no_run
//! use sentel_broker::broker::MqttBroker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut broker = MqttBroker::bind("0.0.0.0:1883").await?;
//!     let handle = broker.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.shutdown();
//!     });
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod acl;
pub mod auth;
pub mod client_handler;
pub mod cluster;
pub mod config;
pub mod event;
pub mod router;
pub mod server;
pub mod stats;
pub mod tls_acceptor;
pub mod topic_tree;
pub mod transport;
pub mod websocket_server;

pub use acl::{AclManager, AclRule, Permission};
pub use auth::{AclAuthProvider, Action, AllowAllAuthProvider, AuthOptions, AuthProvider, AuthResult};
pub use cluster::{ClusterNotification, ClusterSynchronizer, EventLog, MemoryEventLog};
pub use config::{BrokerConfig, ClusterConfig, TlsConfig, WebSocketConfig};
pub use event::{Event, EventBus, EventDetail, EventHandler, EventKind, EventMask};
pub use router::{SessionOwner, SessionRecord, SubscriptionRouter};
pub use server::{MqttBroker, ShutdownHandle};
pub use stats::{BrokerStats, StatsSnapshot};

pub use crate::QoS;
