//! # Sentel MQTT broker
//!
//! A multi-tenant MQTT 3.1/3.1.1 broker. Each accepted connection runs its own
//! session loop; published messages are routed through a shared subscription
//! router and replicated to peer brokers over a partitioned cluster event log.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sentel_broker::broker::{BrokerConfig, MqttBroker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default().with_bind_address("0.0.0.0:1883".parse::<std::net::SocketAddr>()?);
//!     let mut broker = MqttBroker::with_config(config).await?;
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod broker;
pub mod codec;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod flags;
pub mod packet;
pub mod session;
pub mod topic_matching;
pub mod transport;
pub mod types;
pub mod validation;

pub use codec::PacketCodec;
pub use error::{MqttError, Result};
pub use packet::publish::PublishPacket;
pub use packet::{FixedHeader, MqttPacket, Packet, PacketType};
pub use types::{Message, ProtocolVersion, WillMessage};
pub use validation::{is_valid_topic_filter, is_valid_topic_name, topic_matches_filter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Validating conversion used by the decoders; 3 is a protocol violation
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<u8> for QoS {
    fn from(value: u8) -> Self {
        // Default to QoS 0 for invalid values
        QoS::from_wire(value).unwrap_or(QoS::AtMostOnce)
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}
