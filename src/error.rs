use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Broker errors
///
/// Every fallible operation in the crate returns one of these variants. The
/// session loop never inspects error text: it asks [`MqttError::is_session_fatal`]
/// whether to keep serving the connection or tear it down.
///
/// # Error Categories
///
/// - **Transport**: `Io`, `ConnectionError`, `ClientClosed`, `Timeout`
/// - **Decode**: `MalformedPacket`, `InvalidPacketType`, `PacketTooLarge`, `ProtocolError`
/// - **CONNECT**: `UnknownProtocol`, `UnsupportedProtocolVersion`, `ClientIdentifierNotValid`,
///   `InvalidCredentials`, `AuthenticationFailed`
/// - **Per-operation**: `NotAuthorized`, `QoSNotSupported`, `InvalidTopicFilter`
/// - **Cluster**: `Cluster`, `Serialization`
#[derive(Error, Debug, Clone)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Unknown protocol name: {0}")]
    UnknownProtocol(String),

    #[error("Unsupported protocol version")]
    UnsupportedProtocolVersion,

    #[error("Client identifier not valid")]
    ClientIdentifierNotValid,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("QoS not supported")]
    QoSNotSupported,

    #[error("Timeout")]
    Timeout,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Client closed connection")]
    ClientClosed,

    #[error("Session taken over by a new connection")]
    SessionTakenOver,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MqttError {
    /// Whether the error ends the session that produced it.
    ///
    /// Authorization refusals and the unsupported QoS 2 publish only fail the
    /// single operation; everything else tears the connection down.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, MqttError::NotAuthorized | MqttError::QoSNotSupported)
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MqttError {
    fn from(err: serde_json::Error) -> Self {
        MqttError::Serialization(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MqttError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MqttError::ConnectionError(format!("Channel send error: {err}"))
    }
}
