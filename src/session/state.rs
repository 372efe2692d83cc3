use crate::error::{MqttError, Result};
use std::fmt;

/// Connection lifecycle of one session
///
/// `New -> Connected -> Disconnecting -> Disconnected`; any state may jump
/// straight to `Disconnected` on a transport error or keepalive expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connected,
    Disconnecting,
    Disconnected,
}

impl SessionState {
    /// Checks that moving to `next` is a legal transition
    ///
    /// # Errors
    ///
    /// Returns `MqttError::InvalidState` for transitions the lifecycle forbids
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        let allowed = matches!(
            (self, next),
            (SessionState::New, SessionState::Connected)
                | (SessionState::Connected, SessionState::Disconnecting)
                | (
                    SessionState::New | SessionState::Connected | SessionState::Disconnecting,
                    SessionState::Disconnected
                )
        );
        if allowed {
            Ok(next)
        } else {
            Err(MqttError::InvalidState(format!("{self} -> {next}")))
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Outbound delivery sub-state
///
/// While `WaitingAck` the head of the outbound queue is a `QoS` 1 message that
/// was written but not acknowledged, and nothing else is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Queued,
    WaitingAck { packet_id: u16 },
}
