pub mod mountpoint;
pub mod queue;
pub mod state;

pub use mountpoint::Mountpoint;
pub use queue::OutboundQueue;
pub use state::{MessageState, SessionState};
