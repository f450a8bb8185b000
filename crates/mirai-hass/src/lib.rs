//! Home Assistant WebSocket connector
//!
//! Maintains the authenticated control channel to a Home Assistant
//! instance: auth handshake, event subscription, outbound command frames
//! with connector-assigned message ids, and reconnection with a fixed
//! backoff. Inbound events are normalized and published on `"ha:events"`.

mod connector;
mod protocol;

pub use connector::{CommandSender, ConnectorState, HaConnector};
pub use protocol::MessageIdAllocator;
