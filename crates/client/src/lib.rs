//! Client side of Tether: keeps one chat session alive across an
//! unreliable WebSocket.
//!
//! Provides the connection manager actor, the message outbox, persistent
//! room tracking and network reachability monitoring.

pub mod manager;
pub mod network;
pub mod outbox;
mod pumps;
pub mod rooms;
pub mod types;
pub mod ws_client;

pub use manager::ConnectionManager;
pub use network::{InterfacePoller, InterfaceType, NetworkMonitor, NetworkStatus};
pub use outbox::{Outbox, OutboxEntry};
pub use rooms::{RoomMembershipRecord, RoomStoreError, RoomTracker};
pub use types::{BackgroundPolicy, ClientConfig, ClientEvent, DropReason, ReconnectConfig};
pub use ws_client::{
    ClientError, CloseReason, ConnectFuture, ConnectRequest, Connector, Link, LinkEvent,
    WsConnector,
};
