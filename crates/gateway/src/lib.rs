//! WebSocket gateway for Tether chat sessions.
//!
//! Accepts client sockets, authenticates them during the HTTP upgrade,
//! tracks each one in the [`ConnectionRegistry`], keeps them alive with an
//! adaptive heartbeat, restores room membership after reconnects, and
//! forwards room traffic through a cross-process [`Fabric`]. Broadcasts
//! that cannot be published while the fabric is down are parked in the
//! [`BroadcastRetryQueue`].

mod auth;
mod connection;
mod fabric;
pub mod registry;
pub mod retry_queue;
mod server;

pub use auth::{AuthError, Authenticator, StaticTokenAuthenticator};
pub use connection::Sender;
pub use fabric::{Fabric, FabricEnvelope, FabricError, FabricEvent, FabricFuture, LocalFabric};
pub use registry::{Connection, ConnectionRegistry, Registration, RegistryError};
pub use retry_queue::{
    BroadcastRetryQueue, ResubscribePolicy, RetryEnvelope, RetryError, RetryQueueStats,
    batch_resubscribe_rooms,
};
pub use server::{Gateway, GatewayConfig, GatewayContext};

/// Per-connection outbound buffer.
///
/// Sized for bursts of room fanout; a full buffer drops the frame with a
/// warning instead of stalling the sender.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("invalid bind address: {0}")]
    InvalidAddress(String),
}
