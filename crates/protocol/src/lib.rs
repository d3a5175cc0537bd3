//! Wire protocol shared by the Tether gateway and its clients.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod state;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use messages::{ResubscribeAck, ResubscribeBatch, RoomMessage, RoomRef, Welcome};
pub use state::{ConnectionState, TransitionError};
pub use types::{ConnectionId, RoomId, UserId};
