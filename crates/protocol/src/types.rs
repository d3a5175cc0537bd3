/// Identifier of a chat room. Opaque to this protocol.
pub type RoomId = String;

/// Identifier the gateway assigns to each accepted socket.
pub type ConnectionId = uuid::Uuid;

/// Identifier of an authenticated user, as produced by the auth service.
pub type UserId = String;
