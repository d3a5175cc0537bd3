//! Per-socket task: handshake bookkeeping, adaptive heartbeat, dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_FORBIDDEN, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_IMPLEMENTED, WS_ERR_CODE_TOO_LARGE,
};
use tether_protocol::{
    ConnectionId, ConnectionState, Message, ResubscribeAck, ResubscribeBatch, RoomId,
    RoomMessage, RoomRef, UserId, Welcome,
};

use crate::SEND_BUFFER_SIZE;
use crate::fabric::FabricEnvelope;
use crate::retry_queue::{RetryEnvelope, batch_resubscribe_rooms};
use crate::server::{GatewayConfig, GatewayContext};

/// Upper bound on the client-supplied reconnect hint.
const MAX_ATTEMPT_HINT: u32 = 64;

/// Handle for queueing frames to one socket.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the buffer is full or the socket is gone.
    pub fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        let json = msg.to_json().map_err(|_| SendError)?;
        self.send_text(json)
    }

    /// Sends pre-serialized JSON text.
    pub fn send_text(&self, json: String) -> Result<(), SendError> {
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            warn!("send buffer full or closed, dropping frame");
            SendError
        })
    }

    /// Sends an error response for the given request.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(&req.reply_error(code, message))
    }

    fn send_ws(&self, frame: WsMessage) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|_| SendError)
    }

    /// Returns `true` if the socket is still writable.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send buffer is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

struct Peer {
    sender: Sender,
    cancel: CancellationToken,
}

/// Live sockets on this node, for local fanout and admin actions.
#[derive(Default)]
pub(crate) struct Peers {
    map: Mutex<HashMap<ConnectionId, Peer>>,
}

impl Peers {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Peer>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: ConnectionId, sender: Sender, cancel: CancellationToken) {
        self.lock().insert(id, Peer { sender, cancel });
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.lock().keys().copied().collect()
    }

    /// Cancels one socket's task. Returns `false` if it is not here.
    pub(crate) fn close(&self, id: ConnectionId) -> bool {
        match self.lock().get(&id) {
            Some(peer) => {
                peer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&self) {
        for peer in self.lock().values() {
            peer.cancel.cancel();
        }
    }

    /// Queues `payload` to every listed connection except `exclude`.
    /// Returns how many sockets accepted it.
    pub(crate) fn deliver(
        &self,
        targets: &[ConnectionId],
        payload: &str,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let map = self.lock();
        targets
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| map.get(id))
            .filter(|peer| peer.sender.send_text(payload.to_string()).is_ok())
            .count()
    }
}

/// Adaptive keepalive policy for one connection.
///
/// The ping interval doubles while the link looks unhealthy (many recent
/// reconnects or a slow round trip). A run of healthy pongs while `ready`
/// earns a reset of the reconnect counter.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    base: Duration,
    rtt_threshold: Duration,
    attempts_threshold: u32,
    stable_pongs: u32,
    healthy_streak: u32,
}

impl Heartbeat {
    pub(crate) fn new(config: &GatewayConfig) -> Self {
        Self {
            base: config.ping_interval,
            rtt_threshold: config.rtt_threshold,
            attempts_threshold: config.attempts_threshold,
            stable_pongs: config.stable_pongs.max(1),
            healthy_streak: 0,
        }
    }

    pub(crate) fn interval(&self, attempts: u32, rtt: Option<Duration>) -> Duration {
        let slow_link = rtt.is_some_and(|rtt| rtt >= self.rtt_threshold);
        if attempts >= self.attempts_threshold || slow_link {
            self.base.saturating_mul(2)
        } else {
            self.base
        }
    }

    /// Feeds one pong. Returns `true` when the reconnect counter should be
    /// reset.
    pub(crate) fn on_pong(&mut self, rtt: Option<Duration>, ready: bool) -> bool {
        let healthy = ready && rtt.is_none_or(|rtt| rtt < self.rtt_threshold);
        if !healthy {
            self.healthy_streak = 0;
            return false;
        }
        self.healthy_streak += 1;
        if self.healthy_streak >= self.stable_pongs {
            self.healthy_streak = 0;
            true
        } else {
            false
        }
    }
}

/// Everything a connection task needs from its gateway.
pub(crate) struct Session {
    pub ctx: GatewayContext,
    pub config: Arc<GatewayConfig>,
    pub peers: Arc<Peers>,
    pub node_id: uuid::Uuid,
}

/// Runs one authenticated socket until it closes.
///
/// Every exit path leaves the registry without an entry for this socket.
pub(crate) async fn serve<S>(
    session: Arc<Session>,
    ws_stream: S,
    user_id: UserId,
    attempt_hint: u32,
    peer_addr: SocketAddr,
    server_cancel: CancellationToken,
) -> Result<(), crate::GatewayError>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let registry = Arc::clone(&session.ctx.registry);
    let id = uuid::Uuid::new_v4();
    let registration = registry.register_guarded(id, user_id.clone())?;

    // The hint is client-supplied; clamp before trusting it.
    for _ in 0..attempt_hint.min(MAX_ATTEMPT_HINT) {
        registry.increment_reconnect_attempts(id)?;
    }
    registry.update_state(id, ConnectionState::Connecting)?;

    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };
    session.peers.insert(id, sender.clone(), cancel.clone());

    let (ws_sink, ws_stream) = ws_stream.split();
    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let welcome = Welcome {
        connection_id: id,
        ping_interval_ms: session.config.ping_interval.as_millis() as u64,
        max_resubscribe_batch: session.config.max_resubscribe_batch,
    };
    let setup = Message::event(MessageType::Welcome, Some(&welcome))
        .map_err(crate::GatewayError::from)
        .and_then(|msg| {
            sender.send_msg(&msg).map_err(|_| {
                crate::GatewayError::Io(std::io::ErrorKind::BrokenPipe.into())
            })
        });

    let result = match setup {
        Ok(()) => {
            let _ = registry.update_state(id, ConnectionState::Connected);
            info!(connection = %id, user = %user_id, %peer_addr, attempt_hint, "connection established");
            let conn = Conn {
                id,
                session: Arc::clone(&session),
                sender,
            };
            conn.run(ws_stream, &cancel).await;
            Ok(())
        }
        Err(e) => Err(e),
    };

    cancel.cancel();
    let _ = registry.update_state(id, ConnectionState::Disconnected);
    session.peers.remove(id);
    registration.cleanup();
    info!(connection = %id, %peer_addr, "connection closed");
    result
}

/// Why the read loop stopped.
#[derive(Debug)]
enum Exit {
    Cancelled,
    PongTimeout,
    PeerClosed,
    ReadError,
}

struct Conn {
    id: ConnectionId,
    session: Arc<Session>,
    sender: Sender,
}

impl Conn {
    async fn run<S>(&self, mut stream: S, cancel: &CancellationToken)
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Send
            + Unpin,
    {
        let registry = &self.session.ctx.registry;
        let mut heartbeat = Heartbeat::new(&self.session.config);
        let pong_timeout = self.session.config.pong_timeout;

        let ping_timer = tokio::time::sleep(heartbeat.interval(0, None));
        tokio::pin!(ping_timer);
        let pong_deadline = tokio::time::sleep(pong_timeout);
        tokio::pin!(pong_deadline);
        let mut awaiting_pong = false;

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Exit::Cancelled,

                _ = &mut pong_deadline, if awaiting_pong => break Exit::PongTimeout,

                _ = &mut ping_timer => {
                    if registry.take_revalidation(self.id) {
                        self.revalidate_rooms();
                    }
                    let now = Instant::now();
                    let _ = registry.record_ping(self.id, now);
                    if self.sender.send_ws(WsMessage::Ping(Vec::new().into())).is_err() {
                        break Exit::PeerClosed;
                    }
                    if !awaiting_pong {
                        awaiting_pong = true;
                        pong_deadline.as_mut().reset(now + pong_timeout);
                    }
                    let (attempts, rtt) = registry
                        .get(self.id)
                        .map(|c| (c.reconnect_attempts, c.rtt()))
                        .unwrap_or((0, None));
                    ping_timer.as_mut().reset(now + heartbeat.interval(attempts, rtt));
                }

                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!(connection = %self.id, "read error: {e}");
                            break Exit::ReadError;
                        }
                        None => break Exit::PeerClosed,
                    };
                    // Any inbound traffic proves the peer is alive.
                    awaiting_pong = false;

                    match frame {
                        WsMessage::Text(text) => self.dispatch_text(&text).await,
                        WsMessage::Pong(_) => self.on_pong(&mut heartbeat),
                        WsMessage::Ping(data) => {
                            let _ = self.sender.send_ws(WsMessage::Pong(data));
                        }
                        WsMessage::Close(_) => break Exit::PeerClosed,
                        WsMessage::Binary(_) => {
                            debug!(connection = %self.id, "ignoring binary frame");
                        }
                        WsMessage::Frame(_) => {}
                    }
                }
            }
        };

        match exit {
            Exit::PongTimeout => {
                warn!(connection = %self.id, ?pong_timeout, "pong timeout, closing connection")
            }
            other => debug!(connection = %self.id, reason = ?other, "read loop finished"),
        }
    }

    fn on_pong(&self, heartbeat: &mut Heartbeat) {
        let registry = &self.session.ctx.registry;
        let rtt = registry
            .record_pong(self.id, Instant::now())
            .ok()
            .flatten();
        let ready = registry
            .get(self.id)
            .is_some_and(|c| c.state.is_ready());
        if heartbeat.on_pong(rtt, ready) {
            let attempts = registry.get(self.id).map_or(0, |c| c.reconnect_attempts);
            if attempts > 0 {
                let _ = registry.reset_reconnect_attempts(self.id);
                debug!(connection = %self.id, attempts, "link stable, reconnect counter reset");
            }
        }
    }

    /// Re-declares this connection's rooms on the fabric after a failover.
    fn revalidate_rooms(&self) {
        let rooms = self
            .session
            .ctx
            .registry
            .rooms_for_resubscription(self.id)
            .unwrap_or_default();
        info!(connection = %self.id, rooms = rooms.len(), "re-validating rooms after failover");
        self.resubscribe_on_fabric(rooms);
    }

    /// Declares `rooms` on the fabric in the background, outside any lock.
    fn resubscribe_on_fabric(&self, rooms: Vec<RoomId>) {
        if rooms.is_empty() {
            return;
        }
        let fabric = Arc::clone(&self.session.ctx.fabric);
        let policy = self.session.config.resubscribe.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = batch_resubscribe_rooms(fabric.as_ref(), &rooms, &policy).await {
                error!(connection = %id, "fabric resubscription failed: {e}");
            }
        });
    }

    async fn dispatch_text(&self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(connection = %self.id, "invalid frame: {e}");
                let _ = self
                    .sender
                    .send_msg(&Message::error("", WS_ERR_CODE_BAD_REQUEST, "invalid message"));
                return;
            }
        };

        match msg.msg_type {
            MessageType::Ping => self.reply(&msg, MessageType::Pong, None::<&()>),
            MessageType::Pong => {}
            MessageType::JoinRoom => self.handle_join(&msg),
            MessageType::LeaveRoom => self.handle_leave(&msg),
            MessageType::ResubscribeBatch => self.handle_resubscribe(&msg),
            MessageType::RoomMessage => self.handle_room_message(&msg).await,
            other => {
                debug!(connection = %self.id, msg_type = ?other, "unhandled message type");
                let _ = self.sender.send_error(
                    &msg,
                    WS_ERR_CODE_NOT_IMPLEMENTED,
                    "message type not handled by gateway",
                );
            }
        }
    }

    fn reply<T: serde::Serialize>(&self, req: &Message, msg_type: MessageType, payload: Option<&T>) {
        match req.reply(msg_type, payload) {
            Ok(resp) => {
                let _ = self.sender.send_msg(&resp);
            }
            Err(e) => {
                error!(connection = %self.id, "failed to build reply: {e}");
                let _ = self
                    .sender
                    .send_error(req, WS_ERR_CODE_INTERNAL, "internal error");
            }
        }
    }

    /// Parses the payload, answering 400 when it is missing or malformed.
    fn payload<T: for<'de> serde::Deserialize<'de>>(&self, msg: &Message) -> Option<T> {
        match msg.parse_payload::<T>() {
            Ok(Some(p)) => Some(p),
            Ok(None) => {
                let _ = self
                    .sender
                    .send_error(msg, WS_ERR_CODE_BAD_REQUEST, "missing payload");
                None
            }
            Err(e) => {
                let _ = self
                    .sender
                    .send_error(msg, WS_ERR_CODE_BAD_REQUEST, &format!("invalid payload: {e}"));
                None
            }
        }
    }

    fn handle_join(&self, msg: &Message) {
        let Some(room) = self.payload::<RoomRef>(msg) else {
            return;
        };
        match self
            .session
            .ctx
            .registry
            .add_room_subscription(self.id, &room.room_id)
        {
            Ok(added) => {
                if added {
                    self.resubscribe_on_fabric(vec![room.room_id.clone()]);
                }
                self.reply(msg, MessageType::RoomJoined, Some(&room));
            }
            Err(e) => {
                let _ = self
                    .sender
                    .send_error(msg, WS_ERR_CODE_INTERNAL, &e.to_string());
            }
        }
    }

    fn handle_leave(&self, msg: &Message) {
        let Some(room) = self.payload::<RoomRef>(msg) else {
            return;
        };
        match self
            .session
            .ctx
            .registry
            .remove_room_subscription(self.id, &room.room_id)
        {
            Ok(_) => self.reply(msg, MessageType::RoomLeft, Some(&room)),
            Err(e) => {
                let _ = self
                    .sender
                    .send_error(msg, WS_ERR_CODE_INTERNAL, &e.to_string());
            }
        }
    }

    fn handle_resubscribe(&self, msg: &Message) {
        let Some(batch) = self.payload::<ResubscribeBatch>(msg) else {
            return;
        };
        let max = self.session.config.max_resubscribe_batch;
        if batch.room_ids.len() > max {
            warn!(connection = %self.id, size = batch.room_ids.len(), max, "oversized resubscribe batch");
            let _ = self.sender.send_error(
                msg,
                WS_ERR_CODE_TOO_LARGE,
                &format!("resubscribe batch exceeds {max} rooms"),
            );
            return;
        }

        let registry = &self.session.ctx.registry;
        let state = registry
            .get(self.id)
            .map_or(ConnectionState::Disconnected, |c| c.state);
        match state {
            ConnectionState::Connected => {
                let _ = registry.update_state(self.id, ConnectionState::Restoring);
            }
            ConnectionState::Restoring | ConnectionState::Ready => {}
            other => {
                let _ = self.sender.send_error(
                    msg,
                    WS_ERR_CODE_BAD_REQUEST,
                    &format!("cannot restore rooms while {other}"),
                );
                return;
            }
        }

        let mut room_ids: Vec<RoomId> = Vec::with_capacity(batch.room_ids.len());
        let mut added_rooms = Vec::new();
        for room in batch.room_ids {
            if room_ids.contains(&room) {
                continue;
            }
            if registry
                .add_room_subscription(self.id, &room)
                .unwrap_or(false)
            {
                added_rooms.push(room.clone());
            }
            room_ids.push(room);
        }

        if batch.last && state != ConnectionState::Ready {
            let _ = registry.update_state(self.id, ConnectionState::Ready);
        }
        let ready = registry.get(self.id).is_some_and(|c| c.state.is_ready());

        debug!(
            connection = %self.id,
            rooms = room_ids.len(),
            added = added_rooms.len(),
            last = batch.last,
            ready,
            "resubscribe batch applied"
        );
        let ack = ResubscribeAck {
            room_ids,
            added: added_rooms.len(),
            ready,
        };
        self.reply(msg, MessageType::ResubscribeAck, Some(&ack));
        self.resubscribe_on_fabric(added_rooms);
    }

    async fn handle_room_message(&self, msg: &Message) {
        let Some(room_msg) = self.payload::<RoomMessage>(msg) else {
            return;
        };
        let ctx = &self.session.ctx;
        let subscribed = ctx
            .registry
            .get(self.id)
            .is_some_and(|c| c.rooms.contains(&room_msg.room_id));
        if !subscribed {
            let _ = self.sender.send_error(
                msg,
                WS_ERR_CODE_FORBIDDEN,
                &format!("not subscribed to room {}", room_msg.room_id),
            );
            return;
        }

        let payload = match Message::new(&msg.id, MessageType::RoomMessage, Some(&room_msg))
            .and_then(|m| m.to_json())
        {
            Ok(p) => p,
            Err(e) => {
                error!(connection = %self.id, "failed to encode room frame: {e}");
                return;
            }
        };

        let targets = ctx.registry.subscribers(&room_msg.room_id);
        let delivered = self.session.peers.deliver(&targets, &payload, Some(self.id));
        debug!(connection = %self.id, room = %room_msg.room_id, delivered, "room frame delivered locally");

        let envelope = FabricEnvelope {
            origin_node: self.session.node_id,
            room_id: room_msg.room_id.clone(),
            payload: payload.clone(),
        };
        if let Err(e) = ctx.fabric.publish(envelope).await {
            warn!(connection = %self.id, room = %room_msg.room_id, "publish failed, queueing for retry: {e}");
            ctx.retry_queue.enqueue(RetryEnvelope::new(
                room_msg.room_id,
                payload,
                self.id,
                self.session.config.retry_ttl,
            ));
        }
    }
}

/// Drains the send channel onto the socket.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            ping_interval: Duration::from_secs(20),
            rtt_threshold: Duration::from_secs(1),
            attempts_threshold: 3,
            stable_pongs: 3,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn interval_doubles_on_many_attempts() {
        let hb = Heartbeat::new(&config());
        assert_eq!(hb.interval(0, None), Duration::from_secs(20));
        assert_eq!(hb.interval(2, None), Duration::from_secs(20));
        assert_eq!(hb.interval(3, None), Duration::from_secs(40));
    }

    #[test]
    fn interval_doubles_on_slow_rtt() {
        let hb = Heartbeat::new(&config());
        assert_eq!(
            hb.interval(0, Some(Duration::from_millis(200))),
            Duration::from_secs(20)
        );
        assert_eq!(
            hb.interval(0, Some(Duration::from_millis(1500))),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn stable_pongs_while_ready_reset_counter() {
        let mut hb = Heartbeat::new(&config());
        let fast = Some(Duration::from_millis(50));
        assert!(!hb.on_pong(fast, true));
        assert!(!hb.on_pong(fast, true));
        assert!(hb.on_pong(fast, true));
        // Streak restarts after a reset.
        assert!(!hb.on_pong(fast, true));
    }

    #[test]
    fn slow_pong_or_not_ready_breaks_streak() {
        let mut hb = Heartbeat::new(&config());
        let fast = Some(Duration::from_millis(50));
        assert!(!hb.on_pong(fast, true));
        assert!(!hb.on_pong(fast, true));
        assert!(!hb.on_pong(Some(Duration::from_secs(2)), true));
        assert!(!hb.on_pong(fast, true));
        assert!(!hb.on_pong(fast, false));
        assert!(!hb.on_pong(fast, true));
        assert!(!hb.on_pong(fast, true));
        assert!(hb.on_pong(fast, true));
    }

    #[test]
    fn deliver_skips_excluded_and_unknown() {
        let peers = Peers::default();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        peers.insert(a, Sender { tx: tx_a }, CancellationToken::new());
        peers.insert(b, Sender { tx: tx_b }, CancellationToken::new());

        let delivered = peers.deliver(&[a, b, uuid::Uuid::new_v4()], "{}", Some(a));
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(WsMessage::Text(_))));
    }

    #[test]
    fn close_cancels_peer() {
        let peers = Peers::default();
        let (tx, _rx) = mpsc::channel(1);
        let id = uuid::Uuid::new_v4();
        let cancel = CancellationToken::new();
        peers.insert(id, Sender { tx }, cancel.clone());
        assert!(peers.close(id));
        assert!(cancel.is_cancelled());
        assert!(!peers.close(uuid::Uuid::new_v4()));
    }
}
