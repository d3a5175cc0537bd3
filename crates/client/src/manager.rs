//! Client connection manager.
//!
//! A single actor task owns the session: link, backoff, outbox and room
//! restoration. API calls, link frames, timer expiries, handshake results and
//! network changes all arrive over one channel, so state is only ever touched
//! from that task. Every spawned timer or handshake carries the generation it
//! was started under; completions from an older generation are ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_protocol::constants::MessageType;
use tether_protocol::messages::resubscribe_batches;
use tether_protocol::{
    ConnectionState, Message, ResubscribeAck, ResubscribeBatch, RoomId, RoomMessage, RoomRef,
};

use crate::network::NetworkStatus;
use crate::outbox::{Outbox, OutboxEntry};
use crate::rooms::RoomTracker;
use crate::types::{BackgroundPolicy, ClientConfig, ClientEvent, DropReason};
use crate::ws_client::{ClientError, CloseReason, ConnectRequest, Connector, Link, LinkEvent};

const INPUT_BUFFER_SIZE: usize = 256;
const EVENT_BUFFER_SIZE: usize = 256;
/// Pause before retrying an outbox flush that hit a full link buffer.
const OUTBOX_RETRY_DELAY: Duration = Duration::from_millis(100);

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Connect,
    Disconnect,
    Send(OutboxEntry),
    Join(RoomId, Reply<bool>),
    Leave(RoomId, Reply<bool>),
    Background,
    Foreground,
    Shutdown,
}

enum Input {
    Command(Command),
    Link { generation: u64, event: LinkEvent },
    BackoffElapsed { generation: u64 },
    FlushRetry { generation: u64 },
    Handshake {
        generation: u64,
        result: Result<Link, ClientError>,
    },
    Network(NetworkStatus),
}

/// Handle to the connection actor. Dropping it stops the actor.
pub struct ConnectionManager {
    inputs: mpsc::Sender<Input>,
    state: watch::Receiver<ConnectionState>,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    default_ttl: Duration,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Starts the actor. It stays idle until [`connect`](Self::connect).
    ///
    /// `network` is usually [`NetworkMonitor::subscribe`](crate::NetworkMonitor::subscribe).
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        rooms: Arc<RoomTracker>,
        mut network: watch::Receiver<NetworkStatus>,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_BUFFER_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let reachable = network.borrow_and_update().reachable;

        // Network changes join the actor's input stream.
        let forward_tx = inputs_tx.clone();
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_cancel.cancelled() => break,
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *network.borrow_and_update();
                        if forward_tx.send(Input::Network(status)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let default_ttl = config.outbox_ttl;
        let actor = Actor {
            outbox: Outbox::new(config.outbox_capacity),
            max_batch: config.max_resubscribe_batch,
            config,
            connector,
            rooms,
            inputs: inputs_tx.clone(),
            events: events_tx,
            state_tx,
            state: ConnectionState::Disconnected,
            attempt: 0,
            generation: 0,
            want_connected: false,
            reachable,
            background: false,
            pending: None,
            link: None,
            restore: VecDeque::new(),
            awaiting_ack: None,
            restoring_rooms: 0,
            flush_retry: false,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run(inputs_rx));

        Self {
            inputs: inputs_tx,
            state: state_rx,
            events_rx: Mutex::new(Some(events_rx)),
            default_ttl,
            cancel,
            task: StdMutex::new(Some(task)),
        }
    }

    async fn command(&self, cmd: Command) -> Result<(), ClientError> {
        self.inputs
            .send(Input::Command(cmd))
            .await
            .map_err(|_| ClientError::ShutDown)
    }

    /// Starts connecting. Also the way out of `GaveUp` and `AuthFailed`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.command(Command::Connect).await
    }

    /// Closes the link and cancels any pending reconnect.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect).await
    }

    /// Sends `body` to `room_id`, queueing it until the session is ready.
    pub async fn send(
        &self,
        room_id: impl Into<RoomId>,
        body: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.send_with_ttl(room_id, body, self.default_ttl).await
    }

    /// Like [`send`](Self::send) with a per-message outbox lifetime.
    pub async fn send_with_ttl(
        &self,
        room_id: impl Into<RoomId>,
        body: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), ClientError> {
        let entry = OutboxEntry::new(room_id, body, ttl);
        self.command(Command::Send(entry)).await
    }

    /// Records the membership and tells the gateway if a link is up.
    /// Returns `false` if the room was already joined.
    pub async fn join_room(&self, room_id: impl Into<RoomId>) -> Result<bool, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Join(room_id.into(), tx)).await?;
        rx.await.map_err(|_| ClientError::ShutDown)?
    }

    pub async fn leave_room(&self, room_id: impl Into<RoomId>) -> Result<bool, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Leave(room_id.into(), tx)).await?;
        rx.await.map_err(|_| ClientError::ShutDown)?
    }

    /// Applies the configured [`BackgroundPolicy`].
    pub async fn enter_background(&self) -> Result<(), ClientError> {
        self.command(Command::Background).await
    }

    pub async fn enter_foreground(&self) -> Result<(), ClientError> {
        self.command(Command::Foreground).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Disconnects and waits for the actor to stop.
    pub async fn shutdown(&self) {
        let _ = self.command(Command::Shutdown).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.cancel.cancel();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    rooms: Arc<RoomTracker>,
    inputs: mpsc::Sender<Input>,
    events: mpsc::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    outbox: Outbox,
    /// Consecutive failed attempts since the last `Ready`.
    attempt: u32,
    generation: u64,
    want_connected: bool,
    reachable: bool,
    background: bool,
    /// Backoff timer or handshake in flight.
    pending: Option<CancellationToken>,
    link: Option<Link>,
    restore: VecDeque<ResubscribeBatch>,
    awaiting_ack: Option<String>,
    restoring_rooms: usize,
    /// A [`Input::FlushRetry`] is on its way.
    flush_retry: bool,
    max_batch: usize,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut inputs: mpsc::Receiver<Input>) {
        loop {
            let input = tokio::select! {
                _ = self.cancel.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            if !self.handle(input) {
                break;
            }
        }
        self.want_connected = false;
        self.cancel_pending();
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        debug!("connection manager stopped");
    }

    /// Returns `false` once the actor should stop.
    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Shutdown) => return false,
            Input::Command(cmd) => self.on_command(cmd),
            Input::Link { generation, event } => {
                if generation != self.generation {
                    trace!(generation, "ignoring stale link event");
                    return true;
                }
                match event {
                    LinkEvent::Frame(msg) => self.on_frame(msg),
                    LinkEvent::Closed(reason) => self.on_link_closed(reason),
                }
            }
            Input::BackoffElapsed { generation } => {
                if generation == self.generation && self.state == ConnectionState::Disconnected {
                    self.pending = None;
                    self.start_attempt();
                }
            }
            Input::FlushRetry { generation } => {
                self.flush_retry = false;
                if generation == self.generation && self.state.is_ready() {
                    self.flush_outbox();
                }
            }
            Input::Handshake { generation, result } => {
                if generation != self.generation {
                    trace!(generation, "ignoring stale handshake result");
                    return true;
                }
                self.pending = None;
                self.on_handshake(result);
            }
            Input::Network(status) => self.on_network(status),
        }
        true
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                self.want_connected = true;
                if self.state != ConnectionState::Disconnected {
                    return;
                }
                self.attempt = 0;
                self.cancel_pending();
                self.start_attempt();
            }
            Command::Disconnect => {
                info!("disconnect requested");
                self.want_connected = false;
                self.cancel_pending();
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
            }
            Command::Send(entry) => self.on_send(entry),
            Command::Join(room_id, reply) => {
                let result = self.rooms.add_room(&room_id).map_err(ClientError::from);
                if matches!(result, Ok(true)) {
                    self.send_room_ref(MessageType::JoinRoom, room_id);
                }
                let _ = reply.send(result);
            }
            Command::Leave(room_id, reply) => {
                let result = self.rooms.remove_room(&room_id).map_err(ClientError::from);
                if matches!(result, Ok(true)) {
                    self.send_room_ref(MessageType::LeaveRoom, room_id);
                }
                let _ = reply.send(result);
            }
            Command::Background => self.on_background(),
            Command::Foreground => self.on_foreground(),
            Command::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Attempts and backoff
    // -----------------------------------------------------------------------

    /// Backgrounded with [`BackgroundPolicy::CloseSocket`].
    fn parked(&self) -> bool {
        self.background && self.config.background == BackgroundPolicy::CloseSocket
    }

    fn start_attempt(&mut self) {
        if !self.want_connected || self.state != ConnectionState::Disconnected {
            return;
        }
        if !self.reachable {
            debug!("network unreachable, waiting before connecting");
            return;
        }
        if self.parked() {
            debug!("in background, not connecting");
            return;
        }

        self.cancel_pending();
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);

        let request = ConnectRequest {
            url: self.config.url.clone(),
            token: self.config.token.clone(),
            attempt: self.attempt,
            ping_interval: self.config.ping_interval,
            read_deadline: self.config.read_deadline,
        };
        info!(attempt = self.attempt, url = %request.url, "connecting");

        let generation = self.generation;
        let token = self.cancel.child_token();
        let connector = self.connector.clone();
        let inputs = self.inputs.clone();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = connector.connect(&request) => {
                    let _ = inputs.send(Input::Handshake { generation, result }).await;
                }
            }
        });
        self.pending = Some(token);
    }

    /// Counts a failed attempt and either schedules the next or gives up.
    fn on_attempt_failed(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.config.reconnect.max_attempts {
            warn!(attempts = self.attempt, "giving up on reconnection");
            self.want_connected = false;
            self.emit(ClientEvent::GaveUp {
                attempts: self.attempt,
            });
            return;
        }
        self.schedule_backoff();
    }

    fn schedule_backoff(&mut self) {
        if !self.want_connected {
            return;
        }
        if !self.reachable {
            debug!(attempt = self.attempt, "network unreachable, backoff deferred");
            return;
        }
        if self.parked() {
            return;
        }

        self.cancel_pending();
        self.generation += 1;
        let delay = self.config.reconnect.delay_for_attempt(self.attempt);
        let delay_secs = delay.as_secs_f64();
        info!(
            attempt = self.attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            "reconnecting"
        );
        self.emit(ClientEvent::Reconnecting {
            attempt: self.attempt,
            delay,
        });

        let generation = self.generation;
        let token = self.cancel.child_token();
        let inputs = self.inputs.clone();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = inputs.send(Input::BackoffElapsed { generation }).await;
                }
            }
        });
        self.pending = Some(token);
    }

    /// Cancels the backoff timer or handshake in flight. A result that was
    /// already queued becomes stale.
    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
            self.generation += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Link lifecycle
    // -----------------------------------------------------------------------

    fn on_handshake(&mut self, result: Result<Link, ClientError>) {
        let mut link = match result {
            Ok(link) if !self.want_connected || self.state != ConnectionState::Connecting => {
                debug!(state = %self.state, "discarding link no longer wanted");
                link.close();
                return;
            }
            Ok(link) => link,
            Err(e) if e.is_fatal() => {
                warn!("gateway rejected credential: {e}");
                self.want_connected = false;
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::AuthFailed(e.to_string()));
                return;
            }
            Err(e) => {
                warn!(attempt = self.attempt, error = %e, "connection attempt failed");
                self.set_state(ConnectionState::Disconnected);
                self.on_attempt_failed();
                return;
            }
        };

        let welcome = link.welcome().clone();
        if welcome.max_resubscribe_batch > 0 {
            self.max_batch = welcome.max_resubscribe_batch;
        }
        if let Some(mut events) = link.take_events() {
            let generation = self.generation;
            let inputs = self.inputs.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if inputs.send(Input::Link { generation, event }).await.is_err() {
                        break;
                    }
                }
            });
        }
        if self.background {
            link.set_pings_paused(true);
        }
        self.link = Some(link);
        info!(connection = %welcome.connection_id, "connected");
        self.set_state(ConnectionState::Connected);
        self.begin_restore();
    }

    fn on_link_closed(&mut self, reason: CloseReason) {
        let was = self.state;
        info!(state = %was, ?reason, "link closed");
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        if !self.want_connected || self.parked() {
            return;
        }
        if was == ConnectionState::Ready {
            self.attempt = 0;
            self.schedule_backoff();
        } else {
            self.on_attempt_failed();
        }
    }

    /// Closes the current link (if any) and invalidates its events.
    fn drop_link(&mut self) {
        self.restore.clear();
        self.awaiting_ack = None;
        if let Some(link) = self.link.take() {
            link.close();
            self.generation += 1;
        }
    }

    fn on_network(&mut self, status: NetworkStatus) {
        let was_reachable = self.reachable;
        self.reachable = status.reachable;
        if !status.reachable {
            if self.state == ConnectionState::Disconnected && self.pending.is_some() {
                debug!("network lost, cancelling pending reconnect");
                self.cancel_pending();
            }
            return;
        }
        if !was_reachable && self.want_connected && self.state == ConnectionState::Disconnected {
            info!(interface = ?status.interface, "network regained, reconnecting now");
            self.cancel_pending();
            self.start_attempt();
        }
    }

    fn on_background(&mut self) {
        if self.background {
            return;
        }
        self.background = true;
        match self.config.background {
            BackgroundPolicy::SuspendPings => {
                debug!("background: pausing pings");
                if let Some(link) = &self.link {
                    link.set_pings_paused(true);
                }
            }
            BackgroundPolicy::CloseSocket => {
                debug!("background: closing socket");
                self.cancel_pending();
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn on_foreground(&mut self) {
        if !self.background {
            return;
        }
        self.background = false;
        if let Some(link) = &self.link {
            link.set_pings_paused(false);
        }
        if self.want_connected && self.state == ConnectionState::Disconnected {
            self.cancel_pending();
            self.start_attempt();
        }
    }

    // -----------------------------------------------------------------------
    // Restoration
    // -----------------------------------------------------------------------

    fn begin_restore(&mut self) {
        self.set_state(ConnectionState::Restoring);
        let rooms: Vec<RoomId> = self.rooms.all_rooms().into_iter().collect();
        self.restoring_rooms = rooms.len();
        self.restore = resubscribe_batches(&rooms, self.max_batch).into();
        debug!(
            rooms = rooms.len(),
            batches = self.restore.len(),
            "restoring rooms"
        );
        self.send_next_batch();
    }

    fn send_next_batch(&mut self) {
        let Some(batch) = self.restore.pop_front() else {
            return;
        };
        let sent = Message::event(MessageType::ResubscribeBatch, Some(&batch))
            .map_err(ClientError::from)
            .and_then(|msg| {
                let id = msg.id.clone();
                self.send_frame(&msg).map(|()| id)
            });
        match sent {
            Ok(id) => self.awaiting_ack = Some(id),
            Err(e) => self.on_link_closed(CloseReason::Error(e.to_string())),
        }
    }

    fn on_ack(&mut self, msg: &Message) {
        if self.awaiting_ack.as_deref() != Some(msg.id.as_str()) {
            trace!(id = %msg.id, "unexpected resubscribe ack");
            return;
        }
        self.awaiting_ack = None;
        if !self.restore.is_empty() {
            self.send_next_batch();
            return;
        }
        if let Ok(Some(ack)) = msg.parse_payload::<ResubscribeAck>() {
            if !ack.ready {
                warn!("final resubscribe ack without ready flag");
            }
        }
        self.set_state(ConnectionState::Ready);
        self.attempt = 0;
        info!(rooms = self.restoring_rooms, "session restored");
        self.emit(ClientEvent::Restored {
            rooms: self.restoring_rooms,
        });
        self.flush_outbox();
    }

    // -----------------------------------------------------------------------
    // Frames and outbox
    // -----------------------------------------------------------------------

    fn on_frame(&mut self, msg: Message) {
        match msg.msg_type {
            MessageType::ResubscribeAck => self.on_ack(&msg),
            MessageType::RoomMessage => match msg.parse_payload::<RoomMessage>() {
                Ok(Some(room_msg)) => self.emit(ClientEvent::Message(room_msg)),
                Ok(None) => warn!(id = %msg.id, "room message without payload"),
                Err(e) => warn!(id = %msg.id, "bad room message: {e}"),
            },
            MessageType::RoomJoined | MessageType::RoomLeft => {
                if let Ok(Some(room)) = msg.parse_payload::<RoomRef>() {
                    let event = if msg.msg_type == MessageType::RoomJoined {
                        ClientEvent::RoomJoined(room.room_id)
                    } else {
                        ClientEvent::RoomLeft(room.room_id)
                    };
                    self.emit(event);
                }
            }
            MessageType::Ping => {
                if let Ok(pong) = msg.reply::<()>(MessageType::Pong, None) {
                    let _ = self.send_frame(&pong);
                }
            }
            MessageType::Error => {
                let (code, message) = msg
                    .error
                    .as_ref()
                    .map_or((0, String::new()), |e| (e.code, e.message.clone()));
                warn!(id = %msg.id, code, "gateway error: {message}");
                let during_restore = self.awaiting_ack.as_deref() == Some(msg.id.as_str());
                self.emit(ClientEvent::ServerError { code, message });
                if during_restore {
                    self.on_link_closed(CloseReason::Error(format!(
                        "restoration rejected ({code})"
                    )));
                }
            }
            MessageType::Pong | MessageType::Welcome => {}
            other => trace!(?other, "ignoring frame"),
        }
    }

    fn on_send(&mut self, entry: OutboxEntry) {
        if self.state.is_ready() {
            // Older queued messages go first.
            if !self.outbox.is_empty() {
                self.flush_outbox();
            }
            if self.outbox.is_empty() {
                match self.send_room_message(&entry) {
                    Ok(()) => return,
                    Err(e) => debug!("direct send failed, queueing: {e}"),
                }
            }
        }
        self.enqueue(entry);
        self.schedule_flush_retry();
    }

    /// Retries the outbox shortly while the session stays ready.
    fn schedule_flush_retry(&mut self) {
        if self.flush_retry || self.outbox.is_empty() || !self.state.is_ready() {
            return;
        }
        self.flush_retry = true;
        let generation = self.generation;
        let inputs = self.inputs.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(OUTBOX_RETRY_DELAY) => {
                    let _ = inputs.send(Input::FlushRetry { generation }).await;
                }
            }
        });
    }

    fn enqueue(&mut self, entry: OutboxEntry) {
        if let Some(evicted) = self.outbox.push(entry) {
            warn!(room = %evicted.room_id, "outbox full, dropping oldest message");
            self.emit(ClientEvent::MessageDropped {
                room_id: evicted.room_id,
                reason: DropReason::Evicted,
            });
        }
    }

    fn flush_outbox(&mut self) {
        let drained = self.outbox.drain(Instant::now());
        for entry in drained.expired {
            debug!(room = %entry.room_id, "queued message expired");
            self.emit(ClientEvent::MessageDropped {
                room_id: entry.room_id,
                reason: DropReason::Expired,
            });
        }
        let total = drained.live.len();
        let mut live = drained.live.into_iter();
        let mut sent = 0;
        for entry in live.by_ref() {
            if let Err(e) = self.send_room_message(&entry) {
                warn!("outbox flush interrupted: {e}");
                self.outbox.push(entry);
                break;
            }
            sent += 1;
        }
        for entry in live {
            self.outbox.push(entry);
        }
        if total > 0 {
            debug!(sent, total, "outbox flushed");
        }
        self.schedule_flush_retry();
    }

    fn send_room_message(&self, entry: &OutboxEntry) -> Result<(), ClientError> {
        let payload = RoomMessage {
            room_id: entry.room_id.clone(),
            body: entry.body.clone(),
        };
        let msg = Message::event(MessageType::RoomMessage, Some(&payload))?;
        self.send_frame(&msg)
    }

    fn send_room_ref(&self, msg_type: MessageType, room_id: RoomId) {
        if self.link.is_none() {
            return;
        }
        let sent = Message::event(msg_type, Some(&RoomRef { room_id }))
            .map_err(ClientError::from)
            .and_then(|msg| self.send_frame(&msg));
        if let Err(e) = sent {
            debug!(?msg_type, "room update not sent, restoration will carry it: {e}");
        }
    }

    fn send_frame(&self, msg: &Message) -> Result<(), ClientError> {
        match &self.link {
            Some(link) => link.send(msg),
            None => Err(ClientError::Closed),
        }
    }

    // -----------------------------------------------------------------------
    // State and events
    // -----------------------------------------------------------------------

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        match self.state.transition(next) {
            Ok(state) => {
                debug!(from = %self.state, to = %state, "state changed");
                self.state = state;
                self.state_tx.send_replace(state);
                self.emit(ClientEvent::StateChanged(state));
            }
            Err(e) => warn!("rejected state change: {e}"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!("client event not delivered: {e}");
        }
    }
}
