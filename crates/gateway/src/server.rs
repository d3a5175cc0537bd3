//! Gateway WebSocket server.
//!
//! Listens on a TCP port, authenticates each upgrade, and spawns one task
//! per accepted socket. Two background loops run alongside the accept
//! loop: the retry-queue flusher and the fabric event listener.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use tether_protocol::constants::{MAX_RESUBSCRIBE_BATCH, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use tether_protocol::{ConnectionId, UserId};

use crate::GatewayError;
use crate::auth::{Authenticator, handshake_params};
use crate::connection::{self, Peers, Session};
use crate::fabric::{Fabric, FabricEnvelope, FabricEvent};
use crate::registry::ConnectionRegistry;
use crate::retry_queue::{BroadcastRetryQueue, DEFAULT_RETRY_TTL, ResubscribePolicy};

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Baseline WebSocket ping interval.
    pub ping_interval: Duration,
    /// Silence after a ping before the socket is considered dead.
    pub pong_timeout: Duration,
    /// Round trip at or above which the link counts as slow.
    pub rtt_threshold: Duration,
    /// Reconnect attempts at or above which pings slow down.
    pub attempts_threshold: u32,
    /// Consecutive healthy pongs in `ready` that reset the reconnect counter.
    pub stable_pongs: u32,
    pub max_resubscribe_batch: usize,
    /// Lifetime of a broadcast parked in the retry queue.
    pub retry_ttl: Duration,
    /// How often the retry queue is flushed to the fabric.
    pub retry_flush_interval: Duration,
    pub resubscribe: ResubscribePolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            ping_interval: WS_PING_PERIOD,
            pong_timeout: WS_PONG_WAIT,
            rtt_threshold: Duration::from_secs(1),
            attempts_threshold: 3,
            stable_pongs: 3,
            max_resubscribe_batch: MAX_RESUBSCRIBE_BATCH,
            retry_ttl: DEFAULT_RETRY_TTL,
            retry_flush_interval: Duration::from_secs(1),
            resubscribe: ResubscribePolicy::default(),
        }
    }
}

/// Collaborators the gateway is built from.
#[derive(Clone)]
pub struct GatewayContext {
    pub registry: Arc<ConnectionRegistry>,
    pub retry_queue: Arc<BroadcastRetryQueue>,
    pub fabric: Arc<dyn Fabric>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl GatewayContext {
    /// Context with a fresh registry and a default-sized retry queue.
    pub fn new(fabric: Arc<dyn Fabric>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            retry_queue: Arc::new(BroadcastRetryQueue::default()),
            fabric,
            authenticator,
        }
    }
}

/// The gateway server.
pub struct Gateway {
    session: Arc<Session>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, ctx: GatewayContext) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::new(Session {
                ctx,
                config: Arc::new(config),
                peers: Arc::new(Peers::default()),
                node_id: uuid::Uuid::new_v4(),
            }),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &GatewayContext {
        &self.session.ctx
    }

    /// Identity of this node on the fabric.
    pub fn node_id(&self) -> uuid::Uuid {
        self.session.node_id
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Live connections on this node.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.session.peers.ids()
    }

    /// Closes one socket from the server side.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let found = self.session.peers.close(id);
        if found {
            tracing::info!(connection = %id, "disconnect requested");
        }
        found
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), GatewayError> {
        let config = &self.session.config;
        let addr = SocketAddr::new(config.host, config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(node = %self.session.node_id, "gateway listening on {local_addr}");

        tokio::spawn(flush_loop(Arc::clone(&self.session), self.cancel.child_token()));
        tokio::spawn(fabric_loop(
            Arc::clone(&self.session),
            self.session.ctx.fabric.events(),
            self.cancel.child_token(),
        ));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("gateway shutting down");
                    self.session.peers.close_all();
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::debug!(%peer_addr, "connection ended with error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP stream, authenticating during the handshake.
    async fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let authenticator = Arc::clone(&self.session.ctx.authenticator);
        let mut accepted: Option<(UserId, u32)> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let params = handshake_params(req);
            let Some(credential) = params.credential else {
                return Err(unauthorized("missing credential"));
            };
            match authenticator.authenticate(&credential) {
                Ok(user) => {
                    accepted = Some((user, params.attempt));
                    Ok(resp)
                }
                Err(e) => Err(unauthorized(&e.to_string())),
            }
        };

        let ws_stream = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::info!(%peer_addr, "handshake rejected: {e}");
                return Err(e.into());
            }
        };
        let Some((user_id, attempt)) = accepted else {
            return Ok(());
        };

        connection::serve(
            Arc::clone(&self.session),
            ws_stream,
            user_id,
            attempt,
            peer_addr,
            self.cancel.clone(),
        )
        .await
    }
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

/// Periodically republishes parked broadcasts.
async fn flush_loop(session: Arc<Session>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(session.config.retry_flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => flush_retry_queue(&session).await,
        }
    }
}

async fn flush_retry_queue(session: &Session) {
    let queue = &session.ctx.retry_queue;
    if queue.is_empty() {
        return;
    }
    let mut pending = queue.drain(Instant::now()).into_iter();
    let mut flushed = 0usize;
    while let Some(envelope) = pending.next() {
        let frame = FabricEnvelope {
            origin_node: session.node_id,
            room_id: envelope.room_id.clone(),
            payload: envelope.payload.clone(),
        };
        if let Err(e) = session.ctx.fabric.publish(frame).await {
            let mut rest = vec![envelope];
            rest.extend(pending);
            tracing::debug!(remaining = rest.len(), "fabric still down: {e}");
            queue.restore(rest);
            break;
        }
        flushed += 1;
    }
    if flushed > 0 {
        tracing::info!(flushed, "retry queue flushed to fabric");
    }
}

/// Reacts to fabric events: remote broadcasts and failovers.
async fn fabric_loop(
    session: Arc<Session>,
    mut events: broadcast::Receiver<FabricEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(FabricEvent::Broadcast(envelope)) => {
                if envelope.origin_node == session.node_id {
                    continue;
                }
                let targets = session.ctx.registry.subscribers(&envelope.room_id);
                let delivered = session.peers.deliver(&targets, &envelope.payload, None);
                tracing::debug!(room = %envelope.room_id, delivered, "remote broadcast delivered");
            }
            Ok(FabricEvent::Failover { reason }) => {
                let marked = session.ctx.registry.mark_all_for_revalidation();
                tracing::warn!(%reason, marked, "fabric failover, rooms will re-validate on next heartbeat");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "fabric event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
