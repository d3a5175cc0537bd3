//! WebSocket transport for the connection manager.
//!
//! A [`Connector`] performs one handshake and yields a [`Link`]: a live
//! socket whose inbound frames arrive as [`LinkEvent`]s. The manager owns
//! the link; the pumps behind it stop when it is closed or dropped.

use std::future::Future;
use std::pin::Pin;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_protocol::constants::{
    HANDSHAKE_TIMEOUT, MessageType, QUERY_ATTEMPT, QUERY_TOKEN, WS_MAX_MESSAGE_SIZE,
};
use tether_protocol::{Message, Welcome};

use crate::rooms::RoomStoreError;

/// Capacity of the per-link write and event channels.
pub(crate) const LINK_BUFFER_SIZE: usize = 256;

/// Errors from the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid gateway URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("gateway rejected credential (HTTP {status})")]
    AuthRejected { status: u16 },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("room store error: {0}")]
    Rooms(#[from] RoomStoreError),

    #[error("connection manager has shut down")]
    ShutDown,
}

impl ClientError {
    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::AuthRejected { .. })
    }
}

/// Why a link stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The gateway sent a close frame or the stream ended.
    Remote,
    /// Nothing arrived within the read deadline.
    ReadTimeout,
    /// Transport error.
    Error(String),
    /// Closed from this side.
    Local,
}

/// Something that happened on a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Frame(Message),
    Closed(CloseReason),
}

/// What the manager asks a connector for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub token: String,
    /// Current reconnect counter, passed to the gateway as a hint.
    pub attempt: u32,
    pub ping_interval: std::time::Duration,
    pub read_deadline: std::time::Duration,
}

/// An established socket.
pub struct Link {
    welcome: Welcome,
    tx: mpsc::Sender<tungstenite::Message>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    pings_paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Link {
    /// Assembles a link from its channels. Connectors call this once the
    /// gateway's welcome has arrived.
    pub fn new(
        welcome: Welcome,
        tx: mpsc::Sender<tungstenite::Message>,
        events: mpsc::Receiver<LinkEvent>,
        pings_paused: watch::Sender<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            welcome,
            tx,
            events: Some(events),
            pings_paused,
            cancel,
        }
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    /// Takes the inbound event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.events.take()
    }

    /// Queues a protocol message.
    pub fn send(&self, msg: &Message) -> Result<(), ClientError> {
        let json = msg.to_json()?;
        self.tx
            .try_send(tungstenite::Message::Text(json.into()))
            .map_err(|_| ClientError::Closed)
    }

    pub fn set_pings_paused(&self, paused: bool) {
        self.pings_paused.send_replace(paused);
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Stops the pumps; the write pump sends a close frame on its way out.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Link, ClientError>> + Send + 'a>>;

/// Opens links to the gateway.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, request: &'a ConnectRequest) -> ConnectFuture<'a>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(&'a self, request: &'a ConnectRequest) -> ConnectFuture<'a> {
        Box::pin(connect_ws(request))
    }
}

/// Builds `url?token=..&attempt=..`, replacing any existing values.
pub fn handshake_url(base: &str, token: &str, attempt: u32) -> Result<url::Url, ClientError> {
    let mut url = url::Url::parse(base)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != QUERY_TOKEN && k != QUERY_ATTEMPT)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs
            .append_pair(QUERY_TOKEN, token)
            .append_pair(QUERY_ATTEMPT, &attempt.to_string());
    }
    Ok(url)
}

async fn connect_ws(request: &ConnectRequest) -> Result<Link, ClientError> {
    let url = handshake_url(&request.url, &request.token, request.attempt)?;

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

    let connecting =
        tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false);
    let (ws_stream, _) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting).await {
        Err(_) => return Err(ClientError::Timeout),
        Ok(Err(tungstenite::Error::Http(resp))) => {
            let status = resp.status().as_u16();
            if status == 401 || status == 403 {
                return Err(ClientError::AuthRejected { status });
            }
            return Err(ClientError::Handshake(format!("HTTP {status}")));
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(pair)) => pair,
    };
    let (write, read) = ws_stream.split();

    let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(LINK_BUFFER_SIZE);
    let (events_tx, mut events_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER_SIZE);
    let (pings_tx, pings_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel.clone()));
    tokio::spawn(crate::pumps::read::read_pump(
        read,
        events_tx,
        write_tx.clone(),
        request.read_deadline,
        cancel.clone(),
    ));
    tokio::spawn(crate::pumps::ping::ping_pump(
        write_tx.clone(),
        request.ping_interval,
        pings_rx,
        cancel.clone(),
    ));

    let welcome = match tokio::time::timeout(HANDSHAKE_TIMEOUT, events_rx.recv()).await {
        Ok(Some(LinkEvent::Frame(msg))) if msg.msg_type == MessageType::Welcome => {
            msg.parse_payload::<Welcome>()
                .map_err(ClientError::from)
                .and_then(|w| {
                    w.ok_or_else(|| ClientError::Handshake("welcome without payload".into()))
                })
        }
        Ok(Some(LinkEvent::Frame(msg))) => Err(ClientError::Handshake(format!(
            "expected welcome, got {:?}",
            msg.msg_type
        ))),
        Ok(Some(LinkEvent::Closed(_)) | None) => Err(ClientError::Closed),
        Err(_) => Err(ClientError::Timeout),
    };
    let welcome = match welcome {
        Ok(w) => w,
        Err(e) => {
            cancel.cancel();
            return Err(e);
        }
    };

    debug!(connection = %welcome.connection_id, "handshake complete");
    Ok(Link::new(welcome, write_tx, events_rx, pings_tx, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "handshake timed out");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");
        let err = ClientError::AuthRejected { status: 401 };
        assert!(err.to_string().contains("401"));
        assert!(err.is_fatal());
        assert!(!ClientError::Timeout.is_fatal());
    }

    #[test]
    fn handshake_url_appends_token_and_attempt() {
        let url = handshake_url("ws://localhost:9000/", "a b&c", 3).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "a b&c".to_string()),
                ("attempt".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn handshake_url_replaces_stale_values() {
        let url = handshake_url("ws://h/?region=eu&attempt=9&token=old", "new", 0).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("region".to_string(), "eu".to_string()));
        assert!(pairs.contains(&("token".to_string(), "new".to_string())));
        assert!(pairs.contains(&("attempt".to_string(), "0".to_string())));
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn handshake_url_rejects_garbage() {
        assert!(matches!(
            handshake_url("not a url", "t", 0),
            Err(ClientError::Url(_))
        ));
    }

    #[tokio::test]
    async fn link_send_and_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_events_tx, events_rx) = mpsc::channel(4);
        let welcome = Welcome {
            connection_id: uuid::Uuid::nil(),
            ping_interval_ms: 1000,
            max_resubscribe_batch: 10,
        };
        let mut link = Link::new(
            welcome,
            tx,
            events_rx,
            watch::channel(false).0,
            CancellationToken::new(),
        );
        assert!(link.take_events().is_some());
        assert!(link.take_events().is_none());

        let msg = Message::new::<()>("m1", MessageType::Ping, None).unwrap();
        link.send(&msg).unwrap();
        assert!(matches!(rx.recv().await, Some(tungstenite::Message::Text(_))));

        assert!(link.is_open());
        link.close();
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let request = ConnectRequest {
            url: format!("ws://127.0.0.1:{port}/"),
            token: "t".into(),
            attempt: 0,
            ping_interval: std::time::Duration::from_secs(15),
            read_deadline: std::time::Duration::from_secs(45),
        };
        let err = WsConnector.connect(&request).await.err().unwrap();
        assert!(!err.is_fatal());
    }
}
