//! WebSocket read pump: turns inbound frames into [`LinkEvent`]s.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tether_protocol::Message;

use crate::ws_client::{CloseReason, LinkEvent};

/// Reads frames and forwards protocol messages to `events`.
///
/// Any inbound frame resets the read deadline; if nothing arrives within
/// `deadline` the link is considered dead. A final
/// [`LinkEvent::Closed`] is always sent on exit.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events: mpsc::Sender<LinkEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    deadline: Duration,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let read_deadline = tokio::time::sleep(deadline);
    tokio::pin!(read_deadline);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break CloseReason::Local,

            () = &mut read_deadline => {
                warn!(?deadline, "read deadline passed, link considered dead");
                break CloseReason::ReadTimeout;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        read_deadline.as_mut().reset(tokio::time::Instant::now() + deadline);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                if let Some(message) = parse_text(&text) {
                                    if events.send(LinkEvent::Frame(message)).await.is_err() {
                                        break CloseReason::Local;
                                    }
                                }
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.try_send(tungstenite::Message::Pong(data));
                            }
                            tungstenite::Message::Pong(_) => trace!("received pong"),
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break CloseReason::Remote;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {e}");
                        break CloseReason::Error(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break CloseReason::Remote;
                    }
                }
            }
        }
    };

    cancel.cancel();
    let _ = events.send(LinkEvent::Closed(reason)).await;
}

fn parse_text(text: &str) -> Option<Message> {
    match serde_json::from_str::<Message>(text) {
        Ok(msg) => {
            trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");
            Some(msg)
        }
        Err(e) => {
            warn!("failed to parse message: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tether_protocol::constants::MessageType;

    fn text(msg: &Message) -> Result<tungstenite::Message, tungstenite::Error> {
        Ok(tungstenite::Message::Text(msg.to_json().unwrap().into()))
    }

    #[tokio::test]
    async fn forwards_frames_then_reports_close() {
        let ping = Message::new::<()>("m1", MessageType::Ping, None).unwrap();
        let frames = stream::iter(vec![
            text(&ping),
            Ok(tungstenite::Message::Text("garbage".into())),
        ]);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (write_tx, _write_rx) = mpsc::channel(8);

        read_pump(
            frames,
            events_tx,
            write_tx,
            Duration::from_secs(45),
            CancellationToken::new(),
        )
        .await;

        match events_rx.recv().await {
            Some(LinkEvent::Frame(msg)) => assert_eq!(msg.id, "m1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events_rx.recv().await,
            Some(LinkEvent::Closed(CloseReason::Remote))
        ));
    }

    #[tokio::test]
    async fn answers_ping_frames() {
        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![7].into()))]);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (write_tx, mut write_rx) = mpsc::channel(8);
        read_pump(
            frames,
            events_tx,
            write_tx,
            Duration::from_secs(45),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            write_rx.recv().await,
            Some(tungstenite::Message::Pong(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_trips_read_deadline() {
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (write_tx, _write_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        read_pump(
            silent,
            events_tx,
            write_tx,
            Duration::from_secs(45),
            cancel.clone(),
        )
        .await;

        assert!(matches!(
            events_rx.recv().await,
            Some(LinkEvent::Closed(CloseReason::ReadTimeout))
        ));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_extends_deadline() {
        let deadline = Duration::from_secs(45);
        let msg = Message::new::<()>("late", MessageType::Pong, None).unwrap();
        let frame = text(&msg);
        let delayed = stream::once(async move {
            tokio::time::sleep(deadline - Duration::from_secs(1)).await;
            frame
        });
        let combined = Box::pin(delayed.chain(stream::pending()));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (write_tx, _write_rx) = mpsc::channel(8);

        let started = tokio::time::Instant::now();
        read_pump(
            combined,
            events_tx,
            write_tx,
            deadline,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(events_rx.recv().await, Some(LinkEvent::Frame(_))));
        assert!(matches!(
            events_rx.recv().await,
            Some(LinkEvent::Closed(CloseReason::ReadTimeout))
        ));
        assert!(started.elapsed() >= deadline * 2 - Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancel_reports_local_close() {
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (write_tx, _write_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        read_pump(silent, events_tx, write_tx, Duration::from_secs(45), cancel).await;
        assert!(matches!(
            events_rx.recv().await,
            Some(LinkEvent::Closed(CloseReason::Local))
        ));
    }
}
