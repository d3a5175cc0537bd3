fn main() {
    println!("Run `cargo test -p resilience-e2e` to execute the end-to-end resilience scenarios.");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use tether_client::{
        ClientConfig, ClientEvent, ConnectionManager, DropReason, NetworkMonitor, RoomTracker,
        WsConnector,
    };
    use tether_gateway::{
        Gateway, GatewayConfig, GatewayContext, LocalFabric, StaticTokenAuthenticator,
    };
    use tether_protocol::{ConnectionState, RoomMessage};

    const WAIT: Duration = Duration::from_secs(10);

    struct Node {
        gateway: Arc<Gateway>,
        port: u16,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Node {
        async fn start() -> Self {
            let auth = StaticTokenAuthenticator::default()
                .with_token("tok-alice", "alice")
                .with_token("tok-bob", "bob");
            let ctx = GatewayContext::new(Arc::new(LocalFabric::new()), Arc::new(auth));
            let gateway = Gateway::new(
                GatewayConfig {
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    port: 0,
                    ..GatewayConfig::default()
                },
                ctx,
            );
            let server = Arc::clone(&gateway);
            let handle = tokio::spawn(async move {
                server.run().await.unwrap();
            });
            let port = tokio::time::timeout(WAIT, async {
                loop {
                    let port = gateway.port().await;
                    if port > 0 {
                        break port;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("gateway bound");
            Self {
                gateway,
                port,
                handle,
            }
        }

        fn rooms_of_all(&self) -> Vec<HashSet<String>> {
            let registry = &self.gateway.context().registry;
            self.gateway
                .connection_ids()
                .into_iter()
                .filter_map(|id| registry.get(id))
                .map(|c| c.rooms)
                .collect()
        }

        async fn stop(self) {
            self.gateway.shutdown();
            self.handle.await.unwrap();
        }
    }

    struct Client {
        _tmp: tempfile::TempDir,
        manager: ConnectionManager,
        events: mpsc::Receiver<ClientEvent>,
        rooms: Arc<RoomTracker>,
    }

    impl Client {
        async fn new(node: &Node, token: &str) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let rooms =
                Arc::new(RoomTracker::open(tmp.path().join("rooms.json"), token).unwrap());
            let mut config = ClientConfig::new(format!("ws://127.0.0.1:{}/", node.port), token);
            config.reconnect.base_delay = Duration::from_millis(50);
            config.reconnect.max_delay = Duration::from_millis(500);
            let monitor = NetworkMonitor::default();
            let manager = ConnectionManager::spawn(
                config,
                Arc::new(WsConnector),
                rooms.clone(),
                monitor.subscribe(),
            );
            let events = manager.take_events().await.unwrap();
            Self {
                _tmp: tmp,
                manager,
                events,
                rooms,
            }
        }

        async fn event_matching(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
            tokio::time::timeout(WAIT, async {
                loop {
                    let event = self.events.recv().await.expect("manager alive");
                    if pred(&event) {
                        break event;
                    }
                }
            })
            .await
            .expect("timed out waiting for client event")
        }

        async fn wait_ready(&mut self) {
            let mut state = self.manager.watch_state();
            tokio::time::timeout(WAIT, state.wait_for(|s| s.is_ready()))
                .await
                .expect("timed out waiting for ready")
                .unwrap();
        }

        async fn connect_ready(&mut self) {
            self.manager.connect().await.unwrap();
            self.wait_ready().await;
        }
    }

    fn room_set(rooms: &[&str]) -> HashSet<String> {
        rooms.iter().map(|r| r.to_string()).collect()
    }

    #[tokio::test]
    async fn rooms_restored_after_server_drop() {
        let node = Node::start().await;
        let mut alice = Client::new(&node, "tok-alice").await;
        alice.manager.join_room("A").await.unwrap();
        alice.manager.join_room("B").await.unwrap();
        alice.connect_ready().await;
        assert_eq!(node.rooms_of_all(), vec![room_set(&["A", "B"])]);

        let first = node.gateway.connection_ids();
        assert_eq!(first.len(), 1);
        assert!(node.gateway.disconnect(first[0]));

        let event = alice
            .event_matching(|e| matches!(e, ClientEvent::Reconnecting { .. }))
            .await;
        assert!(matches!(event, ClientEvent::Reconnecting { attempt: 0, .. }));
        let restored = alice
            .event_matching(|e| matches!(e, ClientEvent::Restored { .. }))
            .await;
        assert_eq!(restored, ClientEvent::Restored { rooms: 2 });

        let second = tokio::time::timeout(WAIT, async {
            loop {
                let ids = node.gateway.connection_ids();
                if ids.len() == 1 && ids[0] != first[0] {
                    break ids;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("old connection released");
        assert_ne!(second[0], first[0]);
        assert_eq!(node.rooms_of_all(), vec![room_set(&["A", "B"])]);
        assert_eq!(alice.manager.state(), ConnectionState::Ready);

        alice.manager.shutdown().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn outbox_flushed_in_order_minus_expired() {
        let node = Node::start().await;

        let mut bob = Client::new(&node, "tok-bob").await;
        bob.manager.join_room("r").await.unwrap();
        bob.connect_ready().await;

        let mut alice = Client::new(&node, "tok-alice").await;
        alice.manager.join_room("r").await.unwrap();
        alice
            .manager
            .send("r", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        alice
            .manager
            .send_with_ttl("r", serde_json::json!({"n": 2}), Duration::from_millis(20))
            .await
            .unwrap();
        alice
            .manager
            .send("r", serde_json::json!({"n": 3}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice.connect_ready().await;
        let dropped = alice
            .event_matching(|e| matches!(e, ClientEvent::MessageDropped { .. }))
            .await;
        assert_eq!(
            dropped,
            ClientEvent::MessageDropped {
                room_id: "r".into(),
                reason: DropReason::Expired,
            }
        );

        let mut received = Vec::new();
        while received.len() < 2 {
            if let ClientEvent::Message(RoomMessage { room_id, body }) = bob
                .event_matching(|e| matches!(e, ClientEvent::Message(_)))
                .await
            {
                assert_eq!(room_id, "r");
                received.push(body["n"].clone());
            }
        }
        assert_eq!(received, vec![serde_json::json!(1), serde_json::json!(3)]);

        alice.manager.shutdown().await;
        bob.manager.shutdown().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn live_messages_reach_other_members_only() {
        let node = Node::start().await;
        let mut alice = Client::new(&node, "tok-alice").await;
        let mut bob = Client::new(&node, "tok-bob").await;
        alice.manager.join_room("lobby").await.unwrap();
        bob.manager.join_room("lobby").await.unwrap();
        alice.connect_ready().await;
        bob.connect_ready().await;

        alice
            .manager
            .send("lobby", serde_json::json!("hello"))
            .await
            .unwrap();
        let event = bob
            .event_matching(|e| matches!(e, ClientEvent::Message(_)))
            .await;
        assert_eq!(
            event,
            ClientEvent::Message(RoomMessage {
                room_id: "lobby".into(),
                body: serde_json::json!("hello"),
            })
        );

        // The sender does not get its own frame back.
        let echoed = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match alice.events.recv().await {
                    Some(ClientEvent::Message(_)) => break,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(echoed.is_err());

        alice.manager.shutdown().await;
        bob.manager.shutdown().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn join_while_ready_reaches_gateway() {
        let node = Node::start().await;
        let mut alice = Client::new(&node, "tok-alice").await;
        alice.connect_ready().await;

        assert!(alice.manager.join_room("late").await.unwrap());
        let joined = alice
            .event_matching(|e| matches!(e, ClientEvent::RoomJoined(_)))
            .await;
        assert_eq!(joined, ClientEvent::RoomJoined("late".into()));
        assert_eq!(node.rooms_of_all(), vec![room_set(&["late"])]);
        assert!(alice.rooms.all_rooms().contains("late"));

        alice.manager.shutdown().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn bad_credential_is_fatal() {
        let node = Node::start().await;
        let mut mallory = Client::new(&node, "tok-wrong").await;
        mallory.manager.connect().await.unwrap();

        let event = mallory
            .event_matching(|e| matches!(e, ClientEvent::AuthFailed(_)))
            .await;
        assert!(matches!(event, ClientEvent::AuthFailed(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mallory.manager.state(), ConnectionState::Disconnected);
        assert!(node.gateway.connection_ids().is_empty());

        mallory.manager.shutdown().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn unreachable_gateway_gives_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let tmp = tempfile::tempdir().unwrap();
        let rooms = Arc::new(RoomTracker::open(tmp.path().join("rooms.json"), "s").unwrap());
        let mut config = ClientConfig::new(format!("ws://127.0.0.1:{port}/"), "tok");
        config.reconnect.base_delay = Duration::from_millis(10);
        config.reconnect.max_delay = Duration::from_millis(20);
        config.reconnect.max_attempts = 3;
        let monitor = NetworkMonitor::default();
        let manager =
            ConnectionManager::spawn(config, Arc::new(WsConnector), rooms, monitor.subscribe());
        let mut events = manager.take_events().await.unwrap();
        manager.connect().await.unwrap();

        let gave_up = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(event @ ClientEvent::GaveUp { .. }) = events.recv().await {
                    break event;
                }
            }
        })
        .await
        .expect("gave up");
        assert_eq!(gave_up, ClientEvent::GaveUp { attempts: 3 });
        manager.shutdown().await;
    }
}
