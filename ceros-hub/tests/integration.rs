//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on an ephemeral port and drives it with
//! tokio-tungstenite clients.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use ceros_hub::{
    AllowAll, ChatMessage, CollaboratorError, Envelope, Event, Hub, HubHandle, HubServer,
    MembershipPolicy, MemoryStore, MessageStore, MessageType, RoomAuthorizer, RoomId,
    SenderProfile, ServerConfig, Services, StaticTokens, UserId,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    hub: HubHandle,
}

/// Start a server on a free port with tokens `tx`, `ty`, `tz` for users x, y, z.
async fn start_server(config: ServerConfig, authorizer: Arc<dyn RoomAuthorizer>) -> TestServer {
    start_with_store(config, authorizer, Arc::new(MemoryStore::new())).await
}

async fn start_with_store(
    config: ServerConfig,
    authorizer: Arc<dyn RoomAuthorizer>,
    store: Arc<dyn MessageStore>,
) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let hub = Hub::new().spawn(config.hub_queue_capacity);
    let services = Services {
        authenticator: Arc::new(StaticTokens::parse("tx=x,ty=y,tz=z")),
        authorizer,
        store,
    };
    let server = HubServer::new(config, hub.clone(), services);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer { port, hub }
}

async fn start_default() -> TestServer {
    start_server(ServerConfig::default(), Arc::new(AllowAll)).await
}

/// A client that splits batched frames back into envelopes.
struct Client {
    ws: Socket,
    pending: VecDeque<Envelope>,
}

impl Client {
    async fn connect(port: u16, token: &str) -> Self {
        let url = format!("ws://127.0.0.1:{port}/ws/chat?token={token}");
        let (ws, _) = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(url))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, action: &str, kind: &str, payload: Value) {
        let text = json!({"action": action, "type": kind, "payload": payload}).to_string();
        self.ws.send(Message::text(text)).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.unwrap();
    }

    async fn join(&mut self, room: &str) {
        self.send("join_room", "group", json!(room)).await;
    }

    /// Next envelope, or `None` if nothing arrives within `wait`.
    async fn try_recv(&mut self, wait: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(env) = self.pending.pop_front() {
                return Some(env);
            }
            let msg = timeout(deadline.saturating_duration_since(Instant::now()), self.ws.next())
                .await
                .ok()??
                .ok()?;
            if let Message::Text(text) = msg {
                for line in text.as_str().split('\n') {
                    self.pending.push_back(Envelope::decode(line).expect("server sent bad JSON"));
                }
            }
        }
    }

    async fn recv(&mut self) -> Envelope {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("expected an envelope")
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Poll until the room has exactly `count` members.
async fn wait_for_members(hub: &HubHandle, room: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let members = hub.room_members(room.into()).await.unwrap();
        if members.len() == count {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "room {room} has {} members, wanted {count}",
            members.len()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_connections(hub: &HubHandle, count: usize, within: Duration) {
    let deadline = Instant::now() + within;
    loop {
        let stats = hub.stats().await.unwrap();
        if stats.active_connections == count {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} active connections, wanted {count}",
            stats.active_connections
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_room_fan_out_reaches_members_only() {
    let server = start_default().await;
    let mut x = Client::connect(server.port, "tx").await;
    let mut y = Client::connect(server.port, "ty").await;
    let mut z = Client::connect(server.port, "tz").await;

    x.join("r1").await;
    y.join("r1").await;
    wait_for_members(&server.hub, "r1", 2).await;

    x.send("send_message", "group", json!({"roomId": "r1", "content": "hi"})).await;

    for client in [&mut x, &mut y] {
        let env = client.recv().await;
        assert_eq!(env.action, "new_message");
        assert_eq!(env.payload["content"], "hi");
        assert_eq!(env.payload["senderId"], "x");
    }
    assert!(z.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_disconnect_prunes_room() {
    let server = start_default().await;
    let mut x = Client::connect(server.port, "tx").await;

    x.join("r1").await;
    wait_for_members(&server.hub, "r1", 1).await;

    x.close().await;
    wait_for_members(&server.hub, "r1", 0).await;
    wait_for_connections(&server.hub, 0, Duration::from_secs(2)).await;

    server
        .hub
        .broadcast_to_room("r1".into(), Envelope::event(Event::NewMessage, MessageType::Group, json!({})))
        .await
        .unwrap();

    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.broadcasts, 0);
}

#[tokio::test]
async fn test_two_sockets_same_user_are_independent() {
    let server = start_default().await;
    let mut tab1 = Client::connect(server.port, "tx").await;
    let mut tab2 = Client::connect(server.port, "tx").await;

    tab1.join("r1").await;
    wait_for_members(&server.hub, "r1", 1).await;

    server
        .hub
        .broadcast_to_room("r1".into(), Envelope::event(Event::NewMessage, MessageType::Group, json!({})))
        .await
        .unwrap();

    assert_eq!(tab1.recv().await.action, "new_message");
    assert!(tab2.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_read_timeout() {
    let mut config = ServerConfig::default();
    config.connection = config.connection.with_read_timeout(Duration::from_millis(300));
    let server = start_server(config, Arc::new(AllowAll)).await;

    // Never polled, so it never answers the server's pings.
    let mut idle = Client::connect(server.port, "tx").await;
    idle.join("r1").await;
    wait_for_members(&server.hub, "r1", 1).await;

    wait_for_connections(&server.hub, 0, Duration::from_secs(3)).await;
    assert!(server.hub.room_members("r1".into()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_responsive_client_survives_keepalive() {
    let mut config = ServerConfig::default();
    config.connection = config.connection.with_read_timeout(Duration::from_secs(1));
    let server = start_server(config, Arc::new(AllowAll)).await;

    let mut x = Client::connect(server.port, "tx").await;
    // Polling the stream makes tungstenite answer each Ping with a Pong.
    assert!(x.try_recv(Duration::from_millis(2500)).await.is_none());

    assert_eq!(server.hub.stats().await.unwrap().active_connections, 1);
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let server = start_default().await;

    let cases = [
        (format!("ws://127.0.0.1:{}/ws/chat", server.port), 401),
        (format!("ws://127.0.0.1:{}/ws/chat?token=bogus", server.port), 401),
        (format!("ws://127.0.0.1:{}/elsewhere?token=tx", server.port), 404),
    ];
    for (url, status) in cases {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), status, "{url}");
            }
            other => panic!("{url}: expected HTTP rejection, got {:?}", other.map(|_| ())),
        }
    }

    assert_eq!(server.hub.stats().await.unwrap().total_connections, 0);
}

#[tokio::test]
async fn test_malformed_frame_does_not_close_connection() {
    let server = start_default().await;
    let mut x = Client::connect(server.port, "tx").await;

    x.send_raw("this is not json").await;
    x.send_raw(r#"{"type":"group"}"#).await;
    x.send("dance", "group", json!(null)).await;

    x.join("r1").await;
    wait_for_members(&server.hub, "r1", 1).await;
    x.send("send_message", "group", json!({"roomId": "r1", "content": "still here"})).await;

    assert_eq!(x.recv().await.payload["content"], "still here");
}

#[tokio::test]
async fn test_committee_join_denied() {
    let policy = Arc::new(MembershipPolicy::new());
    policy.add_committee_member("c1", "y".into()).await;
    let server = start_server(ServerConfig::default(), policy).await;

    let mut x = Client::connect(server.port, "tx").await;
    let mut y = Client::connect(server.port, "ty").await;
    let room = RoomId::committee("c1");

    y.join(room.as_str()).await;
    wait_for_members(&server.hub, room.as_str(), 1).await;

    x.join(room.as_str()).await;
    let env = x.recv().await;
    assert_eq!(env.action, "error");
    assert_eq!(env.kind, "system");

    // The denial went to x only.
    assert!(y.try_recv(Duration::from_millis(200)).await.is_none());
    assert_eq!(server.hub.room_members(room).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_external_reaction_update() {
    let server = start_default().await;
    let mut x = Client::connect(server.port, "tx").await;
    x.join("dm_x_y").await;
    wait_for_members(&server.hub, "dm_x_y", 1).await;

    let update = Envelope::event(
        Event::ReactionUpdate,
        MessageType::Dm,
        json!({"messageId": "m1", "emoji": "👍", "userId": "y"}),
    );
    server.hub.broadcast_to_room("dm_x_y".into(), update).await.unwrap();

    let env = x.recv().await;
    assert_eq!(env.action, "reaction_update");
    assert_eq!(env.payload["emoji"], "👍");
}

#[tokio::test]
async fn test_burst_is_delivered_in_order() {
    let server = start_default().await;
    let mut x = Client::connect(server.port, "tx").await;
    x.join("r1").await;
    wait_for_members(&server.hub, "r1", 1).await;

    for i in 0..50 {
        server
            .hub
            .broadcast_to_room("r1".into(), Envelope::event(Event::NewMessage, MessageType::Group, json!({"n": i})))
            .await
            .unwrap();
    }

    for i in 0..50 {
        assert_eq!(x.recv().await.payload["n"], i);
    }
}

/// A store that never answers.
struct HungStore;

#[async_trait]
impl MessageStore for HungStore {
    async fn save_message(&self, _: &ChatMessage) -> Result<(), CollaboratorError> {
        std::future::pending().await
    }

    async fn increment_thread_count(&self, _: Uuid) -> Result<(), CollaboratorError> {
        std::future::pending().await
    }

    async fn sender_profile(&self, _: &UserId) -> Result<SenderProfile, CollaboratorError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_hung_store_does_not_stall_fan_out() {
    let mut config = ServerConfig::default();
    config.connection = config
        .connection
        .with_collaborator_timeout(Duration::from_millis(100));
    let server = start_with_store(config, Arc::new(AllowAll), Arc::new(HungStore)).await;

    let mut x = Client::connect(server.port, "tx").await;
    let mut y = Client::connect(server.port, "ty").await;
    x.join("r1").await;
    y.join("r1").await;
    wait_for_members(&server.hub, "r1", 2).await;

    x.send("send_message", "group", json!({"roomId": "r1", "content": "first"})).await;
    x.send("send_message", "group", json!({"roomId": "r1", "content": "second"})).await;

    // Both frames arrive, so the sender's read pump kept going too.
    assert_eq!(y.recv().await.payload["content"], "first");
    assert_eq!(y.recv().await.payload["content"], "second");
}
