// tests/websocket.rs

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use chat_app::{
    ChatState,
    config::WebSocketSettings,
    database::ChatStore,
    memory::MemoryStore,
    models::{NewUser, User, UserId},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

struct Server {
    addr: SocketAddr,
    state: ChatState,
    store: Arc<MemoryStore>,
}

async fn start_server() -> Server {
    start_server_with(WebSocketSettings::default()).await
}

async fn start_server_with(settings: WebSocketSettings) -> Server {
    let store = Arc::new(MemoryStore::new());
    let state = ChatState::new(store.clone(), settings);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = chat_app::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server { addr, state, store }
}

async fn add_user(store: &MemoryStore, name: &str) -> User {
    store
        .create_user(NewUser {
            name: name.to_string(),
            email: format!("{name}@example.com"),
            password: "password".to_string(),
            avatar_url: String::new(),
        })
        .await
        .unwrap()
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

async fn join(server: &Server, client: &mut Client, chat_id: i64, user_id: UserId) {
    send_json(client, json!({"Type": "join_chat", "ChatID": chat_id, "UserID": user_id})).await;
    wait_for_registration(server, user_id).await;
}

/// Joins carry no acknowledgement, so poll the registry until the server has processed it.
async fn wait_for_registration(server: &Server, user_id: UserId) {
    tokio::time::timeout(WAIT, async {
        while server.state.registry.connection_for(user_id).await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user never registered");
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(client: &mut Client) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no frame received")
}

async fn assert_silent(client: &mut Client) {
    let received = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(received.is_err(), "unexpected frame: {received:?}");
}

#[tokio::test]
async fn offline_sender_fans_out_to_joined_members() {
    let server = start_server().await;
    let a = add_user(&server.store, "a").await;
    let b = add_user(&server.store, "b").await;
    let c = add_user(&server.store, "c").await;
    let chat = server.store.create_chat("seven").await.unwrap();
    for user in [&a, &b, &c] {
        server.store.add_member(chat.id, user.id).await.unwrap();
    }

    let mut client_a = connect(server.addr).await;
    let mut client_b = connect(server.addr).await;
    let mut client_c = connect(server.addr).await;
    join(&server, &mut client_a, chat.id, a.id).await;
    join(&server, &mut client_b, chat.id, b.id).await;

    send_json(
        &mut client_c,
        json!({"Type": "send_message", "ChatID": chat.id, "UserID": c.id, "Message": "hi"}),
    )
    .await;

    let expected = json!({
        "Type": "new_message",
        "FromUserEmail": "c@example.com",
        "Message": "hi",
    });
    assert_eq!(next_json(&mut client_a).await, expected);
    assert_eq!(next_json(&mut client_b).await, expected);
    assert_silent(&mut client_a).await;
    assert_silent(&mut client_c).await;

    let stored = server.store.messages_in(chat.id).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].from_id, c.id);
    assert_eq!(stored[0].content, "hi");
}

#[tokio::test]
async fn rejoin_closes_previous_connection() {
    let server = start_server().await;
    let a = add_user(&server.store, "a").await;
    let b = add_user(&server.store, "b").await;
    let chat = server.store.create_chat("pair").await.unwrap();
    server.store.add_member(chat.id, a.id).await.unwrap();
    server.store.add_member(chat.id, b.id).await.unwrap();

    let mut first = connect(server.addr).await;
    join(&server, &mut first, chat.id, a.id).await;
    let first_conn = server.state.registry.connection_for(a.id).await;

    let mut second = connect(server.addr).await;
    send_json(&mut second, json!({"Type": "join_chat", "ChatID": chat.id, "UserID": a.id})).await;

    // The first socket is closed by the server.
    tokio::time::timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("previous connection was not closed");

    assert_ne!(server.state.registry.connection_for(a.id).await, first_conn);
    assert_eq!(server.state.registry.len().await, 1);

    let mut sender = connect(server.addr).await;
    send_json(
        &mut sender,
        json!({
            "Type": "send_message",
            "ChatID": chat.id,
            "UserID": b.id,
            "Message": "still there?",
        }),
    )
    .await;
    assert_eq!(next_json(&mut second).await["Message"], "still there?");
}

#[tokio::test]
async fn duplicate_join_keeps_one_registration() {
    let server = start_server().await;
    let a = add_user(&server.store, "a").await;
    let chat = server.store.create_chat("solo").await.unwrap();

    let mut client = connect(server.addr).await;
    join(&server, &mut client, chat.id, a.id).await;
    let conn = server.state.registry.connection_for(a.id).await;
    join(&server, &mut client, chat.id, a.id).await;
    // The repeated join must not close the socket.
    assert_silent(&mut client).await;

    assert_eq!(server.state.registry.connection_for(a.id).await, conn);
    assert_eq!(server.state.registry.len().await, 1);
}

#[tokio::test]
async fn bad_frames_are_ignored() {
    let server = start_server().await;
    let a = add_user(&server.store, "a").await;
    let chat = server.store.create_chat("noise").await.unwrap();

    let mut client = connect(server.addr).await;
    client.send(Message::text("not json")).await.unwrap();
    send_json(&mut client, json!({"Type": "leave_chat", "ChatID": chat.id})).await;
    send_json(&mut client, json!({"Type": "join_chat"})).await;
    client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();

    // The connection survives and still handles valid frames.
    join(&server, &mut client, chat.id, a.id).await;
}

#[tokio::test]
async fn store_failure_is_reported_to_sender_only() {
    let server = start_server().await;
    let a = add_user(&server.store, "a").await;
    let b = add_user(&server.store, "b").await;
    let chat = server.store.create_chat("real").await.unwrap();
    server.store.add_member(chat.id, a.id).await.unwrap();
    server.store.add_member(chat.id, b.id).await.unwrap();

    let mut client_a = connect(server.addr).await;
    let mut client_b = connect(server.addr).await;
    join(&server, &mut client_a, chat.id, a.id).await;
    join(&server, &mut client_b, chat.id, b.id).await;

    send_json(
        &mut client_a,
        json!({"Type": "send_message", "ChatID": 9999, "UserID": a.id, "Message": "lost"}),
    )
    .await;

    let error = next_json(&mut client_a).await;
    assert_eq!(error["Type"], "error");
    assert!(error["Message"].as_str().unwrap().contains("9999"));
    assert_silent(&mut client_b).await;
}

#[tokio::test]
async fn disconnect_releases_registration() {
    let server = start_server().await;
    let a = add_user(&server.store, "a").await;
    let chat = server.store.create_chat("brief").await.unwrap();

    let mut client = connect(server.addr).await;
    join(&server, &mut client, chat.id, a.id).await;
    client.close(None).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while server.state.registry.connection_for(a.id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration was not released");
}

#[tokio::test]
async fn idle_connection_is_pinged() {
    let server = start_server_with(WebSocketSettings {
        ping_interval_secs: 1,
        ..WebSocketSettings::default()
    })
    .await;
    let mut client = connect(server.addr).await;

    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_))) => break,
                Some(Ok(_)) => continue,
                other => panic!("connection ended before a ping: {other:?}"),
            }
        }
    })
    .await
    .expect("no ping within the interval");
}

#[tokio::test]
async fn plain_get_requires_upgrade() {
    let state = ChatState::new(Arc::new(MemoryStore::new()), WebSocketSettings::default());
    let response = chat_app::router(state)
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn health_reports_connections() {
    let state = ChatState::new(Arc::new(MemoryStore::new()), WebSocketSettings::default());
    let response = chat_app::router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), 1024).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"status": "ok", "connections": 0}));
}
