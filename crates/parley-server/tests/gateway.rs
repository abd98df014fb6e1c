use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use parley_api::{AppState, AppStateInner};
use parley_db::{Database, Store, StoreConfig};
use parley_gateway::{ConversationLocks, Dispatcher, SessionManager, TokenAuthority};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (SocketAddr, AppState) {
    let store = Store::new(Database::open_in_memory().unwrap(), StoreConfig::default());
    let sessions = SessionManager::new(
        store.clone(),
        Dispatcher::new(),
        TokenAuthority::new("e2e-secret", TimeDelta::hours(1)),
        Arc::new(ConversationLocks::new(Duration::from_secs(2))),
        Duration::from_millis(50),
    );
    let state = AppStateInner::new(store, sessions);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = parley_api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "PresenceUpdate" {
                return value;
            }
        }
    }
}

async fn send(socket: &mut Socket, command: Value) {
    socket.send(Message::text(command.to_string())).await.unwrap();
}

#[tokio::test]
async fn subscribed_socket_receives_messages_in_order() {
    let (addr, app) = serve().await;
    let ann = app.identity.register("ann@example.com", "secret-pw", "Ann").await.unwrap();
    let bob = app.identity.register("bob@example.com", "secret-pw", "Bob").await.unwrap();
    let (chat, _) = app.conversations.find_or_create(ann.user.id, bob.user.id).await.unwrap();

    let url = format!("ws://{}/gateway?token={}", addr, bob.token);
    let (mut socket, _) = connect_async(url).await.unwrap();

    let ready = next_json(&mut socket).await;
    assert_eq!(ready["type"], "Ready");
    assert_eq!(ready["data"]["name"], "Bob");

    send(&mut socket, json!({ "type": "Subscribe", "data": { "chat_id": chat.id } })).await;
    let subscribed = next_json(&mut socket).await;
    assert_eq!(subscribed["type"], "Subscribed");

    for text in ["hello", "how are you", "bye"] {
        app.messages.append(chat.id, ann.user.id, text).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        let event = next_json(&mut socket).await;
        if event["type"] == "MessageCreate" {
            received.push(event["data"]["text"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(received, ["hello", "how are you", "bye"]);
}

#[tokio::test]
async fn identify_after_connect_and_errors_keep_socket_open() {
    let (addr, app) = serve().await;
    let ann = app.identity.register("ann@example.com", "secret-pw", "Ann").await.unwrap();
    let bob = app.identity.register("bob@example.com", "secret-pw", "Bob").await.unwrap();
    let eve = app.identity.register("eve@example.com", "secret-pw", "Eve").await.unwrap();
    let (chat, _) = app.conversations.find_or_create(ann.user.id, bob.user.id).await.unwrap();

    let (mut socket, _) = connect_async(format!("ws://{}/gateway", addr)).await.unwrap();
    send(&mut socket, json!({ "type": "Identify", "data": { "token": eve.token } })).await;
    assert_eq!(next_json(&mut socket).await["type"], "Ready");

    send(&mut socket, json!({ "type": "Subscribe", "data": { "chat_id": chat.id } })).await;
    let refused = next_json(&mut socket).await;
    assert_eq!(refused["type"], "Error");
    assert_eq!(refused["data"]["kind"], "forbidden");

    socket.send(Message::text("{not json")).await.unwrap();
    let malformed = next_json(&mut socket).await;
    assert_eq!(malformed["data"]["kind"], "invalid_argument");

    send(&mut socket, json!({ "type": "SubscribeInbox" })).await;
    assert_eq!(next_json(&mut socket).await["type"], "InboxSubscribed");
}

#[tokio::test]
async fn bad_token_is_refused_at_upgrade() {
    let (addr, _app) = serve().await;
    let err = connect_async(format!("ws://{}/gateway?token=garbage", addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn logout_closes_the_socket() {
    let (addr, app) = serve().await;
    let ann = app.identity.register("ann@example.com", "secret-pw", "Ann").await.unwrap();

    let (mut socket, _) = connect_async(format!("ws://{}/gateway?token={}", addr, ann.token))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "Ready");

    let claims = app.sessions.authenticate(&ann.token).await.unwrap();
    app.identity.logout(&claims).await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}
