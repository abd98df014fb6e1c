use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::ChatError;
use parley_types::api::Claims;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::ConnId;
use crate::session::SessionManager;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long an unauthenticated socket may stay open waiting for `Identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Sender = SplitSink<WebSocket, Message>;
type Receiver = SplitStream<WebSocket>;

/// Serve one gateway socket. `claims` is set when the token was already
/// checked at the HTTP upgrade; otherwise the client must send `Identify`.
pub async fn handle_connection(socket: WebSocket, sessions: SessionManager, claims: Option<Claims>) {
    let (mut sender, mut receiver) = socket.split();

    let claims = match claims {
        Some(claims) => claims,
        None => match wait_for_identify(&mut receiver, &sessions).await {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Gateway identify failed: {}", e);
                let _ = send_event(&mut sender, &error_event(&e, None)).await;
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        },
    };

    let (handle, user) = match sessions.connect(&claims).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!("Gateway connect for {} failed: {}", claims.sub, e);
            let _ = send_event(&mut sender, &error_event(&e, None)).await;
            return;
        }
    };

    let ready = GatewayEvent::Ready {
        user_id: user.id,
        name: user.name.clone(),
    };
    let conn_id = handle.conn_id;
    let user_id = user.id;

    if send_event(&mut sender, &ready).await {
        run_connection_loop(sender, receiver, handle, sessions.clone(), user_id).await;
    }

    sessions.disconnect(conn_id, user_id).await;
}

async fn run_connection_loop(
    mut sender: Sender,
    mut receiver: Receiver,
    mut handle: crate::dispatcher::ConnectionHandle,
    sessions: SessionManager,
    user_id: Uuid,
) {
    let conn_id = handle.conn_id;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Queue -> socket, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = handle.events.recv() => {
                    // The dispatcher closed our queue: unregistered or session revoked.
                    let Some(event) = event else { break };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                lost = handle.lost.wait() => {
                    for chat_id in lost {
                        if !send_event(&mut sender, &GatewayEvent::SubscriptionLost { chat_id }).await {
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Client commands
    let recv_sessions = sessions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_sessions, conn_id, user_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        let err = ChatError::InvalidArgument(format!("malformed command: {}", e));
                        recv_sessions.dispatcher().notify(conn_id, error_event(&err, None)).await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(sessions: &SessionManager, conn_id: ConnId, user_id: Uuid, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Identify { .. } => {
            debug!("{} sent Identify on an authenticated connection", user_id);
        }

        GatewayCommand::Subscribe { chat_id } => {
            if let Err(e) = sessions.subscribe(conn_id, user_id, chat_id).await {
                if let ChatError::Internal(_) = e {
                    error!("Subscribe {} -> {} failed: {}", user_id, chat_id, e);
                } else {
                    info!("Subscribe {} -> {} refused: {}", user_id, chat_id, e);
                }
                sessions
                    .dispatcher()
                    .notify(conn_id, error_event(&e, Some(chat_id)))
                    .await;
            }
        }

        GatewayCommand::Unsubscribe { chat_id } => {
            sessions.unsubscribe(conn_id, chat_id).await;
        }

        GatewayCommand::SubscribeInbox => {
            sessions.subscribe_inbox(conn_id).await;
        }

        GatewayCommand::UnsubscribeInbox => {
            sessions.unsubscribe_inbox(conn_id).await;
        }
    }
}

async fn wait_for_identify(receiver: &mut Receiver, sessions: &SessionManager) -> Result<Claims, ChatError> {
    let identify = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) {
                    return Some(token);
                }
            }
        }
        None
    });

    match identify.await {
        Ok(Some(token)) => sessions.authenticate(&token).await,
        Ok(None) => Err(ChatError::Unauthenticated("connection closed before identify".to_string())),
        Err(_) => Err(ChatError::Unauthenticated("identify timed out".to_string())),
    }
}

fn error_event(err: &ChatError, chat_id: Option<Uuid>) -> GatewayEvent {
    GatewayEvent::Error {
        kind: err.kind(),
        message: err.public_message(),
        chat_id,
    }
}

/// Returns false once the socket is gone.
async fn send_event(sender: &mut Sender, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}
