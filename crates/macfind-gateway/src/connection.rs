use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use macfind_types::events::{RealtimeCommand, RealtimeEvent};

use crate::dispatcher::Dispatcher;
use crate::subscriptions::Subscriptions;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one realtime connection. The token was validated at the HTTP
/// upgrade, so the client goes straight to Ready.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, user_id: Uuid) {
    let (mut sender, receiver) = socket.split();

    info!("{} connected to realtime feed", user_id);

    if send_event(&mut sender, &RealtimeEvent::Ready { user_id }).await.is_err() {
        return;
    }

    dispatcher.connected(user_id).await;
    run_connection_loop(sender, receiver, &dispatcher, user_id).await;
    dispatcher.disconnected(user_id).await;

    info!("{} disconnected from realtime feed", user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: &Dispatcher,
    user_id: Uuid,
) {
    let mut changes_rx = dispatcher.subscribe();

    // Per-connection filters, shared between the send and recv tasks.
    let subscriptions = Arc::new(Mutex::new(Subscriptions::new(user_id)));
    let send_subscriptions = subscriptions.clone();

    // Replies to client commands are written by the send task only.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<RealtimeEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = changes_rx.recv() => {
                    let change = match result {
                        Ok(change) => change,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Realtime receiver for {} lagged by {} changes", user_id, n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    let events = send_subscriptions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .route(&change);

                    let mut closed = false;
                    for event in &events {
                        if send_event(&mut sender, event).await.is_err() {
                            closed = true;
                            break;
                        }
                    }
                    if closed {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
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
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<RealtimeCommand>(&text) {
                        Ok(cmd) => subscriptions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .apply(cmd),
                        Err(e) => {
                            warn!(
                                "{} bad realtime command: {} -- raw: {}",
                                user_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                            Some(RealtimeEvent::Error {
                                message: format!("bad command: {}", e),
                            })
                        }
                    };
                    if let Some(reply) = reply {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RealtimeEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode realtime event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
