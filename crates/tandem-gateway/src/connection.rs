use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use tandem_types::events::{Ack, GatewayCommand, GatewayEvent};

use crate::handlers::{self, ChatContext, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one WebSocket connection. The JWT was already validated at the HTTP
/// upgrade, so `user_id` is trusted; the client still has to `register` before
/// it counts as online.
pub async fn handle_connection(socket: WebSocket, ctx: ChatContext, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut events_rx) = ctx.dispatcher.register_connection(user_id).await;
    let mut session = Session::new(conn_id, user_id);

    info!("User {} connected to gateway ({})", user_id, conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    // Forward events for this connection -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
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

    // Read commands from client. Replies go through the dispatcher so they
    // share the socket's single writer.
    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => {
                        let reply = match serde_json::from_str::<GatewayCommand>(&text) {
                            Ok(cmd) => handlers::handle_command(&ctx, &mut session, cmd).await,
                            Err(e) => {
                                warn!(
                                    "User {} sent a bad command: {} -- raw: {}",
                                    user_id,
                                    e,
                                    text.chars().take(200).collect::<String>()
                                );
                                GatewayEvent::Ack(Ack::failed("unknown", "VALIDATION", e.to_string()))
                            }
                        };
                        ctx.dispatcher.send_to_connection(conn_id, reply).await;
                    }
                    Message::Pong(_) => {
                        pong_received.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    send_task.abort();
    handlers::disconnect(&ctx, &session).await;
    info!("User {} disconnected from gateway ({})", user_id, conn_id);
}
