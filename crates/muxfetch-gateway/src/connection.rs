use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use muxfetch_engine::SessionManager;
use muxfetch_types::events::{ControlCommand, ControlEvent};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// Bind one WebSocket to one session for its whole lifetime.
///
/// The session's `USER_ID` and `PROGRESS` events are forwarded as JSON text
/// frames. The loop ends when the socket closes, the heartbeat times out, or
/// the session is removed (its event channel closes). Either way the session
/// is torn down afterwards.
pub async fn handle_connection(socket: WebSocket, sessions: SessionManager) {
    let (mut sender, mut receiver) = socket.split();
    let (session_id, mut events) = sessions.on_connect();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let send_id = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut monitor = HeartbeatMonitor::default();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        // Session removed: delivered or cancelled.
                        debug!("Session {}: event channel closed", send_id);
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    let Some(msg) = event_message(&event) else {
                        continue;
                    };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if !monitor.tick(pong_flag_send.swap(false, Ordering::Acquire)) {
                        warn!("Session {}: heartbeat timeout, dropping connection", send_id);
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_sessions = sessions.clone();
    let recv_id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ControlCommand>(&text) {
                    Ok(ControlCommand::Cancel) => {
                        info!("Session {}: cancel requested", recv_id);
                        recv_sessions.on_cancel(&recv_id).await;
                    }
                    Err(e) => {
                        warn!(
                            "Session {}: ignoring message: {} -- raw: {}",
                            recv_id,
                            e,
                            truncate(&text, 200)
                        );
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

    sessions.on_disconnect(&session_id).await;
    info!("Session {} disconnected from gateway", session_id);
}

fn event_message(event: &ControlEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to encode {:?}: {}", event, e);
            None
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Counts consecutive heartbeat ticks without a pong.
#[derive(Debug, Default)]
struct HeartbeatMonitor {
    missed: u8,
}

impl HeartbeatMonitor {
    /// Record one tick. Returns `false` once the peer is considered dead.
    fn tick(&mut self, pong_seen: bool) -> bool {
        if pong_seen {
            self.missed = 0;
        } else {
            self.missed += 1;
        }
        self.missed < MAX_MISSED_PONGS
    }
}
