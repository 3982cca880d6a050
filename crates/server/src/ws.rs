//! STOMP-over-WebSocket broker for room topics.
//!
//! Clients subscribe to `/topic/room/{id}` and send to `/app/room/{id}`.
//! Every SEND is stored, stamped with an id and server time, and relayed as a
//! MESSAGE to each subscription on the room's topic.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use storetalk_shared::{
    room_from_destination, room_topic, ChatMessage, Command, Frame, Heartbeat, OutboundMessage,
    RoomId, SenderRole, APP_PREFIX, TOPIC_PREFIX,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::AppState;

/// Broker MESSAGE body. Uses the legacy field names still emitted by the
/// production broker.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayedMessage<'a> {
    id: &'a str,
    chat_room_id: &'a str,
    sender: &'a str,
    message: &'a str,
    sender_type: SenderRole,
    created_at: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
}

impl<'a> From<&'a ChatMessage> for RelayedMessage<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        Self {
            id: &m.id,
            chat_room_id: m.room_id.as_str(),
            sender: &m.sender_id,
            message: &m.content,
            sender_type: m.sender_role,
            created_at: &m.timestamp,
            client_id: m.client_id.as_deref(),
        }
    }
}

/// What the socket loop should do after handling a frame
enum Flow {
    Continue,
    Close,
}

/// One socket's live subscriptions, keyed by the client's subscription id
struct Subscriptions {
    entries: HashMap<String, (RoomId, JoinHandle<()>)>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<String>();
    let (beat_tx, mut beat_rx) = mpsc::unbounded_channel::<Duration>();

    // Writer: queued frames plus outgoing heart-beats once negotiated
    let send_task = tokio::spawn(async move {
        let mut beat: Option<tokio::time::Interval> = None;
        loop {
            tokio::select! {
                frame = forward_rx.recv() => match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(period) = beat_rx.recv() => {
                    let start = tokio::time::Instant::now() + period;
                    beat = Some(tokio::time::interval_at(start, period));
                }
                _ = next_beat(&mut beat) => {
                    if sender.send(Message::Text("\n".into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    let mut kicked = state.kicked();
    let mut connected = false;
    let mut subscriptions = Subscriptions {
        entries: HashMap::new(),
    };

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = kicked.recv() => {
                tracing::info!("Dropping connection {}", conn_id);
                break;
            }
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!("Connection {} read error: {}", conn_id, e);
                break;
            }
            Some(Ok(_)) => continue,
        };

        let frame = match Frame::decode(text.as_str()) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                let _ = forward_tx.send(Frame::error("malformed frame", e.to_string()).encode());
                break;
            }
        };

        let flow = if !connected {
            match handshake(&frame, &state, &forward_tx, &beat_tx) {
                Ok(()) => {
                    connected = true;
                    state.connection_opened();
                    tracing::info!("STOMP session {} established", conn_id);
                    Flow::Continue
                }
                Err(reason) => {
                    tracing::warn!("Rejecting connection {}: {}", conn_id, reason);
                    let _ = forward_tx.send(Frame::error(&reason, String::new()).encode());
                    Flow::Close
                }
            }
        } else {
            handle_frame(frame, &state, &forward_tx, &mut subscriptions).await
        };

        if let Flow::Close = flow {
            break;
        }
    }

    // Cleanup
    for (_, (room, handle)) in subscriptions.entries.drain() {
        handle.abort();
        state.track_unsubscribe(&room).await;
    }
    drop(forward_tx);
    drop(beat_tx);
    // Let the writer flush any final RECEIPT or ERROR before closing
    let mut send_task = send_task;
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    tracing::info!("Connection {} closed", conn_id);
}

async fn next_beat(beat: &mut Option<tokio::time::Interval>) {
    match beat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Validate CONNECT and reply CONNECTED with the server's heart-beat offer.
fn handshake(
    frame: &Frame,
    state: &AppState,
    forward_tx: &mpsc::UnboundedSender<String>,
    beat_tx: &mpsc::UnboundedSender<Duration>,
) -> Result<(), String> {
    if !matches!(frame.command, Command::Connect | Command::Stomp) {
        return Err(format!("expected CONNECT, got {}", frame.command));
    }
    if !state.config.accepts(frame.get("Authorization")) {
        return Err("invalid or missing bearer token".to_string());
    }

    let ours = state.config.heartbeat;
    let peer = frame
        .get("heart-beat")
        .and_then(Heartbeat::parse)
        .unwrap_or_default();
    let (outgoing, _incoming) = ours.negotiate(&peer);

    let _ = forward_tx.send(Frame::connected(ours).encode());
    if let Some(period) = outgoing {
        let _ = beat_tx.send(period);
    }
    Ok(())
}

async fn handle_frame(
    frame: Frame,
    state: &AppState,
    forward_tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut Subscriptions,
) -> Flow {
    match frame.command {
        Command::Subscribe => {
            let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) else {
                reject(forward_tx, "SUBSCRIBE requires id and destination");
                return Flow::Close;
            };
            let Some(room) = destination
                .starts_with(TOPIC_PREFIX)
                .then(|| room_from_destination(destination))
                .flatten()
            else {
                reject(forward_tx, &format!("unknown destination {}", destination));
                return Flow::Close;
            };
            if subscriptions.entries.contains_key(id) {
                tracing::debug!("Duplicate subscription id {}", id);
                return Flow::Continue;
            }

            tracing::debug!("Subscription {} to room {}", id, room);
            let topic_rx = state.topic(&room).await.subscribe();
            let handle = tokio::spawn(relay(
                topic_rx,
                id.to_string(),
                room_topic(&room),
                forward_tx.clone(),
            ));

            state.track_subscribe(&room).await;
            subscriptions.entries.insert(id.to_string(), (room, handle));
            Flow::Continue
        }

        Command::Unsubscribe => {
            if let Some((room, handle)) = frame.get("id").and_then(|id| subscriptions.entries.remove(id)) {
                tracing::debug!("Unsubscribed from room {}", room);
                handle.abort();
                state.track_unsubscribe(&room).await;
            }
            Flow::Continue
        }

        Command::Send => {
            let Some(room) = frame
                .get("destination")
                .filter(|d| d.starts_with(APP_PREFIX))
                .and_then(room_from_destination)
            else {
                reject(forward_tx, "SEND requires an /app/room/ destination");
                return Flow::Close;
            };
            let outbound: OutboundMessage = match serde_json::from_str(&frame.body) {
                Ok(outbound) => outbound,
                Err(e) => {
                    reject(forward_tx, &format!("invalid message body: {}", e));
                    return Flow::Close;
                }
            };
            if outbound.content.trim().is_empty() {
                reject(forward_tx, "empty message");
                return Flow::Close;
            }

            state.publish(&room, outbound).await;
            send_receipt(&frame, forward_tx);
            Flow::Continue
        }

        Command::Disconnect => {
            send_receipt(&frame, forward_tx);
            Flow::Close
        }

        other => {
            reject(forward_tx, &format!("unexpected {} frame", other));
            Flow::Close
        }
    }
}

/// Forward a room topic to one subscription as MESSAGE frames until the
/// topic closes or the socket's writer goes away. A lagging receiver skips
/// what it missed and keeps going.
async fn relay(
    mut topic_rx: broadcast::Receiver<ChatMessage>,
    sub_id: String,
    topic: String,
    forward: mpsc::UnboundedSender<String>,
) {
    loop {
        let message = match topic_rx.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Subscription {} lagged, skipped {} message(s)", sub_id, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let body = match serde_json::to_string(&RelayedMessage::from(&message)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to encode message {}: {}", message.id, e);
                continue;
            }
        };
        let frame = Frame::new(Command::Message)
            .header("subscription", sub_id.as_str())
            .header("message-id", message.id.as_str())
            .header("destination", topic.as_str())
            .header("content-type", "application/json")
            .with_body(body);
        if forward.send(frame.encode()).is_err() {
            break;
        }
    }
}

fn send_receipt(frame: &Frame, forward_tx: &mpsc::UnboundedSender<String>) {
    if let Some(receipt) = frame.get("receipt") {
        let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
        let _ = forward_tx.send(reply.encode());
    }
}

fn reject(forward_tx: &mpsc::UnboundedSender<String>, reason: &str) {
    tracing::warn!("Protocol error: {}", reason);
    let _ = forward_tx.send(Frame::error(reason, String::new()).encode());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> ChatMessage {
        ChatMessage {
            id: format!("m{}", n),
            room_id: RoomId::from("1"),
            content: format!("hello {}", n),
            sender_id: "u1".to_string(),
            sender_display: None,
            sender_role: SenderRole::User,
            timestamp: "2024-05-01T10:00:00.000Z".to_string(),
            is_optimistic: false,
            client_id: None,
        }
    }

    #[tokio::test]
    async fn relay_survives_a_lagging_receiver() {
        let (topic_tx, topic_rx) = broadcast::channel(2);
        for n in 0..5 {
            topic_tx.send(message(n)).unwrap();
        }
        drop(topic_tx);

        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel();
        relay(topic_rx, "sub-1".to_string(), "/topic/room/1".to_string(), forward_tx).await;

        let mut ids = Vec::new();
        while let Ok(text) = forward_rx.try_recv() {
            let frame = Frame::decode(&text).unwrap().unwrap();
            assert_eq!(frame.command, Command::Message);
            assert_eq!(frame.get("subscription"), Some("sub-1"));
            ids.push(frame.get("message-id").unwrap_or_default().to_string());
        }
        assert_eq!(ids, vec!["m3", "m4"]);
    }
}
