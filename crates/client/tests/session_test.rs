use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use storetalk_client::ws::ReconnectConfig;
use storetalk_client::{ChatCache, ChatConfig, ConnectionState, SessionError, TransportSession};
use storetalk_server::{start, RunningServer, ServerConfig};
use storetalk_shared::{ChatRoom, Frame, Heartbeat, OutboundMessage, RoomId, SenderRole};
use tokio_tungstenite::tungstenite::Message;

async fn broker() -> RunningServer {
    start(ServerConfig::local()).await.expect("broker should bind")
}

fn config_for(server: &RunningServer) -> ChatConfig {
    ChatConfig {
        broker_url: server.ws_url(),
        api_url: server.api_url(),
        connect_timeout: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 20,
            max_delay_ms: 200,
            backoff_multiplier: 2.0,
        },
        ..ChatConfig::default()
    }
}

fn outbound(room: &str, content: &str) -> OutboundMessage {
    OutboundMessage {
        room_id: RoomId::from(room),
        content: content.to_string(),
        sender: "u2".to_string(),
        sender_role: SenderRole::Owner,
        client_id: "c-1".to_string(),
        timestamp: String::new(),
    }
}

async fn wait_for_subscribers(server: &RunningServer, room: &str, expected: usize) -> usize {
    let room = RoomId::from(room);
    let mut count = 0;
    for _ in 0..100 {
        count = server.state.subscriber_count(&room).await;
        if count == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    count
}

async fn wait_for_state(
    session: &TransportSession,
    done: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut state = session.state();
    for _ in 0..200 {
        if done(&state) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = session.state();
    }
    state
}

#[tokio::test]
async fn concurrent_and_repeated_connects_share_one_socket() {
    let server = broker().await;
    let session = TransportSession::new(config_for(&server));

    let (first, second) = tokio::join!(session.connect(), session.connect());
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(session.connect().await, Ok(()));

    assert!(session.is_connected());
    assert_eq!(server.state.connections_opened(), 1);
}

#[tokio::test]
async fn pending_subscriptions_replay_once_per_room() {
    let server = broker().await;
    let session = TransportSession::new(config_for(&server));

    let _a = session.subscribe("A");
    let _b = session.subscribe("B");
    let _a_again = session.subscribe("A");
    assert_eq!(session.subscribed_rooms(), vec![RoomId::from("A"), RoomId::from("B")]);

    session.connect().await.unwrap();

    assert_eq!(wait_for_subscribers(&server, "A", 1).await, 1);
    assert_eq!(wait_for_subscribers(&server, "B", 1).await, 1);
}

#[tokio::test]
async fn send_requires_a_connection() {
    let server = broker().await;
    let session = TransportSession::new(config_for(&server));

    let result = session.send_message(&RoomId::from("A"), &outbound("A", "hi"));
    assert_eq!(result, Err(SessionError::NotConnected));
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let blank = session.send_message(&RoomId::from("A"), &outbound("A", "  "));
    assert_eq!(blank, Err(SessionError::EmptyMessage));
}

#[tokio::test]
async fn messages_reach_subscribers_and_patch_the_cache() {
    let server = broker().await;

    let cache = ChatCache::new();
    cache.set_rooms(vec![ChatRoom {
        id: RoomId::from("5"),
        counterpart_name: "Bakery".to_string(),
        store_name: None,
        last_message: None,
        last_message_time: None,
        unread_count: 0,
    }]);
    let listener = TransportSession::with_cache(config_for(&server), cache.clone());
    let mut events = listener.subscribe(RoomId::from(5u64));
    listener.connect().await.unwrap();
    wait_for_subscribers(&server, "5", 1).await;

    let sender = TransportSession::new(config_for(&server));
    sender.connect().await.unwrap();
    sender
        .send_message(&RoomId::from("5"), &outbound("5", "fresh bread"))
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("message within timeout")
        .expect("stream open");
    assert_eq!(message.content, "fresh bread");
    assert_eq!(message.sender_id, "u2");
    assert_eq!(message.sender_role, SenderRole::Owner);
    assert_eq!(message.room_id, RoomId::from("5"));
    assert_eq!(message.client_id.as_deref(), Some("c-1"));
    assert!(!message.is_optimistic);

    let room = cache.room(&RoomId::from("5")).unwrap();
    assert_eq!(room.unread_count, 1);
    assert_eq!(room.last_message.as_deref(), Some("fresh bread"));
}

#[tokio::test]
async fn disconnect_clears_everything() {
    let server = broker().await;
    let session = TransportSession::new(config_for(&server));
    let mut events = session.subscribe("A");
    session.connect().await.unwrap();
    assert_eq!(wait_for_subscribers(&server, "A", 1).await, 1);

    session.disconnect();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.subscribed_rooms().is_empty());
    assert!(events.recv().await.is_none());
    assert_eq!(wait_for_subscribers(&server, "A", 0).await, 0);

    session.connect().await.unwrap();
    assert_eq!(server.state.connections_opened(), 2);
    assert_eq!(server.state.subscriber_count(&RoomId::from("A")).await, 0);
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resubscribes() {
    let server = broker().await;
    let session = TransportSession::new(config_for(&server));
    let mut events = session.subscribe("R");
    session.connect().await.unwrap();
    assert_eq!(wait_for_subscribers(&server, "R", 1).await, 1);

    server.state.drop_connections();

    for _ in 0..100 {
        if server.state.connections_opened() == 2 && session.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.state.connections_opened(), 2);
    assert!(session.is_connected());
    assert_eq!(wait_for_subscribers(&server, "R", 1).await, 1);

    server
        .state
        .publish(&RoomId::from("R"), outbound("R", "after reconnect"))
        .await;
    let message = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("message within timeout")
        .expect("stream open");
    assert_eq!(message.content, "after reconnect");
}

#[tokio::test]
async fn refused_connection_fails_without_retry() {
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let session = TransportSession::new(ChatConfig {
        broker_url: format!("ws://127.0.0.1:{port}/ws"),
        ..ChatConfig::default()
    });

    let result = session.connect().await;
    assert!(matches!(result, Err(SessionError::Connection(_))), "{result:?}");
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn silent_broker_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accept = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let session = TransportSession::new(ChatConfig {
        broker_url: format!("ws://{addr}/ws"),
        connect_timeout: Duration::from_millis(200),
        ..ChatConfig::default()
    });

    let result = session.connect().await;
    assert_eq!(result, Err(SessionError::ConnectionTimeout(Duration::from_millis(200))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_rejects_pending_connect() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accept = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let session = TransportSession::new(ChatConfig {
        broker_url: format!("ws://{addr}/ws"),
        ..ChatConfig::default()
    });

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    for _ in 0..50 {
        if session.state() == ConnectionState::Connecting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.disconnect();

    let result = pending.await.unwrap();
    assert_eq!(result, Err(SessionError::Closed));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn missed_heartbeats_count_as_a_lost_connection() {
    // Completes the handshake with a 100ms heart-beat promise, then goes quiet
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _broker = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            let Ok(mut socket) = tokio_tungstenite::accept_async(tcp).await else {
                continue;
            };
            let _connect = socket.next().await;
            let connected = Frame::connected(Heartbeat::new(100, 0)).encode();
            let _ = socket.send(Message::text(connected)).await;
            held.push(socket);
        }
    });

    let session = TransportSession::new(ChatConfig {
        broker_url: format!("ws://{addr}/ws"),
        heartbeat: Heartbeat::new(0, 100),
        reconnect: ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 1.0,
        },
        ..ChatConfig::default()
    });
    session.connect().await.unwrap();
    assert!(session.is_connected());

    let state = wait_for_state(&session, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
    assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });
    session.disconnect();
}

#[tokio::test]
async fn exhausted_reconnects_end_disconnected() {
    let server = broker().await;
    let session = TransportSession::new(ChatConfig {
        reconnect: ReconnectConfig {
            max_attempts: 2,
            initial_delay_ms: 150,
            max_delay_ms: 150,
            backoff_multiplier: 1.0,
        },
        ..config_for(&server)
    });
    let _events = session.subscribe("X");
    session.connect().await.unwrap();

    // Stop listening, then cut the live socket
    let state = server.state.clone();
    drop(server);
    state.drop_connections();

    let reconnecting =
        wait_for_state(&session, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
    assert!(matches!(reconnecting, ConnectionState::Reconnecting { .. }), "{reconnecting:?}");

    let joined = tokio::time::timeout(Duration::from_secs(5), session.connect())
        .await
        .expect("gives up within timeout");
    assert!(matches!(joined, Err(SessionError::Connection(_))), "{joined:?}");
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.subscribed_rooms(), vec![RoomId::from("X")]);
}
