//! Socket task behind a [`TransportSession`].
//!
//! One task per session generation. It performs the STOMP handshake,
//! replays subscriptions, pumps frames both ways, keeps heart-beats going
//! and retries after an established connection drops.

use futures_channel::mpsc::UnboundedReceiver;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use storetalk_shared::{Command, Frame, Heartbeat};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::connection::SessionError;
use super::session::TransportSession;
use crate::config::ChatConfig;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open socket that completed the STOMP handshake
struct Link {
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
    /// Negotiated heart-beat we owe the broker
    outgoing: Option<Duration>,
    /// Negotiated heart-beat we expect from the broker
    incoming: Option<Duration>,
}

enum Exit {
    /// Local disconnect; do not retry
    Shutdown,
    /// The connection dropped underneath us
    Lost(String),
}

pub(crate) async fn run(
    session: TransportSession,
    generation: u64,
    mut outbound: UnboundedReceiver<Frame>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let config = session.config().clone();

    let mut link = tokio::select! {
        result = open(&config) => match result {
            Ok(link) => link,
            Err(e) => {
                session.on_failed(generation, e);
                return;
            }
        },
        _ = &mut shutdown => return,
    };

    loop {
        let Some(replay) = session.on_connected(generation) else {
            return;
        };

        let mut exit = None;
        for frame in replay {
            if let Err(e) = link.write.send(Message::text(frame.encode())).await {
                exit = Some(Exit::Lost(e.to_string()));
                break;
            }
        }
        let exit = match exit {
            Some(exit) => exit,
            None => pump(&session, generation, link, &mut outbound, &mut shutdown).await,
        };

        let mut reason = match exit {
            Exit::Shutdown => return,
            Exit::Lost(reason) => reason,
        };
        crate::log_warn!("connection to {} lost: {}", config.broker_url, reason);

        let mut attempt = 0u32;
        link = loop {
            if config.reconnect.exhausted(attempt) {
                session.on_failed(
                    generation,
                    SessionError::Connection(format!(
                        "gave up after {} reconnect attempts: {}",
                        attempt, reason
                    )),
                );
                return;
            }
            attempt += 1;
            if !session.on_reconnecting(generation, attempt) {
                return;
            }
            discard_stale(&mut outbound);

            let delay = config.reconnect.jittered_delay(attempt - 1);
            crate::log_info!(
                "reconnecting to {} in {}ms (attempt {})",
                config.broker_url,
                delay.as_millis(),
                attempt
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => return,
            }

            let result = tokio::select! {
                result = open(&config) => result,
                _ = &mut shutdown => return,
            };
            match result {
                Ok(link) => break link,
                Err(e) => {
                    crate::log_warn!("reconnect attempt {} failed: {}", attempt, e);
                    reason = e.to_string();
                }
            }
        };
    }
}

/// Open the socket and run the CONNECT/CONNECTED exchange, bounded by the
/// configured connect timeout.
async fn open(config: &ChatConfig) -> Result<Link, SessionError> {
    let handshake = async {
        let (stream, _response) = connect_async(config.broker_url.as_str())
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let connect = Frame::connect(
            &broker_host(&config.broker_url),
            config.token.as_deref(),
            config.heartbeat,
        );
        write
            .send(Message::text(connect.encode()))
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        loop {
            let message = match read.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(SessionError::Connection(e.to_string())),
                None => {
                    return Err(SessionError::Connection(
                        "socket closed during handshake".to_string(),
                    ))
                }
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(SessionError::Connection(
                        "broker closed the socket during handshake".to_string(),
                    ))
                }
                _ => continue,
            };

            match Frame::decode(text.as_str()) {
                Ok(None) => continue,
                Ok(Some(frame)) if frame.command == Command::Connected => {
                    let peer = frame
                        .get("heart-beat")
                        .and_then(Heartbeat::parse)
                        .unwrap_or_default();
                    let (outgoing, incoming) = config.heartbeat.negotiate(&peer);
                    return Ok(Link {
                        write,
                        read,
                        outgoing,
                        incoming,
                    });
                }
                Ok(Some(frame)) if frame.command == Command::Error => {
                    let reason = frame.get("message").unwrap_or("broker rejected CONNECT");
                    return Err(SessionError::Connection(reason.to_string()));
                }
                Ok(Some(frame)) => {
                    crate::log_debug!("ignoring {} before CONNECTED", frame.command);
                }
                Err(e) => {
                    return Err(SessionError::Connection(format!(
                        "malformed frame during handshake: {}",
                        e
                    )))
                }
            }
        }
    };

    match tokio::time::timeout(config.connect_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ConnectionTimeout(config.connect_timeout)),
    }
}

async fn pump(
    session: &TransportSession,
    generation: u64,
    link: Link,
    outbound: &mut UnboundedReceiver<Frame>,
    shutdown: &mut oneshot::Receiver<()>,
) -> Exit {
    let Link {
        mut write,
        mut read,
        outgoing,
        incoming,
    } = link;

    let mut beat = outgoing.map(ticker);
    let mut watchdog = incoming.map(ticker);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                while let Ok(Some(frame)) = outbound.try_next() {
                    if write.send(Message::text(frame.encode())).await.is_err() {
                        break;
                    }
                }
                let _ = write.close().await;
                return Exit::Shutdown;
            }
            frame = outbound.next() => match frame {
                Some(frame) => {
                    crate::log_debug!("sending {}", frame.command);
                    if let Err(e) = write.send(Message::text(frame.encode())).await {
                        return Exit::Lost(e.to_string());
                    }
                }
                None => {
                    let _ = write.close().await;
                    return Exit::Shutdown;
                }
            },
            message = read.next() => {
                last_seen = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(None) => {}
                        Ok(Some(frame)) => match frame.command {
                            Command::Message => session.dispatch(generation, &frame),
                            Command::Error => {
                                let reason = frame.get("message").unwrap_or("unspecified");
                                return Exit::Lost(format!("broker error: {}", reason));
                            }
                            other => crate::log_debug!("ignoring {} frame", other),
                        },
                        Err(e) => crate::log_warn!("dropping malformed frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Exit::Lost("socket closed by broker".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                }
            }
            _ = tick(&mut beat) => {
                if let Err(e) = write.send(Message::text("\n")).await {
                    return Exit::Lost(e.to_string());
                }
            }
            _ = tick(&mut watchdog) => {
                if let Some(interval) = incoming {
                    if last_seen.elapsed() > interval * 2 {
                        return Exit::Lost(format!(
                            "no traffic from broker for {}ms",
                            last_seen.elapsed().as_millis()
                        ));
                    }
                }
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Resolves on the next tick, or never when the timer is disabled.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Frames queued for a socket that no longer exists
fn discard_stale(outbound: &mut UnboundedReceiver<Frame>) {
    let mut dropped = 0usize;
    while let Ok(Some(_)) = outbound.try_next() {
        dropped += 1;
    }
    if dropped > 0 {
        crate::log_debug!("discarded {} frame(s) queued for the lost socket", dropped);
    }
}

/// Value for the CONNECT `host` header
fn broker_host(broker_url: &str) -> String {
    url::Url::parse(broker_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_comes_from_the_broker_url() {
        assert_eq!(broker_host("ws://chat.example.com:8080/ws"), "chat.example.com");
        assert_eq!(broker_host("not a url"), "localhost");
    }

    #[tokio::test]
    async fn disabled_timer_never_fires() {
        let mut disabled = None;
        let fired = tokio::time::timeout(Duration::from_millis(20), tick(&mut disabled)).await;
        assert!(fired.is_err());
    }

    #[test]
    fn stale_frames_are_discarded() {
        let (tx, mut rx) = futures_channel::mpsc::unbounded();
        tx.unbounded_send(Frame::unsubscribe("sub-1")).unwrap();
        tx.unbounded_send(Frame::unsubscribe("sub-2")).unwrap();
        discard_stale(&mut rx);
        assert!(rx.try_next().is_err());
    }
}
