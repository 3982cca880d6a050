//! Storetalk terminal client
//!
//! Opens one chat room, prints inbound messages and sends every stdin line.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use storetalk_client::{
    logging, ApiClient, ChatCache, ChatConfig, Participant, RoomChat, Storage, TransportSession,
};
use storetalk_shared::{ChatMessage, RoomId, SenderRole};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "storetalk", version, about = "Terminal client for storetalk chat rooms")]
struct Cli {
    /// Room to open
    room: String,
    /// Broker WebSocket URL
    #[arg(long, env = "STORETALK_BROKER_URL")]
    broker_url: Option<String>,
    /// REST base URL
    #[arg(long, env = "STORETALK_API_URL")]
    api_url: Option<String>,
    /// Bearer token; falls back to the stored token
    #[arg(long, env = "STORETALK_TOKEN")]
    token: Option<String>,
    /// Sender id for outbound messages
    #[arg(long, default_value = "me")]
    user: String,
    /// `user` or `owner`
    #[arg(long, default_value = "user")]
    role: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("storetalk_client=debug");

    let cli = Cli::parse();
    let mut config = ChatConfig::from_env();
    if let Some(url) = cli.broker_url {
        config.broker_url = url;
    }
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    let token = cli
        .token
        .or_else(|| Storage::platform().and_then(|s| s.token()));
    let config = config.with_token(token);

    let role = SenderRole::parse(&cli.role)
        .with_context(|| format!("unknown role {:?}", cli.role))?;
    let participant = Participant::new(cli.user, role);

    let directory = Arc::new(
        ApiClient::new()
            .with_base_url(config.api_url.clone())
            .with_token(config.token.clone()),
    );
    let cache = ChatCache::new();
    let session = TransportSession::with_cache(config, cache.clone());

    let room_id = RoomId::new(cli.room);
    let opened =
        RoomChat::open(session.clone(), directory, cache, room_id.clone(), participant).await;
    let mut chat = match opened {
        Ok(chat) => chat,
        Err(e) => anyhow::bail!("failed to open room {}: {}", room_id, e.user_message()),
    };

    println!("-- {} --", chat.room().counterpart_name);
    for message in chat.messages() {
        print_message(&message);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if line.trim() == "/older" {
                    match chat.load_older().await {
                        Ok(loaded) => println!("-- loaded {} older message(s) --", loaded),
                        Err(e) => eprintln!("could not load history: {}", e.user_message()),
                    }
                    continue;
                }
                if let Err(e) = chat.send(&line) {
                    eprintln!("not sent: {}", e.user_message());
                }
            }
            message = chat.next_event() => match message {
                Some(message) => print_message(&message),
                None => break,
            },
        }
    }

    chat.close();
    session.disconnect();
    Ok(())
}

fn print_message(message: &ChatMessage) {
    let who = message
        .sender_display
        .as_deref()
        .unwrap_or(&message.sender_id);
    println!("[{}] {}: {}", message.timestamp, who, message.content);
}
