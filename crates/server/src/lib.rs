//! Storetalk development broker
//!
//! STOMP-over-WebSocket relay for room topics plus the REST room directory,
//! all in memory.

pub mod config;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Rooms
        .route("/api/rooms", get(routes::rooms::list_rooms))
        .route("/api/rooms/{room_id}", get(routes::rooms::get_room))
        .route("/api/rooms/{room_id}/messages", get(routes::rooms::list_messages))
        .route("/api/rooms/{room_id}/connect", post(routes::rooms::connect_room))
        .route("/api/rooms/{room_id}/read", post(routes::rooms::mark_read))
        // Broker
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// A server bound to a local port, stopped when dropped.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub state: AppState,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind `config.bind` and serve in a background task.
pub async fn start(config: ServerConfig) -> std::io::Result<RunningServer> {
    let listener = TcpListener::bind(config.bind).await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(config);
    let app = router(state.clone());

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server stopped: {}", e);
        }
    });

    Ok(RunningServer { addr, state, task })
}
