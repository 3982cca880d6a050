//! HTTP client for the REST room directory.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use storetalk_shared::{ApiError, ChatRoom, RoomId, RoomListPage, RoomPage};

/// Default page size for history and room list requests
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// REST collaborator consulted by the cache and room views.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn list_rooms(&self, page: u32, size: u32) -> Result<RoomListPage, ApiError>;

    /// History page for a room; page 0 is the newest
    async fn room_messages(&self, room: &RoomId, page: u32, size: u32)
        -> Result<RoomPage, ApiError>;

    /// Connect handshake, required before subscribing to the room topic
    async fn connect_room(&self, room: &RoomId) -> Result<ChatRoom, ApiError>;

    async fn mark_read(&self, room: &RoomId) -> Result<(), ApiError>;
}

/// HTTP client for the room directory, authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = self
            .authorize(rb)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    /// GET a JSON document
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.get(self.url(path))).await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    /// POST without a body. An empty response decodes as JSON `null`.
    pub async fn post_empty<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.post(self.url(path))).await?;
        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
        }
    }
}

fn room_path(room: &RoomId) -> String {
    format!("/api/rooms/{}", urlencoding::encode(room.as_str()))
}

#[async_trait]
impl RoomDirectory for ApiClient {
    async fn list_rooms(&self, page: u32, size: u32) -> Result<RoomListPage, ApiError> {
        self.get_json(&format!("/api/rooms?page={page}&size={size}"))
            .await
    }

    async fn room_messages(
        &self,
        room: &RoomId,
        page: u32,
        size: u32,
    ) -> Result<RoomPage, ApiError> {
        self.get_json(&format!(
            "{}/messages?page={page}&size={size}",
            room_path(room)
        ))
        .await
    }

    async fn connect_room(&self, room: &RoomId) -> Result<ChatRoom, ApiError> {
        self.post_empty(&format!("{}/connect", room_path(room))).await
    }

    async fn mark_read(&self, room: &RoomId) -> Result<(), ApiError> {
        let _: serde_json::Value = self.post_empty(&format!("{}/read", room_path(room))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_and_path() {
        let api = ApiClient::new().with_base_url("http://localhost:8080/");
        assert_eq!(api.url("/api/rooms"), "http://localhost:8080/api/rooms");
        assert_eq!(api.url("https://other/x"), "https://other/x");
        assert_eq!(ApiClient::new().url("api/rooms"), "/api/rooms");
    }

    #[test]
    fn room_ids_are_escaped_in_paths() {
        assert_eq!(room_path(&RoomId::from("a b")), "/api/rooms/a%20b");
        assert_eq!(room_path(&RoomId::from(7u64)), "/api/rooms/7");
    }

    #[test]
    fn blank_tokens_are_ignored() {
        let api = ApiClient::new().with_token(Some("  ".to_string()));
        assert!(api.token.is_none());
    }
}
