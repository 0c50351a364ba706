use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use macfind_types::api::{MarkReadResponse, SendMessageRequest, StatusUpdateRequest};
use macfind_types::events::{FeedFilter, RealtimeCommand, RealtimeEvent};
use macfind_types::models::{Item, ItemStatus, Message, NewContent};

use crate::backend::{ChangeFeed, MessageStore, Subscription};
use crate::error::{Result, SyncError};

/// How long to wait for the server to acknowledge a realtime subscription.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP + WebSocket backend talking to a MacFind server. Each user acts
/// through their own session token.
pub struct RemoteBackend {
    base_url: String,
    client: reqwest::Client,
    sessions: RwLock<HashMap<Uuid, String>>,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register the session token used for requests made on behalf of `user`.
    pub fn add_session(&self, user: Uuid, token: impl Into<String>) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user, token.into());
    }

    pub fn remove_session(&self, user: Uuid) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&user);
    }

    fn token(&self, user: Uuid) -> Result<String> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user)
            .cloned()
            .ok_or(SyncError::NoSession(user))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn realtime_url(&self, token: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/realtime?token={}", ws_base, token)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, user: Uuid, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.token(user)?)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn send_json<B, T>(&self, method: reqwest::Method, user: Uuid, path: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .request(method, self.url(path))
            .bearer_auth(self.token(user)?)
            .json(body)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

#[async_trait]
impl MessageStore for RemoteBackend {
    async fn unread_messages(&self, user: Uuid) -> Result<Vec<Message>> {
        self.get(user, "/messages/unread").await
    }

    async fn thread_messages(&self, item_id: Uuid, viewer: Uuid, other: Uuid) -> Result<Vec<Message>> {
        self.get(viewer, &format!("/items/{}/messages?with={}", item_id, other))
            .await
    }

    async fn send_message(
        &self,
        sender: Uuid,
        item_id: Uuid,
        receiver: Uuid,
        content: NewContent,
    ) -> Result<Message> {
        let (body, confirm) = match content {
            NewContent::Text(body) => (Some(body), None),
            NewContent::Confirm(kind) => (None, Some(kind)),
        };
        let req = SendMessageRequest {
            receiver_id: receiver,
            body,
            confirm,
        };
        self.send_json(reqwest::Method::POST, sender, &format!("/items/{}/messages", item_id), &req)
            .await
    }

    async fn mark_thread_read(&self, item_id: Uuid, counterparty: Uuid, receiver: Uuid) -> Result<usize> {
        let response: MarkReadResponse = self
            .send_json(
                reqwest::Method::POST,
                receiver,
                &format!("/items/{}/threads/{}/read", item_id, counterparty),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.updated)
    }

    async fn mark_message_read(&self, message_id: Uuid, receiver: Uuid) -> Result<bool> {
        let response: MarkReadResponse = self
            .send_json(
                reqwest::Method::POST,
                receiver,
                &format!("/messages/{}/read", message_id),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.updated > 0)
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>> {
        let response = self
            .client
            .get(self.url(&format!("/items/{}", item_id)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::read_json(response).await?))
    }

    async fn set_item_status(&self, item_id: Uuid, actor: Uuid, status: ItemStatus) -> Result<ItemStatus> {
        let response: StatusUpdateRequest = self
            .send_json(
                reqwest::Method::PATCH,
                actor,
                &format!("/items/{}/status", item_id),
                &StatusUpdateRequest { status },
            )
            .await?;
        Ok(response.status)
    }
}

#[async_trait]
impl ChangeFeed for RemoteBackend {
    /// Opens a dedicated WebSocket for this subscription and returns once the
    /// server has acknowledged it.
    async fn subscribe(&self, user: Uuid, filter: FeedFilter) -> Result<Subscription> {
        let url = self.realtime_url(&self.token(user)?);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let sub_id = Uuid::new_v4();
        let cmd = serde_json::to_string(&RealtimeCommand::Subscribe { sub_id, filter })?;
        sink.send(WsMessage::Text(cmd.into())).await?;

        let (tx, rx) = mpsc::unbounded_channel();

        // Wait for the ack so no change published after this call is missed.
        // Changes can overtake the ack on the wire; those are queued as-is.
        let ack = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            while let Some(frame) = stream.next().await {
                let WsMessage::Text(text) = frame? else { continue };
                match serde_json::from_str::<RealtimeEvent>(&text)? {
                    RealtimeEvent::Subscribed { sub_id: acked, .. } if acked == sub_id => return Ok(()),
                    RealtimeEvent::Change { sub_id: id, change } if id == sub_id => {
                        let _ = tx.send(change);
                    }
                    RealtimeEvent::Error { message } => return Err(SyncError::Rejected(message)),
                    _ => {}
                }
            }
            Err(SyncError::Rejected("connection closed before subscribe".into()))
        })
        .await
        .map_err(|_| SyncError::Timeout("realtime subscribe"))?;
        ack?;
        debug!("Realtime subscription {} open for {}", sub_id, user);

        let task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    // tungstenite answers pings itself; flush the queued pong.
                    Ok(WsMessage::Ping(_)) => {
                        if sink.flush().await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Realtime connection error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<RealtimeEvent>(&text) {
                    Ok(RealtimeEvent::Change { sub_id: id, change }) if id == sub_id => {
                        if tx.send(change).is_err() {
                            break;
                        }
                    }
                    Ok(RealtimeEvent::Error { message }) => warn!("Realtime error: {}", message),
                    Ok(_) => {}
                    Err(e) => warn!("Bad realtime frame: {}", e),
                }
            }
            info!("Realtime subscription {} closed", sub_id);
        });

        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_url_follows_scheme() {
        let remote = RemoteBackend::new("https://macfind.example/");
        assert_eq!(remote.realtime_url("t"), "wss://macfind.example/realtime?token=t");

        let local = RemoteBackend::new("http://127.0.0.1:3001");
        assert_eq!(local.realtime_url("t"), "ws://127.0.0.1:3001/realtime?token=t");
    }

    #[tokio::test]
    async fn requests_without_a_session_fail_fast() {
        let remote = RemoteBackend::new("http://127.0.0.1:1");
        let user = Uuid::new_v4();
        assert!(matches!(remote.unread_messages(user).await, Err(SyncError::NoSession(id)) if id == user));

        remote.add_session(user, "token");
        remote.remove_session(user);
        assert!(matches!(remote.token(user), Err(SyncError::NoSession(_))));
    }
}
