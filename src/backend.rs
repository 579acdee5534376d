//! REST backend seam.
//!
//! [`Backend`] is the async contract the resolver and controller consume;
//! [`HttpBackend`] implements it over a timeout-configured blocking agent
//! driven from `spawn_blocking`, so a timeout surfaces exactly like any
//! other transport failure. Tests inject their own `Backend` instead.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::RelationshipStatus;

#[derive(Debug)]
pub enum BackendError {
    /// Connection, DNS, or timeout failure before a response arrived.
    Transport(String),
    /// The server answered with a non-success status.
    Status(u16),
    /// The response body could not be decoded.
    Decode(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Transport(error) => write!(f, "transport error: {error}"),
            BackendError::Status(code) => write!(f, "server returned status {code}"),
            BackendError::Decode(error) => write!(f, "decode error: {error}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// The REST endpoints this subsystem consumes. Exact paths are an
/// implementation detail of [`HttpBackend`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the persisted notification history page for the session user.
    /// Returns raw payloads; normalization happens in the caller's pipeline.
    async fn fetch_history(&self) -> Result<Vec<Value>, BackendError>;

    async fn mark_read(&self, id: &str) -> Result<(), BackendError>;

    async fn mark_all_read(&self) -> Result<(), BackendError>;

    /// Accept a friend request; returns the updated relationship status.
    async fn accept_request(&self, request_id: &str) -> Result<RelationshipStatus, BackendError>;

    /// Decline a friend request; returns the updated relationship status.
    async fn decline_request(&self, request_id: &str) -> Result<RelationshipStatus, BackendError>;

    async fn delete_notification(&self, id: &str) -> Result<(), BackendError>;
}

fn map_ureq(err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(code, _) => BackendError::Status(code),
        other => BackendError::Transport(other.to_string()),
    }
}

/// JSON-over-HTTP implementation of [`Backend`].
pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
    user_id: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, user_id: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, url: String) -> Result<Value, BackendError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            let response = agent.get(&url).call().map_err(map_ureq)?;
            response
                .into_json::<Value>()
                .map_err(|e| BackendError::Decode(e.to_string()))
        })
        .await
        .map_err(|e| BackendError::Transport(format!("request task failed: {e}")))?
    }

    async fn post_json(&self, url: String) -> Result<Value, BackendError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            let response = agent
                .post(&url)
                .send_json(serde_json::json!({}))
                .map_err(map_ureq)?;
            response
                .into_json::<Value>()
                .map_err(|e| BackendError::Decode(e.to_string()))
        })
        .await
        .map_err(|e| BackendError::Transport(format!("request task failed: {e}")))?
    }

    async fn delete(&self, url: String) -> Result<(), BackendError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            agent.delete(&url).call().map_err(map_ureq)?;
            Ok(())
        })
        .await
        .map_err(|e| BackendError::Transport(format!("request task failed: {e}")))?
    }
}

fn status_from_value(value: &Value) -> Result<RelationshipStatus, BackendError> {
    value
        .get("status")
        .and_then(Value::as_str)
        .and_then(RelationshipStatus::from_wire)
        .ok_or_else(|| BackendError::Decode("missing relationship status".to_string()))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_history(&self) -> Result<Vec<Value>, BackendError> {
        let url = self.url(&format!("/api/notifications?user_id={}", self.user_id));
        let body = self.get_json(url).await?;
        body.as_array()
            .cloned()
            .ok_or_else(|| BackendError::Decode("history page is not an array".to_string()))
    }

    async fn mark_read(&self, id: &str) -> Result<(), BackendError> {
        let url = self.url(&format!("/api/notifications/{id}/read"));
        self.post_json(url).await.map(|_| ())
    }

    async fn mark_all_read(&self) -> Result<(), BackendError> {
        let url = self.url("/api/notifications/read-all");
        self.post_json(url).await.map(|_| ())
    }

    async fn accept_request(&self, request_id: &str) -> Result<RelationshipStatus, BackendError> {
        let url = self.url(&format!("/api/requests/{request_id}/accept"));
        let body = self.post_json(url).await?;
        status_from_value(&body)
    }

    async fn decline_request(&self, request_id: &str) -> Result<RelationshipStatus, BackendError> {
        let url = self.url(&format!("/api/requests/{request_id}/decline"));
        let body = self.post_json(url).await?;
        status_from_value(&body)
    }

    async fn delete_notification(&self, id: &str) -> Result<(), BackendError> {
        let url = self.url(&format!("/api/notifications/{id}"));
        self.delete(url).await
    }
}
