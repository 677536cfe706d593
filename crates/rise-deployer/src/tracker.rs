//! Analytics event emission.
//!
//! Tracking is post-commit and best-effort: the worker logs and swallows
//! every failure here. A deployment that committed never regresses
//! because an analytics endpoint was down.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from event tracking.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracking backend error: {0}")]
    Backend(String),
}

/// Emits analytics events for a user.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn track(
        &self,
        user_id: &str,
        event: &str,
        properties: serde_json::Value,
    ) -> Result<(), TrackError>;
}

/// Discards every event. The default outside production.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

#[async_trait]
impl Tracker for NoopTracker {
    async fn track(
        &self,
        _user_id: &str,
        _event: &str,
        _properties: serde_json::Value,
    ) -> Result<(), TrackError> {
        Ok(())
    }
}

/// An event captured by [`RecordingTracker`].
#[derive(Debug, Clone)]
pub struct TrackedEvent {
    pub user_id: String,
    pub event: String,
    pub properties: serde_json::Value,
}

/// Records events for test assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracker {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
}

impl RecordingTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().expect("tracker lock poisoned").clone()
    }
}

#[async_trait]
impl Tracker for RecordingTracker {
    async fn track(
        &self,
        user_id: &str,
        event: &str,
        properties: serde_json::Value,
    ) -> Result<(), TrackError> {
        self.events
            .lock()
            .expect("tracker lock poisoned")
            .push(TrackedEvent {
                user_id: user_id.to_owned(),
                event: event.to_owned(),
                properties,
            });
        Ok(())
    }
}

/// Posts events as JSON to an analytics collector.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTracker {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn track(
        &self,
        user_id: &str,
        event: &str,
        properties: serde_json::Value,
    ) -> Result<(), TrackError> {
        let body = serde_json::json!({
            "user_id": user_id,
            "event": event,
            "properties": properties,
        });

        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(TrackError::Backend(format!(
                "collector returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_tracker_captures_events() {
        let tracker = RecordingTracker::new();

        tracker
            .track("17", "Project Deployed", serde_json::json!({"projectName": "x"}))
            .await
            .unwrap();

        let events = tracker.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "17");
        assert_eq!(events[0].event, "Project Deployed");
    }
}
